//! Local mirror of the router state, with pending-change records for
//! optimistic writes.
//!
//! A write updates the mirror immediately and records
//! `{target, old, new}`; the next authoritative update for the same
//! target clears the record, and a NAK rolls back every pending record
//! of that kind. At most one record exists per `(kind, target)` - a
//! second optimistic write to the same target replaces the record but
//! keeps the original pre-write value so a rollback restores the last
//! server-confirmed state.

use std::collections::{BTreeMap, HashMap};

use crosspoint_core::{LockView, RouteChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRoute {
    pub level: u32,
    pub dest: u32,
    pub old_src: u32,
    pub new_src: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLock {
    pub dest: u32,
    pub old: LockView,
    pub new: LockView,
}

/// Client-side copy of the router state.
#[derive(Debug, Clone, Default)]
pub struct Mirror {
    pub inputs: Option<u32>,
    pub outputs: Option<u32>,
    pub levels: u32,
    pub model_name: String,
    pub friendly_name: String,
    /// `(level, dest) -> src`.
    pub routes: HashMap<(u32, u32), u32>,
    pub input_labels: BTreeMap<u32, String>,
    pub output_labels: BTreeMap<u32, String>,
    pub level_names: BTreeMap<u32, String>,
    pub locks: HashMap<u32, LockView>,
    pending_routes: Vec<PendingRoute>,
    pending_locks: Vec<PendingLock>,
}

impl Mirror {
    pub fn new() -> Self {
        Self {
            levels: 1,
            ..Self::default()
        }
    }

    /// Initial state: counts plus at least one routing entry known.
    pub fn initial_state_known(&self) -> bool {
        self.inputs.is_some() && self.outputs.is_some() && !self.routes.is_empty()
    }

    pub fn route(&self, level: u32, dest: u32) -> Option<u32> {
        self.routes.get(&(level, dest)).copied()
    }

    pub fn lock_view(&self, dest: u32) -> LockView {
        self.locks.get(&dest).copied().unwrap_or(LockView::Unlocked)
    }

    pub fn pending_route_count(&self) -> usize {
        self.pending_routes.len()
    }

    pub fn pending_lock_count(&self) -> usize {
        self.pending_locks.len()
    }

    /// Authoritative routing entry from the router: clears any pending
    /// record on the same target and overwrites the mirror.
    pub fn route_confirmed(&mut self, level: u32, dest: u32, src: u32) -> RouteChange {
        self.pending_routes
            .retain(|p| !(p.level == level && p.dest == dest));
        self.routes.insert((level, dest), src);
        RouteChange { level, dest, src }
    }

    /// Optimistic local route write. Replaces an existing record on the
    /// same target while preserving its original pre-write value.
    pub fn route_optimistic(&mut self, level: u32, dest: u32, src: u32) -> RouteChange {
        let old_src = match self
            .pending_routes
            .iter()
            .position(|p| p.level == level && p.dest == dest)
        {
            Some(i) => self.pending_routes.remove(i).old_src,
            None => self.route(level, dest).unwrap_or(dest),
        };
        self.pending_routes.push(PendingRoute {
            level,
            dest,
            old_src,
            new_src: src,
        });
        self.routes.insert((level, dest), src);
        RouteChange { level, dest, src }
    }

    /// NAK rollback: restore every pending route to its pre-write value.
    pub fn rollback_routes(&mut self) -> Vec<RouteChange> {
        let pending = std::mem::take(&mut self.pending_routes);
        pending
            .into_iter()
            .map(|p| {
                self.routes.insert((p.level, p.dest), p.old_src);
                RouteChange {
                    level: p.level,
                    dest: p.dest,
                    src: p.old_src,
                }
            })
            .collect()
    }

    /// Authoritative lock state from the router.
    pub fn lock_confirmed(&mut self, dest: u32, view: LockView) {
        self.pending_locks.retain(|p| p.dest != dest);
        self.locks.insert(dest, view);
    }

    /// Optimistic local lock write.
    pub fn lock_optimistic(&mut self, dest: u32, view: LockView) {
        let old = match self.pending_locks.iter().position(|p| p.dest == dest) {
            Some(i) => self.pending_locks.remove(i).old,
            None => self.lock_view(dest),
        };
        self.pending_locks.push(PendingLock {
            dest,
            old,
            new: view,
        });
        self.locks.insert(dest, view);
    }

    /// NAK rollback for locks.
    pub fn rollback_locks(&mut self) -> Vec<(u32, LockView)> {
        let pending = std::mem::take(&mut self.pending_locks);
        pending
            .into_iter()
            .map(|p| {
                self.locks.insert(p.dest, p.old);
                (p.dest, p.old)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_requires_counts_and_a_route() {
        let mut m = Mirror::new();
        assert!(!m.initial_state_known());
        m.inputs = Some(12);
        m.outputs = Some(12);
        assert!(!m.initial_state_known());
        m.route_confirmed(0, 0, 0);
        assert!(m.initial_state_known());
    }

    #[test]
    fn test_authoritative_clears_matching_pending_only() {
        let mut m = Mirror::new();
        m.route_confirmed(0, 3, 3);
        m.route_confirmed(0, 4, 4);

        m.route_optimistic(0, 3, 7);
        m.route_optimistic(0, 4, 8);
        assert_eq!(m.pending_route_count(), 2);

        m.route_confirmed(0, 3, 7);
        assert_eq!(m.pending_route_count(), 1);
        assert_eq!(m.route(0, 3), Some(7));
    }

    #[test]
    fn test_at_most_one_pending_per_target() {
        let mut m = Mirror::new();
        m.route_confirmed(0, 3, 3);
        m.route_optimistic(0, 3, 7);
        m.route_optimistic(0, 3, 9);
        assert_eq!(m.pending_route_count(), 1);
        assert_eq!(m.route(0, 3), Some(9));

        // rollback restores the server-confirmed value, not the
        // intermediate optimistic one
        let rolled = m.rollback_routes();
        assert_eq!(rolled, vec![RouteChange { level: 0, dest: 3, src: 3 }]);
        assert_eq!(m.route(0, 3), Some(3));
    }

    #[test]
    fn test_nak_rolls_back_every_pending_route() {
        let mut m = Mirror::new();
        m.route_confirmed(0, 1, 1);
        m.route_confirmed(0, 2, 2);
        m.route_optimistic(0, 1, 5);
        m.route_optimistic(0, 2, 6);

        let rolled = m.rollback_routes();
        assert_eq!(rolled.len(), 2);
        assert_eq!(m.route(0, 1), Some(1));
        assert_eq!(m.route(0, 2), Some(2));
        assert_eq!(m.pending_route_count(), 0);
    }

    #[test]
    fn test_lock_pending_lifecycle() {
        let mut m = Mirror::new();
        m.lock_optimistic(0, LockView::Owned);
        assert_eq!(m.lock_view(0), LockView::Owned);
        assert_eq!(m.pending_lock_count(), 1);

        m.lock_confirmed(0, LockView::Owned);
        assert_eq!(m.pending_lock_count(), 0);

        m.lock_optimistic(0, LockView::Unlocked);
        let rolled = m.rollback_locks();
        assert_eq!(rolled, vec![(0, LockView::Owned)]);
        assert_eq!(m.lock_view(0), LockView::Owned);
    }
}
