//! The shared routing model: crosspoint matrix, labels and destination
//! locks, guarded by a single mutex.
//!
//! Every public operation is one critical section. Wire listeners are
//! invoked after a mutation has committed, while the mutex is still
//! held, so the order in which peers observe broadcasts is a
//! linearization of the mutation order. Listeners must only enqueue.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::EngineError;

/// Opaque connection handle used as the lock-owner key.
///
/// Zero is reserved for the local UI caller; accepted connections are
/// numbered from one.
pub type PeerId = u64;

/// Peer id used for mutations originating from the local UI.
pub const LOCAL_PEER: PeerId = 0;

/// Capacity of the model-event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Matrix dimensions and device identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub inputs: u32,
    pub outputs: u32,
    pub levels: u32,
    pub model_name: String,
    pub friendly_name: String,
    pub unique_id: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            inputs: 12,
            outputs: 12,
            levels: 1,
            model_name: "Crosspoint 12x12".to_string(),
            friendly_name: "Crosspoint Router".to_string(),
            unique_id: "C0FFEE000001".to_string(),
        }
    }
}

/// Lock operation carried by a wire or UI request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockOp {
    /// Take ownership. Any client may grab an unlocked port, and a
    /// request on a locked port still transfers ownership (observed
    /// firmware behavior, reproduced deliberately).
    Own,
    /// Release; only the owner may release a held lock.
    Unlock,
    /// Unconditional release.
    Force,
}

/// Lock state as seen by one particular viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockView {
    Owned,
    Locked,
    Unlocked,
}

/// One effective routing change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteChange {
    pub level: u32,
    pub dest: u32,
    pub src: u32,
}

/// One effective lock change, canonical form (wire views are derived).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockChange {
    pub dest: u32,
    pub owner: Option<PeerId>,
}

/// One effective label or level-name change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelChange {
    pub index: u32,
    pub label: String,
}

/// A committed mutation, as fanned out to listeners and subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelEvent {
    RoutingChanged(Vec<RouteChange>),
    LocksChanged(Vec<LockChange>),
    InputLabelsChanged(Vec<LabelChange>),
    OutputLabelsChanged(Vec<LabelChange>),
    LevelNamesChanged(Vec<LabelChange>),
}

/// Result of a batched mutation: the applied subset plus how many
/// entries were rejected (bounds, lock conflict, malformed).
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome<T> {
    pub applied: Vec<T>,
    pub rejected: usize,
}

impl<T> BatchOutcome<T> {
    /// True when the batch contained entries and none was applied.
    pub fn all_rejected(&self) -> bool {
        self.applied.is_empty() && self.rejected > 0
    }
}

/// Point-in-time copy of the whole model, with an optional viewer for
/// peer-relative lock rendering.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub config: RouterConfig,
    /// `routes[level][dest] = src`.
    pub routes: Vec<Vec<u32>>,
    pub input_labels: Vec<String>,
    pub output_labels: Vec<String>,
    pub level_names: Vec<String>,
    /// Lock owner per destination.
    pub locks: Vec<Option<PeerId>>,
    pub viewer: Option<PeerId>,
}

impl Snapshot {
    /// Lock state of `dest` relative to the snapshot's viewer.
    pub fn lock_view(&self, dest: u32) -> LockView {
        match self.locks.get(dest as usize).copied().flatten() {
            None => LockView::Unlocked,
            Some(owner) if Some(owner) == self.viewer => LockView::Owned,
            Some(_) => LockView::Locked,
        }
    }

    pub fn route(&self, level: u32, dest: u32) -> Option<u32> {
        self.routes
            .get(level as usize)
            .and_then(|row| row.get(dest as usize))
            .copied()
    }
}

/// Wire listener: invoked under the model mutex after each commit.
/// The second argument is the originating peer, if any.
pub type WireListener = Box<dyn FnMut(&ModelEvent, Option<PeerId>) + Send>;

struct ModelInner {
    cfg: RouterConfig,
    routes: Vec<Vec<u32>>,
    input_labels: Vec<String>,
    output_labels: Vec<String>,
    level_names: Vec<String>,
    locks: HashMap<u32, PeerId>,
    wire_listeners: Vec<WireListener>,
}

/// The routing model. Thread-safe; clone the `Arc` freely.
pub struct RoutingModel {
    inner: Mutex<ModelInner>,
    events_tx: broadcast::Sender<ModelEvent>,
}

pub fn default_input_label(i: u32) -> String {
    format!("Input {}", i + 1)
}

pub fn default_output_label(o: u32) -> String {
    format!("Output {}", o + 1)
}

pub fn default_level_name(l: u32) -> String {
    if l == 0 {
        "Video".to_string()
    } else {
        format!("Audio {l}")
    }
}

fn default_tables(cfg: &RouterConfig) -> (Vec<Vec<u32>>, Vec<String>, Vec<String>, Vec<String>) {
    let routes = (0..cfg.levels)
        .map(|_| {
            (0..cfg.outputs)
                .map(|d| if d < cfg.inputs { d } else { 0 })
                .collect()
        })
        .collect();
    let input_labels = (0..cfg.inputs).map(default_input_label).collect();
    let output_labels = (0..cfg.outputs).map(default_output_label).collect();
    let level_names = (0..cfg.levels).map(default_level_name).collect();
    (routes, input_labels, output_labels, level_names)
}

impl RoutingModel {
    pub fn new(cfg: RouterConfig) -> Arc<Self> {
        let (routes, input_labels, output_labels, level_names) = default_tables(&cfg);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            inner: Mutex::new(ModelInner {
                cfg,
                routes,
                input_labels,
                output_labels,
                level_names,
                locks: HashMap::new(),
                wire_listeners: Vec::new(),
            }),
            events_tx,
        })
    }

    pub fn config(&self) -> RouterConfig {
        self.inner.lock().cfg.clone()
    }

    /// Replace the matrix configuration, resetting routes and labels to
    /// their defaults and clearing every lock.
    pub fn update_config(&self, cfg: RouterConfig) {
        let mut inner = self.inner.lock();
        let (routes, input_labels, output_labels, level_names) = default_tables(&cfg);
        inner.cfg = cfg;
        inner.routes = routes;
        inner.input_labels = input_labels;
        inner.output_labels = output_labels;
        inner.level_names = level_names;
        let cleared: Vec<LockChange> = inner
            .locks
            .drain()
            .map(|(dest, _)| LockChange { dest, owner: None })
            .collect();

        let all_routes: Vec<RouteChange> = inner
            .routes
            .iter()
            .enumerate()
            .flat_map(|(level, row)| {
                row.iter().enumerate().map(move |(dest, src)| RouteChange {
                    level: level as u32,
                    dest: dest as u32,
                    src: *src,
                })
            })
            .collect();
        self.dispatch(&mut inner, ModelEvent::RoutingChanged(all_routes), None);
        let inputs = label_changes(&inner.input_labels);
        self.dispatch(&mut inner, ModelEvent::InputLabelsChanged(inputs), None);
        let outputs = label_changes(&inner.output_labels);
        self.dispatch(&mut inner, ModelEvent::OutputLabelsChanged(outputs), None);
        let levels = label_changes(&inner.level_names);
        self.dispatch(&mut inner, ModelEvent::LevelNamesChanged(levels), None);
        if !cleared.is_empty() {
            self.dispatch(&mut inner, ModelEvent::LocksChanged(cleared), None);
        }
    }

    /// Take a full snapshot with the given viewer for lock rendering.
    pub fn snapshot(&self, viewer: Option<PeerId>) -> Snapshot {
        let inner = self.inner.lock();
        snapshot_of(&inner, viewer)
    }

    /// Run `f` on a fresh snapshot while the model mutex is held.
    ///
    /// Used when a peer attaches: registering the peer and enqueueing
    /// its initial dump inside the critical section guarantees that no
    /// broadcast lands between the two.
    pub fn with_snapshot<R>(&self, viewer: Option<PeerId>, f: impl FnOnce(&Snapshot) -> R) -> R {
        let inner = self.inner.lock();
        f(&snapshot_of(&inner, viewer))
    }

    pub fn route(&self, level: u32, dest: u32) -> Option<u32> {
        let inner = self.inner.lock();
        inner
            .routes
            .get(level as usize)
            .and_then(|row| row.get(dest as usize))
            .copied()
    }

    pub fn lock_owner(&self, dest: u32) -> Option<PeerId> {
        self.inner.lock().locks.get(&dest).copied()
    }

    /// Route one crosspoint. `Ok(None)` is a no-op write (already
    /// routed there); it is still reported as success.
    pub fn set_route(
        &self,
        level: u32,
        dest: u32,
        src: u32,
        caller: Option<PeerId>,
    ) -> Result<Option<RouteChange>, EngineError> {
        let mut inner = self.inner.lock();
        let change = check_and_route(&mut inner, level, dest, src, caller)?;
        if let Some(change) = change {
            self.dispatch(&mut inner, ModelEvent::RoutingChanged(vec![change]), caller);
        }
        Ok(change)
    }

    /// Batch route write (VideoHub block / GV multi-level take).
    ///
    /// Applies every entry that passes bounds and lock checks, counts
    /// the rest as rejected, and broadcasts the applied subset as one
    /// event. No-op entries are treated as applied.
    pub fn apply_routes(
        &self,
        entries: &[RouteChange],
        caller: Option<PeerId>,
        pre_rejected: usize,
    ) -> BatchOutcome<RouteChange> {
        let mut inner = self.inner.lock();
        let mut outcome = BatchOutcome {
            applied: Vec::new(),
            rejected: pre_rejected,
        };
        for entry in entries {
            match check_and_route(&mut inner, entry.level, entry.dest, entry.src, caller) {
                Ok(_) => outcome.applied.push(*entry),
                Err(_) => outcome.rejected += 1,
            }
        }
        if !outcome.applied.is_empty() {
            self.dispatch(
                &mut inner,
                ModelEvent::RoutingChanged(outcome.applied.clone()),
                caller,
            );
        }
        outcome
    }

    /// Apply one lock operation. `Ok(None)` means no effective change.
    pub fn set_lock(
        &self,
        dest: u32,
        op: LockOp,
        caller: PeerId,
    ) -> Result<Option<LockChange>, EngineError> {
        let mut inner = self.inner.lock();
        let change = check_and_lock(&mut inner, dest, op, caller)?;
        if let Some(change) = change {
            self.dispatch(
                &mut inner,
                ModelEvent::LocksChanged(vec![change]),
                Some(caller),
            );
        }
        Ok(change)
    }

    /// Batch lock write (VideoHub `VIDEO OUTPUT LOCKS` update block).
    pub fn apply_locks(
        &self,
        entries: &[(u32, LockOp)],
        caller: PeerId,
        pre_rejected: usize,
    ) -> BatchOutcome<LockChange> {
        let mut inner = self.inner.lock();
        let mut outcome = BatchOutcome {
            applied: Vec::new(),
            rejected: pre_rejected,
        };
        for (dest, op) in entries {
            match check_and_lock(&mut inner, *dest, *op, caller) {
                Ok(Some(change)) => outcome.applied.push(change),
                // accepted no-ops still count as applied entries
                Ok(None) => outcome.applied.push(LockChange {
                    dest: *dest,
                    owner: inner.locks.get(dest).copied(),
                }),
                Err(_) => outcome.rejected += 1,
            }
        }
        if !outcome.applied.is_empty() {
            self.dispatch(
                &mut inner,
                ModelEvent::LocksChanged(outcome.applied.clone()),
                Some(caller),
            );
        }
        outcome
    }

    pub fn set_input_label(
        &self,
        index: u32,
        label: String,
        origin: Option<PeerId>,
    ) -> Result<Option<LabelChange>, EngineError> {
        match self.apply_labels(LabelTable::Input, &[(index, label)], origin, 0).applied.pop() {
            Some(change) => Ok(Some(change)),
            None => Err(EngineError::Bounds {
                what: "input",
                index,
                max: self.config().inputs.saturating_sub(1),
            }),
        }
    }

    pub fn set_output_label(
        &self,
        index: u32,
        label: String,
        origin: Option<PeerId>,
    ) -> Result<Option<LabelChange>, EngineError> {
        match self.apply_labels(LabelTable::Output, &[(index, label)], origin, 0).applied.pop() {
            Some(change) => Ok(Some(change)),
            None => Err(EngineError::Bounds {
                what: "output",
                index,
                max: self.config().outputs.saturating_sub(1),
            }),
        }
    }

    pub fn set_level_name(
        &self,
        index: u32,
        name: String,
        origin: Option<PeerId>,
    ) -> Result<Option<LabelChange>, EngineError> {
        match self.apply_labels(LabelTable::Level, &[(index, name)], origin, 0).applied.pop() {
            Some(change) => Ok(Some(change)),
            None => Err(EngineError::Bounds {
                what: "level",
                index,
                max: self.config().levels.saturating_sub(1),
            }),
        }
    }

    /// Batch label write; out-of-range entries are rejected, the rest
    /// applied and broadcast as one event.
    pub fn apply_labels(
        &self,
        table: LabelTable,
        entries: &[(u32, String)],
        origin: Option<PeerId>,
        pre_rejected: usize,
    ) -> BatchOutcome<LabelChange> {
        let mut inner = self.inner.lock();
        let mut outcome = BatchOutcome {
            applied: Vec::new(),
            rejected: pre_rejected,
        };
        for (index, label) in entries {
            let slot = match table {
                LabelTable::Input => inner.input_labels.get_mut(*index as usize),
                LabelTable::Output => inner.output_labels.get_mut(*index as usize),
                LabelTable::Level => inner.level_names.get_mut(*index as usize),
            };
            match slot {
                Some(slot) => {
                    *slot = label.clone();
                    outcome.applied.push(LabelChange {
                        index: *index,
                        label: label.clone(),
                    });
                }
                None => outcome.rejected += 1,
            }
        }
        if !outcome.applied.is_empty() {
            let event = match table {
                LabelTable::Input => ModelEvent::InputLabelsChanged(outcome.applied.clone()),
                LabelTable::Output => ModelEvent::OutputLabelsChanged(outcome.applied.clone()),
                LabelTable::Level => ModelEvent::LevelNamesChanged(outcome.applied.clone()),
            };
            self.dispatch(&mut inner, event, origin);
        }
        outcome
    }

    /// Disconnect hook: drop every lock held by `peer` and broadcast
    /// the delta. Returns the released destinations.
    pub fn release_all_locks_held_by(&self, peer: PeerId) -> Vec<LockChange> {
        let mut inner = self.inner.lock();
        let mut released: Vec<LockChange> = Vec::new();
        inner.locks.retain(|dest, owner| {
            if *owner == peer {
                released.push(LockChange {
                    dest: *dest,
                    owner: None,
                });
                false
            } else {
                true
            }
        });
        released.sort_by_key(|c| c.dest);
        if !released.is_empty() {
            self.dispatch(
                &mut inner,
                ModelEvent::LocksChanged(released.clone()),
                Some(peer),
            );
        }
        released
    }

    /// Subscribe to committed mutations (the UI-facing bus feed).
    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.events_tx.subscribe()
    }

    /// Register a wire listener, invoked under the model mutex after
    /// each commit. Must not block and must not call back into the
    /// model.
    pub fn add_wire_listener(&self, listener: WireListener) {
        self.inner.lock().wire_listeners.push(listener);
    }

    fn dispatch(&self, inner: &mut ModelInner, event: ModelEvent, origin: Option<PeerId>) {
        let mut listeners = std::mem::take(&mut inner.wire_listeners);
        for listener in &mut listeners {
            listener(&event, origin);
        }
        inner.wire_listeners = listeners;
        // lag on the broadcast channel degrades that subscriber only
        let _ = self.events_tx.send(event);
    }
}

/// Which label table a batched label write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelTable {
    Input,
    Output,
    Level,
}

fn snapshot_of(inner: &ModelInner, viewer: Option<PeerId>) -> Snapshot {
    let locks = (0..inner.cfg.outputs)
        .map(|d| inner.locks.get(&d).copied())
        .collect();
    Snapshot {
        config: inner.cfg.clone(),
        routes: inner.routes.clone(),
        input_labels: inner.input_labels.clone(),
        output_labels: inner.output_labels.clone(),
        level_names: inner.level_names.clone(),
        locks,
        viewer,
    }
}

fn label_changes(labels: &[String]) -> Vec<LabelChange> {
    labels
        .iter()
        .enumerate()
        .map(|(i, label)| LabelChange {
            index: i as u32,
            label: label.clone(),
        })
        .collect()
}

fn check_and_route(
    inner: &mut ModelInner,
    level: u32,
    dest: u32,
    src: u32,
    caller: Option<PeerId>,
) -> Result<Option<RouteChange>, EngineError> {
    let cfg = &inner.cfg;
    if level >= cfg.levels {
        return Err(EngineError::Bounds {
            what: "level",
            index: level,
            max: cfg.levels.saturating_sub(1),
        });
    }
    if dest >= cfg.outputs {
        return Err(EngineError::Bounds {
            what: "destination",
            index: dest,
            max: cfg.outputs.saturating_sub(1),
        });
    }
    if src >= cfg.inputs {
        return Err(EngineError::Bounds {
            what: "source",
            index: src,
            max: cfg.inputs.saturating_sub(1),
        });
    }
    if let Some(owner) = inner.locks.get(&dest) {
        if caller != Some(*owner) {
            return Err(EngineError::LockHeld { dest });
        }
    }

    let slot = &mut inner.routes[level as usize][dest as usize];
    if *slot == src {
        return Ok(None);
    }
    *slot = src;
    Ok(Some(RouteChange { level, dest, src }))
}

fn check_and_lock(
    inner: &mut ModelInner,
    dest: u32,
    op: LockOp,
    caller: PeerId,
) -> Result<Option<LockChange>, EngineError> {
    if dest >= inner.cfg.outputs {
        return Err(EngineError::Bounds {
            what: "destination",
            index: dest,
            max: inner.cfg.outputs.saturating_sub(1),
        });
    }
    match op {
        LockOp::Own => {
            let previous = inner.locks.insert(dest, caller);
            if previous == Some(caller) {
                Ok(None)
            } else {
                Ok(Some(LockChange {
                    dest,
                    owner: Some(caller),
                }))
            }
        }
        LockOp::Unlock => match inner.locks.get(&dest).copied() {
            None => Ok(None),
            Some(owner) if owner == caller => {
                inner.locks.remove(&dest);
                Ok(Some(LockChange { dest, owner: None }))
            }
            Some(_) => Err(EngineError::LockHeld { dest }),
        },
        LockOp::Force => {
            if inner.locks.remove(&dest).is_some() {
                Ok(Some(LockChange { dest, owner: None }))
            } else {
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> Arc<RoutingModel> {
        RoutingModel::new(RouterConfig::default())
    }

    #[test]
    fn test_default_routing_is_identity() {
        let m = model();
        let snap = m.snapshot(None);
        for d in 0..12 {
            assert_eq!(snap.route(0, d), Some(d));
        }
    }

    #[test]
    fn test_default_routing_clamps_when_outputs_exceed_inputs() {
        let m = RoutingModel::new(RouterConfig {
            inputs: 4,
            outputs: 8,
            ..RouterConfig::default()
        });
        let snap = m.snapshot(None);
        assert_eq!(snap.route(0, 3), Some(3));
        assert_eq!(snap.route(0, 6), Some(0));
    }

    #[test]
    fn test_set_route_and_bounds() {
        let m = model();
        let change = m.set_route(0, 3, 7, Some(1)).unwrap();
        assert_eq!(change, Some(RouteChange { level: 0, dest: 3, src: 7 }));
        assert_eq!(m.route(0, 3), Some(7));

        // no-op still succeeds but reports no change
        assert_eq!(m.set_route(0, 3, 7, Some(1)).unwrap(), None);

        assert!(matches!(
            m.set_route(0, 3, 99, Some(1)),
            Err(EngineError::Bounds { what: "source", .. })
        ));
        assert!(matches!(
            m.set_route(0, 99, 0, Some(1)),
            Err(EngineError::Bounds { what: "destination", .. })
        ));
        assert!(matches!(
            m.set_route(4, 0, 0, Some(1)),
            Err(EngineError::Bounds { what: "level", .. })
        ));
        // the failed writes left nothing out of range
        let snap = m.snapshot(None);
        for l in 0..snap.config.levels {
            for d in 0..snap.config.outputs {
                assert!(snap.route(l, d).unwrap() < snap.config.inputs);
            }
        }
    }

    #[test]
    fn test_lock_blocks_other_callers() {
        let m = model();
        m.set_lock(0, LockOp::Own, 1).unwrap();

        assert!(matches!(
            m.set_route(0, 0, 5, Some(2)),
            Err(EngineError::LockHeld { dest: 0 })
        ));
        // the owner may still route
        assert!(m.set_route(0, 0, 5, Some(1)).is_ok());
        // and the UI (different caller) is rejected like any other peer
        assert!(matches!(
            m.set_route(0, 0, 6, Some(LOCAL_PEER)),
            Err(EngineError::LockHeld { dest: 0 })
        ));
    }

    #[test]
    fn test_lock_ownership_transfer_on_own() {
        let m = model();
        m.set_lock(3, LockOp::Own, 1).unwrap();
        // a second Own transfers ownership rather than being rejected
        let change = m.set_lock(3, LockOp::Own, 2).unwrap();
        assert_eq!(change, Some(LockChange { dest: 3, owner: Some(2) }));
        assert_eq!(m.lock_owner(3), Some(2));
    }

    #[test]
    fn test_unlock_requires_ownership_force_does_not() {
        let m = model();
        m.set_lock(3, LockOp::Own, 1).unwrap();

        assert!(matches!(
            m.set_lock(3, LockOp::Unlock, 2),
            Err(EngineError::LockHeld { dest: 3 })
        ));
        assert_eq!(
            m.set_lock(3, LockOp::Force, 2).unwrap(),
            Some(LockChange { dest: 3, owner: None })
        );
        // unlocking an unlocked port succeeds as a no-op
        assert_eq!(m.set_lock(3, LockOp::Unlock, 2).unwrap(), None);
    }

    #[test]
    fn test_release_on_disconnect() {
        let m = model();
        m.set_lock(0, LockOp::Own, 7).unwrap();
        m.set_lock(4, LockOp::Own, 7).unwrap();
        m.set_lock(2, LockOp::Own, 8).unwrap();

        let released = m.release_all_locks_held_by(7);
        assert_eq!(
            released,
            vec![
                LockChange { dest: 0, owner: None },
                LockChange { dest: 4, owner: None }
            ]
        );
        // no residual lock may reference the closed peer
        let snap = m.snapshot(None);
        assert!(snap.locks.iter().all(|o| *o != Some(7)));
        assert_eq!(m.lock_owner(2), Some(8));
        // releasing again is a no-op
        assert!(m.release_all_locks_held_by(7).is_empty());
    }

    #[test]
    fn test_peer_relative_lock_view() {
        let m = model();
        m.set_lock(1, LockOp::Own, 5).unwrap();
        m.set_lock(2, LockOp::Own, 6).unwrap();

        let snap = m.snapshot(Some(5));
        assert_eq!(snap.lock_view(1), LockView::Owned);
        assert_eq!(snap.lock_view(2), LockView::Locked);
        assert_eq!(snap.lock_view(3), LockView::Unlocked);

        let owned = (0..snap.config.outputs)
            .filter(|d| snap.lock_view(*d) == LockView::Owned)
            .count();
        let locked = (0..snap.config.outputs)
            .filter(|d| snap.lock_view(*d) == LockView::Locked)
            .count();
        assert_eq!((owned, locked), (1, 1));
    }

    #[test]
    fn test_batch_routes_partial_application() {
        let m = model();
        let outcome = m.apply_routes(
            &[
                RouteChange { level: 0, dest: 3, src: 7 },
                RouteChange { level: 0, dest: 4, src: 99 },
            ],
            Some(1),
            1, // one malformed line from the decoder
        );
        assert_eq!(outcome.applied, vec![RouteChange { level: 0, dest: 3, src: 7 }]);
        assert_eq!(outcome.rejected, 2);
        assert!(!outcome.all_rejected());

        let rejected = m.apply_routes(
            &[RouteChange { level: 0, dest: 4, src: 99 }],
            Some(1),
            0,
        );
        assert!(rejected.all_rejected());
    }

    #[test]
    fn test_events_linearized_with_mutations() {
        let m = model();
        let mut rx = m.subscribe();
        m.set_route(0, 1, 2, Some(1)).unwrap();
        m.set_route(0, 1, 3, Some(1)).unwrap();
        m.set_lock(1, LockOp::Own, 1).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            ModelEvent::RoutingChanged(vec![RouteChange { level: 0, dest: 1, src: 2 }])
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ModelEvent::RoutingChanged(vec![RouteChange { level: 0, dest: 1, src: 3 }])
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ModelEvent::LocksChanged(vec![LockChange { dest: 1, owner: Some(1) }])
        );
    }

    #[test]
    fn test_wire_listener_sees_origin() {
        let m = model();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        m.add_wire_listener(Box::new(move |event, origin| {
            sink.lock().push((event.clone(), origin));
        }));

        m.set_route(0, 2, 9, Some(42)).unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, Some(42));
    }

    #[test]
    fn test_concurrent_writers_converge() {
        let m = model();
        let mut handles = Vec::new();
        for src in 0..8u32 {
            let m = Arc::clone(&m);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let _ = m.set_route(0, 5, src, Some(src as u64 + 1));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let final_src = m.route(0, 5).unwrap();
        assert!(final_src < 8);
    }

    #[test]
    fn test_label_updates() {
        let m = model();
        m.set_input_label(0, "Camera 1".into(), None).unwrap();
        m.set_output_label(11, "Monitor".into(), None).unwrap();
        m.set_level_name(0, "Vision".into(), None).unwrap();
        assert!(m.set_input_label(12, "nope".into(), None).is_err());

        let snap = m.snapshot(None);
        assert_eq!(snap.input_labels[0], "Camera 1");
        assert_eq!(snap.output_labels[11], "Monitor");
        assert_eq!(snap.level_names[0], "Vision");
        assert_eq!(snap.input_labels[1], "Input 2");
    }

    #[test]
    fn test_update_config_resets_and_unlocks() {
        let m = model();
        m.set_lock(0, LockOp::Own, 3).unwrap();
        m.set_route(0, 3, 7, None).unwrap();

        m.update_config(RouterConfig {
            inputs: 16,
            outputs: 16,
            levels: 2,
            ..RouterConfig::default()
        });
        let snap = m.snapshot(None);
        assert_eq!(snap.routes.len(), 2);
        assert_eq!(snap.route(1, 15), Some(15));
        assert!(snap.locks.iter().all(|o| o.is_none()));
        assert_eq!(snap.level_names, vec!["Video".to_string(), "Audio 1".to_string()]);
    }
}
