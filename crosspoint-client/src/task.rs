//! Shared connection plumbing for the three client engines: the writer
//! task, the connection-state cell and the session outcome type.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crosspoint_core::EngineError;

/// Outbound queue depth towards the router.
pub(crate) const OUT_QUEUE_DEPTH: usize = 64;

/// Resolves the pending `connect()` call, success or failure.
pub(crate) type ReadySender = oneshot::Sender<Result<(), EngineError>>;

/// Why a session ended.
#[derive(Debug)]
pub(crate) enum SessionEnd {
    /// `disconnect()` was requested; reconnection stays off.
    Manual,
    /// The very first attempt failed; `connect()` was already rejected
    /// and the supervisor stops.
    FirstAttemptFailed,
    /// The connection dropped; retry when auto-reconnect is on.
    Lost { was_connected: bool },
}

/// Handles owned by a live client engine.
pub(crate) struct ControlHandles {
    pub supervisor: JoinHandle<()>,
    pub disconnect_tx: watch::Sender<bool>,
}

/// Connection state shared between the public API and the I/O tasks.
#[derive(Default)]
pub(crate) struct ConnShared {
    connected: AtomicBool,
    out_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    control: Mutex<Option<ControlHandles>>,
}

impl ConnShared {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::Release);
    }

    pub fn set_out_tx(&self, tx: Option<mpsc::Sender<Bytes>>) {
        *self.out_tx.lock() = tx;
    }

    /// Enqueue bytes towards the router.
    pub fn send(&self, bytes: Bytes) -> Result<(), EngineError> {
        let guard = self.out_tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| EngineError::Connectivity("not connected".to_string()))?;
        tx.try_send(bytes)
            .map_err(|_| EngineError::Connectivity("outbound queue full".to_string()))
    }

    pub fn install_control(&self, handles: ControlHandles) {
        *self.control.lock() = Some(handles);
    }

    pub fn take_control(&self) -> Option<ControlHandles> {
        self.control.lock().take()
    }

    pub fn has_control(&self) -> bool {
        self.control.lock().is_some()
    }
}

/// Writer task: drains the outbound queue into the socket.
pub(crate) fn spawn_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = writer.write_all(&bytes).await {
                debug!("client write failed: {e}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    })
}

/// Mark the pending `connect()` as failed, if still pending.
pub(crate) fn fail_first(first: &mut Option<ReadySender>, error: EngineError) -> bool {
    if let Some(tx) = first.take() {
        let _ = tx.send(Err(error));
        true
    } else {
        false
    }
}
