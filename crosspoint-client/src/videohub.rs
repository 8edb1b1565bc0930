//! VideoHub controller client.
//!
//! On connect the router pushes its full status dump; the mirror is
//! ready once counts and one routing entry are known. Writes are
//! optimistic with NAK-driven rollback: replies arrive strictly in
//! request order, so a FIFO of sent command kinds correlates each
//! `ACK`/`NAK` with what was asked.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

use crosspoint_core::{
    EngineError, EngineEvent, EventBus, LockOp, LockState, LockStateChange, LockView, RouteChange,
};
use crosspoint_protocol::videohub::{
    encode_block, Block, BlockReader, LabelLines, LockChar, LockLines, RouteLines,
};

use crate::config::{Backoff, ClientConfig};
use crate::mirror::Mirror;
use crate::task::{
    fail_first, spawn_writer, ConnShared, ControlHandles, ReadySender, SessionEnd, OUT_QUEUE_DEPTH,
};

/// Kind of an outstanding request, for ACK/NAK correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SentKind {
    Route,
    Lock,
    Label,
    Ping,
}

struct ClientInner {
    config: ClientConfig,
    mirror: Mutex<Mirror>,
    bus: EventBus,
    conn: ConnShared,
    sent: Mutex<VecDeque<SentKind>>,
}

pub struct VideohubClient {
    inner: Arc<ClientInner>,
}

impl VideohubClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                mirror: Mutex::new(Mirror::new()),
                bus: EventBus::new(),
                conn: ConnShared::default(),
                sent: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Connect and wait for the initial status dump. Rejects on connect
    /// error or when initial state does not arrive within the timeout.
    pub async fn connect(&self) -> Result<(), EngineError> {
        if self.inner.conn.has_control() {
            return Err(EngineError::Connectivity("already connected".to_string()));
        }
        let (ready_tx, ready_rx) = oneshot::channel();
        let (disconnect_tx, disconnect_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let supervisor = tokio::spawn(supervisor(inner, ready_tx, disconnect_rx));
        self.inner.conn.install_control(ControlHandles {
            supervisor,
            disconnect_tx,
        });

        match tokio::time::timeout(self.inner.config.connect_timeout, ready_rx).await {
            Ok(Ok(result)) => {
                if result.is_err() {
                    // the supervisor has stopped; allow a fresh connect()
                    self.inner.conn.take_control();
                }
                result
            }
            Ok(Err(_)) => {
                self.inner.conn.take_control();
                Err(EngineError::Cancelled)
            }
            Err(_) => {
                self.disconnect().await;
                Err(EngineError::ConnectTimeout(self.inner.config.connect_timeout))
            }
        }
    }

    /// Disconnect and disable reconnection.
    pub async fn disconnect(&self) {
        if let Some(control) = self.inner.conn.take_control() {
            let _ = control.disconnect_tx.send(true);
            let _ = control.supervisor.await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.conn.is_connected()
    }

    pub fn state(&self) -> Mirror {
        self.inner.mirror.lock().clone()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.bus.subscribe()
    }

    /// Optimistic route write; the mirror updates immediately and rolls
    /// back if the router answers NAK.
    pub fn set_route(&self, dest: u32, src: u32) -> Result<(), EngineError> {
        let inner = &self.inner;
        let change = {
            let mut mirror = inner.mirror.lock();
            mirror.route_optimistic(0, dest, src)
        };
        inner.bus.emit(EngineEvent::RoutingChanged(vec![change]));

        inner.sent.lock().push_back(SentKind::Route);
        let block = encode_block(&Block::Routing(RouteLines::new(vec![(dest, src)])));
        inner.conn.send(block).inspect_err(|_| {
            inner.sent.lock().pop_back();
        })
    }

    /// Optimistic lock write.
    pub fn set_lock(&self, dest: u32, op: LockOp) -> Result<(), EngineError> {
        let inner = &self.inner;
        let (wire, view) = match op {
            LockOp::Own => (LockChar::Owned, LockView::Owned),
            LockOp::Unlock => (LockChar::Unlocked, LockView::Unlocked),
            LockOp::Force => (LockChar::ForceUnlock, LockView::Unlocked),
        };
        {
            let mut mirror = inner.mirror.lock();
            mirror.lock_optimistic(dest, view);
        }
        inner.bus.emit(EngineEvent::LocksChanged(vec![LockStateChange {
            dest,
            state: view_state(view),
        }]));

        inner.sent.lock().push_back(SentKind::Lock);
        let block = encode_block(&Block::Locks(LockLines::new(vec![(dest, wire)])));
        inner.conn.send(block).inspect_err(|_| {
            inner.sent.lock().pop_back();
        })
    }

    pub fn set_input_label(&self, index: u32, label: &str) -> Result<(), EngineError> {
        self.send_label(Block::InputLabels(LabelLines::new(vec![(
            index,
            label.to_string(),
        )])))
    }

    pub fn set_output_label(&self, index: u32, label: &str) -> Result<(), EngineError> {
        self.send_label(Block::OutputLabels(LabelLines::new(vec![(
            index,
            label.to_string(),
        )])))
    }

    fn send_label(&self, block: Block) -> Result<(), EngineError> {
        let inner = &self.inner;
        inner.sent.lock().push_back(SentKind::Label);
        inner.conn.send(encode_block(&block)).inspect_err(|_| {
            inner.sent.lock().pop_back();
        })
    }

    /// Keep-alive ping.
    pub fn ping(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        inner.sent.lock().push_back(SentKind::Ping);
        inner.conn.send(encode_block(&Block::Ping)).inspect_err(|_| {
            inner.sent.lock().pop_back();
        })
    }
}

fn view_state(view: LockView) -> LockState {
    match view {
        LockView::Owned => LockState::OwnedBySelf,
        LockView::Locked => LockState::OwnedByOther,
        LockView::Unlocked => LockState::Unlocked,
    }
}

async fn supervisor(
    inner: Arc<ClientInner>,
    ready_tx: ReadySender,
    mut disconnect_rx: watch::Receiver<bool>,
) {
    let mut first = Some(ready_tx);
    let mut backoff = Backoff::new(inner.config.reconnect_initial, inner.config.reconnect_max);
    let mut attempt = 0u32;

    loop {
        let end = run_session(&inner, &mut first, &mut disconnect_rx).await;

        let was_connected = inner.conn.is_connected();
        inner.conn.set_connected(false);
        inner.conn.set_out_tx(None);
        if was_connected {
            inner.bus.emit(EngineEvent::RouterDisconnected);
        }

        match end {
            SessionEnd::Manual | SessionEnd::FirstAttemptFailed => break,
            SessionEnd::Lost { .. } => {
                if !inner.config.auto_reconnect {
                    break;
                }
                if was_connected {
                    backoff.reset();
                    attempt = 0;
                }
                attempt += 1;
                inner.bus.emit(EngineEvent::RouterReconnecting { attempt });
                let delay = backoff.next_delay();
                info!("[videohub] reconnect attempt {attempt} in {delay:?}");
                tokio::select! {
                    _ = disconnect_rx.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    // a finished supervisor must not block a future connect()
    inner.conn.take_control();
}

async fn run_session(
    inner: &Arc<ClientInner>,
    first: &mut Option<ReadySender>,
    disconnect_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let addr = inner.config.addr();
    info!("[videohub] connecting to {addr}...");

    let connect = tokio::time::timeout(inner.config.connect_timeout, TcpStream::connect(&addr));
    let stream = tokio::select! {
        _ = disconnect_rx.changed() => return SessionEnd::Manual,
        result = connect => match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                inner.bus.emit(EngineEvent::Error {
                    message: format!("connect to {addr} failed: {e}"),
                });
                return if fail_first(first, EngineError::Connectivity(e.to_string())) {
                    SessionEnd::FirstAttemptFailed
                } else {
                    SessionEnd::Lost { was_connected: false }
                };
            }
            Err(_) => {
                inner.bus.emit(EngineEvent::Error {
                    message: format!("connect to {addr} timed out"),
                });
                return if fail_first(
                    first,
                    EngineError::ConnectTimeout(inner.config.connect_timeout),
                ) {
                    SessionEnd::FirstAttemptFailed
                } else {
                    SessionEnd::Lost { was_connected: false }
                };
            }
        }
    };

    let _ = stream.set_nodelay(true);
    info!("[videohub] connected to {addr}");
    let (mut reader, writer_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(OUT_QUEUE_DEPTH);
    let writer = spawn_writer(writer_half, out_rx);
    inner.conn.set_out_tx(Some(out_tx));

    *inner.mirror.lock() = Mirror::new();
    inner.sent.lock().clear();

    let mut frames = BlockReader::new();
    let mut buf = [0u8; 4096];
    let mut manual = false;

    'io: loop {
        tokio::select! {
            _ = disconnect_rx.changed() => {
                manual = true;
                break 'io;
            }
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break 'io,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("[videohub] read error: {e}");
                        break 'io;
                    }
                };
                frames.push(&buf[..n]);
                loop {
                    match frames.next_block() {
                        Ok(Some(block)) => {
                            handle_block(inner, block);
                            if !inner.conn.is_connected()
                                && inner.mirror.lock().initial_state_known()
                            {
                                inner.conn.set_connected(true);
                                if let Some(tx) = first.take() {
                                    let _ = tx.send(Ok(()));
                                }
                                inner.bus.emit(EngineEvent::RouterConnected);
                                info!("[videohub] initial state received");
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("[videohub] framing error: {e}");
                            inner.bus.emit(EngineEvent::Error {
                                message: format!("framing error: {e}"),
                            });
                            break 'io;
                        }
                    }
                }
            }
        }
    }

    inner.conn.set_out_tx(None);
    let _ = writer.await;

    if manual {
        return SessionEnd::Manual;
    }
    if fail_first(
        first,
        EngineError::Connectivity("connection closed before initial state".to_string()),
    ) {
        return SessionEnd::FirstAttemptFailed;
    }
    SessionEnd::Lost {
        was_connected: inner.conn.is_connected(),
    }
}

fn handle_block(inner: &Arc<ClientInner>, block: Block) {
    match block {
        Block::Preamble { version } => {
            debug!("[videohub] protocol preamble {version}");
        }
        Block::Device(info) => {
            let mut mirror = inner.mirror.lock();
            mirror.inputs = Some(info.video_inputs);
            mirror.outputs = Some(info.video_outputs);
            mirror.model_name = info.model_name;
            mirror.friendly_name = info.friendly_name;
        }
        Block::InputLabels(lines) => {
            let changes = {
                let mut mirror = inner.mirror.lock();
                lines
                    .entries
                    .iter()
                    .map(|(i, label)| {
                        mirror.input_labels.insert(*i, label.clone());
                        crosspoint_core::LabelChange {
                            index: *i,
                            label: label.clone(),
                        }
                    })
                    .collect::<Vec<_>>()
            };
            if !changes.is_empty() {
                inner.bus.emit(EngineEvent::InputLabelsChanged(changes));
            }
        }
        Block::OutputLabels(lines) => {
            let changes = {
                let mut mirror = inner.mirror.lock();
                lines
                    .entries
                    .iter()
                    .map(|(i, label)| {
                        mirror.output_labels.insert(*i, label.clone());
                        crosspoint_core::LabelChange {
                            index: *i,
                            label: label.clone(),
                        }
                    })
                    .collect::<Vec<_>>()
            };
            if !changes.is_empty() {
                inner.bus.emit(EngineEvent::OutputLabelsChanged(changes));
            }
        }
        Block::Routing(lines) => {
            let changes: Vec<RouteChange> = {
                let mut mirror = inner.mirror.lock();
                lines
                    .entries
                    .iter()
                    .map(|(dest, src)| mirror.route_confirmed(0, *dest, *src))
                    .collect()
            };
            if !changes.is_empty() {
                inner.bus.emit(EngineEvent::RoutingChanged(changes));
            }
        }
        Block::Locks(lines) => {
            let changes: Vec<LockStateChange> = {
                let mut mirror = inner.mirror.lock();
                lines
                    .entries
                    .iter()
                    .map(|(dest, c)| {
                        let view = match c {
                            LockChar::Owned => LockView::Owned,
                            LockChar::Locked => LockView::Locked,
                            LockChar::Unlocked | LockChar::ForceUnlock => LockView::Unlocked,
                        };
                        mirror.lock_confirmed(*dest, view);
                        LockStateChange {
                            dest: *dest,
                            state: view_state(view),
                        }
                    })
                    .collect()
            };
            if !changes.is_empty() {
                inner.bus.emit(EngineEvent::LocksChanged(changes));
            }
        }
        Block::Ack => {
            inner.sent.lock().pop_front();
        }
        Block::Nak => {
            let kind = inner.sent.lock().pop_front();
            match kind {
                Some(SentKind::Route) => {
                    // one NAK rolls back every pending route record
                    let rolled = inner.mirror.lock().rollback_routes();
                    if !rolled.is_empty() {
                        warn!("[videohub] NAK rolled back {} route(s)", rolled.len());
                        inner.bus.emit(EngineEvent::RoutingChanged(rolled));
                    }
                }
                Some(SentKind::Lock) => {
                    let rolled = inner.mirror.lock().rollback_locks();
                    if !rolled.is_empty() {
                        warn!("[videohub] NAK rolled back {} lock(s)", rolled.len());
                        inner.bus.emit(EngineEvent::LocksChanged(
                            rolled
                                .into_iter()
                                .map(|(dest, view)| LockStateChange {
                                    dest,
                                    state: view_state(view),
                                })
                                .collect(),
                        ));
                    }
                }
                Some(SentKind::Label) | Some(SentKind::Ping) => {
                    debug!("[videohub] NAK for non-optimistic request");
                }
                None => {
                    debug!("[videohub] unsolicited NAK");
                }
            }
        }
        Block::Ping | Block::Unknown(_) => {}
    }
}
