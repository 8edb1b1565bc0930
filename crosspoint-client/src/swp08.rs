//! SW-P-08 controller client.
//!
//! The wire carries no matrix dimensions, so the configured counts seed
//! the mirror; routing state is resynchronized with a tally dump per
//! level on connect, and labels with name requests. The router answers
//! every frame `DLE ACK`/`DLE NAK` in order, which gives the same FIFO
//! reply correlation as VideoHub.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

use crosspoint_core::{EngineError, EngineEvent, EventBus, LabelChange};
use crosspoint_protocol::swp08::{
    encode_message, CharLen, FrameReader, Swp08Item, Swp08Message, STANDARD_ADDRESS_MAX,
};

use crate::config::{Backoff, ClientConfig};
use crate::mirror::Mirror;
use crate::task::{
    fail_first, spawn_writer, ConnShared, ControlHandles, ReadySender, SessionEnd, OUT_QUEUE_DEPTH,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SentKind {
    Route,
    Resync,
}

struct ClientInner {
    config: ClientConfig,
    mirror: Mutex<Mirror>,
    bus: EventBus,
    conn: ConnShared,
    sent: Mutex<VecDeque<SentKind>>,
    /// Use the 16-bit opcode family when the matrix needs it.
    extended: bool,
}

pub struct Swp08Client {
    inner: Arc<ClientInner>,
}

impl Swp08Client {
    pub fn new(config: ClientConfig) -> Self {
        let extended = config.inputs > STANDARD_ADDRESS_MAX as u32 + 1
            || config.outputs > STANDARD_ADDRESS_MAX as u32 + 1;
        Self {
            inner: Arc::new(ClientInner {
                config,
                mirror: Mutex::new(Mirror::new()),
                bus: EventBus::new(),
                conn: ConnShared::default(),
                sent: Mutex::new(VecDeque::new()),
                extended,
            }),
        }
    }

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

    /// Optimistic crosspoint take.
    pub fn set_route(&self, dest: u32, src: u32, level: u32) -> Result<(), EngineError> {
        let inner = &self.inner;
        if dest > u16::MAX as u32 || src > u16::MAX as u32 || level > 0x0F {
            return Err(EngineError::Bounds {
                what: "address",
                index: dest.max(src).max(level),
                max: u16::MAX as u32,
            });
        }
        let extended = inner.extended
            || dest > STANDARD_ADDRESS_MAX as u32
            || src > STANDARD_ADDRESS_MAX as u32;
        let frame = encode_message(&Swp08Message::Connect {
            matrix: 0,
            level: level as u8,
            dest: dest as u16,
            src: src as u16,
            extended,
        })?;

        let change = {
            let mut mirror = inner.mirror.lock();
            mirror.route_optimistic(level, dest, src)
        };
        inner.bus.emit(EngineEvent::RoutingChanged(vec![change]));

        inner.sent.lock().push_back(SentKind::Route);
        inner.conn.send(frame).inspect_err(|_| {
            inner.sent.lock().pop_back();
        })
    }

    /// Re-request one level's tally dump.
    pub fn resync_level(&self, level: u32) -> Result<(), EngineError> {
        let inner = &self.inner;
        let frame = encode_message(&Swp08Message::TallyDump {
            matrix: 0,
            level: level as u8,
            extended: inner.extended,
        })?;
        inner.sent.lock().push_back(SentKind::Resync);
        inner.conn.send(frame).inspect_err(|_| {
            inner.sent.lock().pop_back();
        })
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
                info!("[swp08] reconnect attempt {attempt} in {delay:?}");
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
    info!("[swp08] connecting to {addr}...");

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
    info!("[swp08] connected to {addr}");
    let (mut reader, writer_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(OUT_QUEUE_DEPTH);
    let writer = spawn_writer(writer_half, out_rx);
    inner.conn.set_out_tx(Some(out_tx));

    {
        // seed the mirror with the configured dimensions
        let mut mirror = inner.mirror.lock();
        *mirror = Mirror::new();
        mirror.inputs = Some(inner.config.inputs);
        mirror.outputs = Some(inner.config.outputs);
        mirror.levels = inner.config.levels;
    }
    inner.sent.lock().clear();

    // resynchronize: tallies per level, then both name tables
    {
        let mut sent = inner.sent.lock();
        for level in 0..inner.config.levels.min(16) {
            if let Ok(frame) = encode_message(&Swp08Message::TallyDump {
                matrix: 0,
                level: level as u8,
                extended: inner.extended,
            }) {
                sent.push_back(SentKind::Resync);
                let _ = inner.conn.send(frame);
            }
        }
        for request in [
            Swp08Message::SourceNamesRequest {
                matrix: 0,
                chars: CharLen::C8,
                extended: inner.extended,
            },
            Swp08Message::DestNamesRequest {
                matrix: 0,
                chars: CharLen::C8,
                extended: inner.extended,
            },
        ] {
            if let Ok(frame) = encode_message(&request) {
                sent.push_back(SentKind::Resync);
                let _ = inner.conn.send(frame);
            }
        }
    }

    let mut frames = FrameReader::new();
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
                        debug!("[swp08] read error: {e}");
                        break 'io;
                    }
                };
                for item in frames.feed(&buf[..n]) {
                    handle_item(inner, item);
                }
                if !inner.conn.is_connected() && inner.mirror.lock().initial_state_known() {
                    inner.conn.set_connected(true);
                    if let Some(tx) = first.take() {
                        let _ = tx.send(Ok(()));
                    }
                    inner.bus.emit(EngineEvent::RouterConnected);
                    info!("[swp08] initial state received");
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

fn handle_item(inner: &Arc<ClientInner>, item: Swp08Item) {
    match item {
        Swp08Item::Message(msg) => handle_message(inner, msg),
        Swp08Item::Ack => {
            inner.sent.lock().pop_front();
        }
        Swp08Item::Nak => {
            let kind = inner.sent.lock().pop_front();
            if kind == Some(SentKind::Route) {
                let rolled = inner.mirror.lock().rollback_routes();
                if !rolled.is_empty() {
                    warn!("[swp08] NAK rolled back {} route(s)", rolled.len());
                    inner.bus.emit(EngineEvent::RoutingChanged(rolled));
                }
            }
        }
        Swp08Item::Invalid(e) => {
            warn!("[swp08] corrupt frame from router: {e}");
        }
        Swp08Item::Unhandled(op) => {
            debug!("[swp08] unhandled opcode 0x{op:02X} from router");
        }
    }
}

fn handle_message(inner: &Arc<ClientInner>, msg: Swp08Message) {
    match msg {
        // tallies and connected notifications are both authoritative
        Swp08Message::Tally { level, dest, src, .. }
        | Swp08Message::Connected { level, dest, src, .. } => {
            let change = inner
                .mirror
                .lock()
                .route_confirmed(level as u32, dest as u32, src as u32);
            inner.bus.emit(EngineEvent::RoutingChanged(vec![change]));
        }
        Swp08Message::SourceNamesReply { start, names, .. } => {
            let changes = apply_names(inner, start, names, true);
            if !changes.is_empty() {
                inner.bus.emit(EngineEvent::InputLabelsChanged(changes));
            }
        }
        Swp08Message::DestNamesReply { start, names, .. } => {
            let changes = apply_names(inner, start, names, false);
            if !changes.is_empty() {
                inner.bus.emit(EngineEvent::OutputLabelsChanged(changes));
            }
        }
        // router-side requests; a controller never receives these
        Swp08Message::Interrogate { .. }
        | Swp08Message::Connect { .. }
        | Swp08Message::TallyDump { .. }
        | Swp08Message::SourceNamesRequest { .. }
        | Swp08Message::DestNamesRequest { .. } => {
            debug!("[swp08] ignoring router-side request message");
        }
    }
}

fn apply_names(
    inner: &Arc<ClientInner>,
    start: u16,
    names: Vec<String>,
    sources: bool,
) -> Vec<LabelChange> {
    let mut mirror = inner.mirror.lock();
    names
        .into_iter()
        .enumerate()
        .map(|(offset, name)| {
            let index = start as u32 + offset as u32;
            let change = LabelChange {
                index,
                label: name.clone(),
            };
            if sources {
                mirror.input_labels.insert(index, name);
            } else {
                mirror.output_labels.insert(index, name);
            }
            change
        })
        .collect()
}
