//! GV Native controller client.
//!
//! Issues an explicit query sequence on connect (`BK N`, `BK d`,
//! `QN IS`, `QN ID`, `QN L`, `QJ`) and keeps state fresh by polling the
//! change flags (`BK F`) once a second: when a flag is set the affected
//! section is requeried and `BK f` clears the word. Take acknowledgements
//! come back as `ER` frames carrying the echoed mnemonic.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

use crosspoint_core::{EngineError, EngineEvent, EventBus, LabelChange, RouteChange};
use crosspoint_protocol::gvnative::{
    encode_message, er_code, parse_index, parse_level_bitmap, GvItem, GvMessage, GvReader,
    NameKind,
};

use crate::config::{Backoff, ClientConfig};
use crate::mirror::Mirror;
use crate::task::{
    fail_first, spawn_writer, ConnShared, ControlHandles, ReadySender, SessionEnd, OUT_QUEUE_DEPTH,
};

// change-flag bits reported by BK F
const FLAG_ROUTING: u32 = 1 << 0;
const FLAG_SRC_NAMES: u32 = 1 << 1;
const FLAG_DEST_NAMES: u32 = 1 << 2;
const FLAG_LEVEL_NAMES: u32 = 1 << 3;

struct ClientInner {
    config: ClientConfig,
    mirror: Mutex<Mirror>,
    bus: EventBus,
    conn: ConnShared,
}

pub struct GvNativeClient {
    inner: Arc<ClientInner>,
}

impl GvNativeClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                mirror: Mutex::new(Mirror::new()),
                bus: EventBus::new(),
                conn: ConnShared::default(),
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

    /// Optimistic take by index on one level.
    pub fn set_route(&self, dest: u32, src: u32, level: u32) -> Result<(), EngineError> {
        let inner = &self.inner;
        let frame = encode_message(&GvMessage::TakeIndex { dest, src, level });

        let change = {
            let mut mirror = inner.mirror.lock();
            mirror.route_optimistic(level, dest, src)
        };
        inner.bus.emit(EngineEvent::RoutingChanged(vec![change]));
        inner.conn.send(frame)
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
                info!("[gvnative] reconnect attempt {attempt} in {delay:?}");
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

/// The on-connect query sequence, one combined write.
fn initial_queries() -> bytes::Bytes {
    let mut out = BytesMut::new();
    for msg in [
        GvMessage::Background { sub: 'N', args: Vec::new() },
        GvMessage::Background { sub: 'd', args: Vec::new() },
        GvMessage::QueryNames { kind: NameKind::IndexedSource },
        GvMessage::QueryNames { kind: NameKind::IndexedDest },
        GvMessage::QueryNames { kind: NameKind::Level },
        GvMessage::QueryDestBulk { start: None, extended: false },
    ] {
        out.put_slice(&encode_message(&msg));
    }
    out.freeze()
}

async fn run_session(
    inner: &Arc<ClientInner>,
    first: &mut Option<ReadySender>,
    disconnect_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let addr = inner.config.addr();
    info!("[gvnative] connecting to {addr}...");

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
    info!("[gvnative] connected to {addr}");
    let (mut reader, writer_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(OUT_QUEUE_DEPTH);
    let writer = spawn_writer(writer_half, out_rx);
    inner.conn.set_out_tx(Some(out_tx));

    *inner.mirror.lock() = Mirror::new();
    let _ = inner.conn.send(initial_queries());

    let mut frames = GvReader::new();
    let mut buf = [0u8; 4096];
    let mut manual = false;
    let mut poll = tokio::time::interval(inner.config.poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    'io: loop {
        tokio::select! {
            _ = disconnect_rx.changed() => {
                manual = true;
                break 'io;
            }
            _ = poll.tick() => {
                // 1 Hz change-flag poll
                let _ = inner.conn.send(encode_message(&GvMessage::Background {
                    sub: 'F',
                    args: Vec::new(),
                }));
            }
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break 'io,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("[gvnative] read error: {e}");
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
                    info!("[gvnative] initial state received");
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

fn handle_item(inner: &Arc<ClientInner>, item: GvItem) {
    if !item.checksum_ok {
        warn!("[gvnative] frame checksum mismatch");
    }
    match item.message {
        Ok(msg) => handle_message(inner, msg),
        Err(e) => debug!("[gvnative] unparseable frame: {e}"),
    }
}

fn handle_message(inner: &Arc<ClientInner>, msg: GvMessage) {
    match msg {
        GvMessage::BackgroundReply { sub, args } => handle_background(inner, sub, args),
        GvMessage::NamesReply { kind, entries } => {
            let changes: Vec<LabelChange> = {
                let mut mirror = inner.mirror.lock();
                entries
                    .into_iter()
                    .map(|(index, name)| {
                        let table = match kind {
                            NameKind::Source | NameKind::IndexedSource | NameKind::ExtSource => {
                                &mut mirror.input_labels
                            }
                            NameKind::Dest | NameKind::IndexedDest | NameKind::ExtDest => {
                                &mut mirror.output_labels
                            }
                            NameKind::Level | NameKind::ExtLevel => &mut mirror.level_names,
                        };
                        table.insert(index, name.clone());
                        LabelChange { index, label: name }
                    })
                    .collect()
            };
            if changes.is_empty() {
                return;
            }
            let event = match kind {
                NameKind::Source | NameKind::IndexedSource | NameKind::ExtSource => {
                    EngineEvent::InputLabelsChanged(changes)
                }
                NameKind::Dest | NameKind::IndexedDest | NameKind::ExtDest => {
                    EngineEvent::OutputLabelsChanged(changes)
                }
                NameKind::Level | NameKind::ExtLevel => EngineEvent::LevelNamesChanged(changes),
            };
            inner.bus.emit(event);
        }
        GvMessage::DestBulkReply { dest, sources } => {
            let changes: Vec<RouteChange> = {
                let mut mirror = inner.mirror.lock();
                mirror.levels = mirror.levels.max(sources.len() as u32);
                sources
                    .into_iter()
                    .enumerate()
                    .map(|(level, src)| mirror.route_confirmed(level as u32, dest, src))
                    .collect()
            };
            if !changes.is_empty() {
                inner.bus.emit(EngineEvent::RoutingChanged(changes));
            }
        }
        GvMessage::DestReply { dest, level, src } => {
            let change = inner.mirror.lock().route_confirmed(level, dest, src);
            inner.bus.emit(EngineEvent::RoutingChanged(vec![change]));
        }
        GvMessage::CommandError { code, echo } => {
            if code == er_code::OK {
                return;
            }
            let echoed = echo.as_deref().unwrap_or("");
            inner.bus.emit(EngineEvent::Error {
                message: format!("router refused {echoed} (code {code:02})"),
            });
            if matches!(echoed, "TI" | "TJ" | "TA" | "TD") {
                let rolled = inner.mirror.lock().rollback_routes();
                if !rolled.is_empty() {
                    warn!("[gvnative] ER {code:02} rolled back {} route(s)", rolled.len());
                    inner.bus.emit(EngineEvent::RoutingChanged(rolled));
                }
            }
        }
        GvMessage::DestByNameReply { .. }
        | GvMessage::ErrorTableReply { .. }
        | GvMessage::TimeReply { .. } => {}
        // router-side requests; a controller never receives these
        _ => debug!("[gvnative] ignoring router-side request message"),
    }
}

fn handle_background(inner: &Arc<ClientInner>, sub: char, args: Vec<String>) {
    match sub {
        'N' => {
            if let Some(name) = args.into_iter().next() {
                inner.mirror.lock().friendly_name = name;
            }
        }
        'd' => {
            let mut mirror = inner.mirror.lock();
            if let Some(outputs) = args.first().and_then(|s| parse_index(s)) {
                mirror.outputs = Some(outputs);
            }
            if let Some(inputs) = args.get(1).and_then(|s| parse_index(s)) {
                mirror.inputs = Some(inputs);
            }
            if let Some(levels) = args.get(2).and_then(|s| parse_index(s)) {
                mirror.levels = levels.max(1);
            }
        }
        'F' => {
            let flags = args
                .first()
                .and_then(|s| parse_level_bitmap(s))
                .unwrap_or(0);
            if flags != 0 {
                debug!("[gvnative] change flags {flags:08X}, requerying");
                requery(inner, flags);
            }
        }
        _ => debug!("[gvnative] ignoring KB {sub}"),
    }
}

/// Requery the sections named by the change flags, then clear them.
fn requery(inner: &Arc<ClientInner>, flags: u32) {
    let mut out = BytesMut::new();
    if flags & FLAG_ROUTING != 0 {
        out.put_slice(&encode_message(&GvMessage::QueryDestBulk {
            start: None,
            extended: false,
        }));
    }
    if flags & FLAG_SRC_NAMES != 0 {
        out.put_slice(&encode_message(&GvMessage::QueryNames {
            kind: NameKind::IndexedSource,
        }));
    }
    if flags & FLAG_DEST_NAMES != 0 {
        out.put_slice(&encode_message(&GvMessage::QueryNames {
            kind: NameKind::IndexedDest,
        }));
    }
    if flags & FLAG_LEVEL_NAMES != 0 {
        out.put_slice(&encode_message(&GvMessage::QueryNames {
            kind: NameKind::Level,
        }));
    }
    out.put_slice(&encode_message(&GvMessage::Background {
        sub: 'f',
        args: Vec::new(),
    }));
    let _ = inner.conn.send(out.freeze());
}
