//! GV Native server engine.
//!
//! Sends nothing on accept; answers name/status queries, executes the
//! four take forms and serves the `BK` configuration sub-commands.
//! Change discovery is flag-based: every committed mutation sets bits
//! in a per-connection flag word which clients poll with `BK F` and
//! clear with `BK f`. Echo mode (per connection, default on) governs
//! the trailing `ER,00` on bulk queries and take acknowledgements.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crosspoint_core::{
    EngineError, EngineEvent, ModelEvent, PeerId, ProtocolKind, RouteChange, RoutingModel,
};
use crosspoint_protocol::gvnative::{
    encode_message, er_code, format_index, format_level_bitmap, GvItem, GvMessage, GvReader,
    NameKind,
};

use crate::engine::{EngineBase, EngineConfig, SessionFactory};
use crate::peer::{alloc_peer_id, spawn_writer, PeerHandle};

/// Change-flag bits reported by `BK F`.
pub const FLAG_ROUTING: u32 = 1 << 0;
pub const FLAG_SRC_NAMES: u32 = 1 << 1;
pub const FLAG_DEST_NAMES: u32 = 1 << 2;
pub const FLAG_LEVEL_NAMES: u32 = 1 << 3;

type FlagMap = Mutex<HashMap<PeerId, Arc<AtomicU32>>>;

pub struct GvNativeEngine {
    base: EngineBase,
    flags: Arc<FlagMap>,
}

impl GvNativeEngine {
    pub fn new(model: Arc<RoutingModel>, config: EngineConfig) -> Arc<Self> {
        let base = EngineBase::new(ProtocolKind::GvNative, Arc::clone(&model), config);
        let flags: Arc<FlagMap> = Arc::new(Mutex::new(HashMap::new()));
        let listener_flags = Arc::clone(&flags);
        model.add_wire_listener(Box::new(move |event, _origin| {
            let bit = match event {
                ModelEvent::RoutingChanged(_) => FLAG_ROUTING,
                ModelEvent::InputLabelsChanged(_) => FLAG_SRC_NAMES,
                ModelEvent::OutputLabelsChanged(_) => FLAG_DEST_NAMES,
                ModelEvent::LevelNamesChanged(_) => FLAG_LEVEL_NAMES,
                ModelEvent::LocksChanged(_) => return,
            };
            for cell in listener_flags.lock().values() {
                cell.fetch_or(bit, Ordering::Relaxed);
            }
        }));
        Arc::new(Self { base, flags })
    }

    pub(crate) fn base(&self) -> &EngineBase {
        &self.base
    }

    pub async fn start(self: &Arc<Self>) -> Result<u16, EngineError> {
        let engine = Arc::clone(self);
        let factory: SessionFactory = Arc::new(move |socket, addr, shutdown| {
            let engine = Arc::clone(&engine);
            Box::pin(async move { run_session(engine, socket, addr, shutdown).await })
        });
        self.base.start(factory).await
    }

    pub async fn stop(&self) {
        self.base.stop().await
    }
}

struct GvSession {
    engine: Arc<GvNativeEngine>,
    peer: PeerHandle,
    /// Trailing `ER,00` emission, default on.
    echo: bool,
    flags: Arc<AtomicU32>,
}

async fn run_session(
    engine: Arc<GvNativeEngine>,
    socket: TcpStream,
    addr: SocketAddr,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if let Err(e) = socket.set_nodelay(true) {
        debug!("set_nodelay failed for {addr}: {e}");
    }
    let (mut reader_half, writer_half) = socket.into_split();

    let id = alloc_peer_id();
    let (handle, outbound_rx) = PeerHandle::new(id, addr);
    let writer = spawn_writer(writer_half, outbound_rx);

    let base = engine.base();
    info!("[Peer {id}] gvnative client connected from {addr}");
    base.peers.insert(handle.clone());
    let flag_cell = Arc::new(AtomicU32::new(0));
    engine.flags.lock().insert(id, Arc::clone(&flag_cell));
    base.bus.emit(EngineEvent::ClientConnected {
        id,
        addr: addr.to_string(),
    });

    let mut session = GvSession {
        engine: Arc::clone(&engine),
        peer: handle.clone(),
        echo: true,
        flags: flag_cell,
    };

    let mut frames = GvReader::new();
    let mut buf = [0u8; 4096];

    'conn: loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break 'conn,
            read = reader_half.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break 'conn,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("[Peer {id}] read error: {e}");
                        break 'conn;
                    }
                };
                for item in frames.feed(&buf[..n]) {
                    session.handle_item(item);
                }
            }
        }
    }

    engine.flags.lock().remove(&id);
    base.peers.remove(id);
    base.bus.emit(EngineEvent::ClientDisconnected { id });
    info!("[Peer {id}] gvnative client disconnected");

    drop(handle);
    drop(session);
    let _ = writer.await;
}

impl GvSession {
    fn handle_item(&mut self, item: GvItem) {
        let id = self.peer.id;
        if !item.checksum_ok {
            // still dispatched, matching router firmware behavior
            warn!("[Peer {id}] frame checksum mismatch, dispatching anyway");
        }
        match item.message {
            Ok(msg) => self.handle_message(msg),
            Err(e) => {
                warn!("[Peer {id}] unparseable frame: {e}");
                self.reply_er(er_code::SYNTAX, None);
            }
        }
    }

    fn send(&self, bytes: Bytes) {
        self.peer.try_send(bytes);
    }

    fn reply(&self, msg: &GvMessage) {
        self.send(encode_message(msg));
    }

    fn reply_er(&self, code: u8, echo: Option<&str>) {
        self.reply(&GvMessage::CommandError {
            code,
            echo: echo.map(str::to_string),
        });
    }

    /// `ER,00,<mnemonic>` when echo mode is on.
    fn ack(&self, mnemonic: &str) {
        if self.echo {
            self.reply_er(er_code::OK, Some(mnemonic));
        }
    }

    fn command_event(&self, description: String) {
        self.engine.base().bus.emit(EngineEvent::CommandReceived {
            id: self.peer.id,
            description,
        });
    }

    fn handle_message(&mut self, msg: GvMessage) {
        let model = Arc::clone(&self.engine.base().model);
        match msg {
            GvMessage::QueryNames { kind } => {
                self.command_event(format!("query names {}", kind.code()));
                model.with_snapshot(Some(self.peer.id), |snap| {
                    let labels = match kind {
                        NameKind::Source | NameKind::IndexedSource | NameKind::ExtSource => {
                            &snap.input_labels
                        }
                        NameKind::Dest | NameKind::IndexedDest | NameKind::ExtDest => {
                            &snap.output_labels
                        }
                        NameKind::Level | NameKind::ExtLevel => &snap.level_names,
                    };
                    let entries = labels
                        .iter()
                        .enumerate()
                        .map(|(i, name)| (i as u32, name.clone()))
                        .collect();
                    self.reply(&GvMessage::NamesReply { kind, entries });
                });
                self.ack("QN");
            }
            GvMessage::QueryDestByName { name, .. } => {
                self.command_event(format!("query dest {name:?}"));
                model.with_snapshot(Some(self.peer.id), |snap| {
                    match find_by_name(&snap.output_labels, &name) {
                        Some(dest) => {
                            let sources = (0..snap.config.levels)
                                .map(|level| {
                                    let src = snap.route(level, dest).unwrap_or(0);
                                    snap.input_labels
                                        .get(src as usize)
                                        .cloned()
                                        .unwrap_or_default()
                                })
                                .collect();
                            self.reply(&GvMessage::DestByNameReply {
                                dest: name.clone(),
                                sources,
                            });
                            self.ack("QD");
                        }
                        None => self.reply_er(er_code::UNKNOWN_NAME, Some("QD")),
                    }
                });
            }
            GvMessage::QueryDestBulk { start, .. } => {
                self.command_event("query dest status (bulk)".to_string());
                model.with_snapshot(Some(self.peer.id), |snap| {
                    let mut out = BytesMut::new();
                    for dest in start.unwrap_or(0)..snap.config.outputs {
                        let sources = (0..snap.config.levels)
                            .map(|level| snap.route(level, dest).unwrap_or(0))
                            .collect();
                        out.put_slice(&encode_message(&GvMessage::DestBulkReply {
                            dest,
                            sources,
                        }));
                    }
                    self.send(out.freeze());
                });
                self.ack("QJ");
            }
            GvMessage::QueryDest { dest, level, .. } => {
                self.command_event(format!("query dest {dest} level {level}"));
                model.with_snapshot(Some(self.peer.id), |snap| match snap.route(level, dest) {
                    Some(src) => {
                        self.reply(&GvMessage::DestReply { dest, level, src });
                        self.ack("QI");
                    }
                    None => self.reply_er(er_code::RANGE, Some("QI")),
                });
            }
            GvMessage::TakeByName { dest, src } => {
                self.command_event(format!("take {src:?} -> {dest:?}"));
                self.take_by_name("TA", &dest, &src, None, &model);
            }
            GvMessage::TakeByNameLevels { dest, src, levels } => {
                self.command_event(format!("take {src:?} -> {dest:?} levels {levels:08X}"));
                self.take_by_name("TD", &dest, &src, Some(levels), &model);
            }
            GvMessage::TakeIndex { dest, src, level } => {
                self.command_event(format!("take src {src} -> dest {dest} level {level}"));
                self.take_indexed("TI", dest, src, &[level], &model);
            }
            GvMessage::TakeIndexLevels { dest, src, levels } => {
                self.command_event(format!("take src {src} -> dest {dest} levels {levels:08X}"));
                let selected = bitmap_levels(levels, model.config().levels);
                self.take_indexed("TJ", dest, src, &selected, &model);
            }
            GvMessage::Background { sub, args } => {
                self.command_event(format!("background {sub}"));
                self.handle_background(sub, args, &model);
            }
            GvMessage::QueryErrors => {
                self.command_event("query error table".to_string());
                self.reply(&GvMessage::ErrorTableReply { entries: Vec::new() });
                self.ack("QE");
            }
            GvMessage::QueryTime => {
                self.command_event("query time".to_string());
                self.reply(&GvMessage::TimeReply { time: local_time() });
            }
            // controller-side replies; a router never receives these
            GvMessage::NamesReply { .. }
            | GvMessage::DestByNameReply { .. }
            | GvMessage::DestBulkReply { .. }
            | GvMessage::DestReply { .. }
            | GvMessage::BackgroundReply { .. }
            | GvMessage::ErrorTableReply { .. }
            | GvMessage::TimeReply { .. }
            | GvMessage::CommandError { .. } => {
                debug!("[Peer {}] ignoring controller-side message", self.peer.id);
            }
        }
    }

    fn take_by_name(
        &self,
        mnemonic: &str,
        dest_name: &str,
        src_name: &str,
        levels: Option<u32>,
        model: &RoutingModel,
    ) {
        let snap = model.snapshot(Some(self.peer.id));
        let (Some(dest), Some(src)) = (
            find_by_name(&snap.output_labels, dest_name),
            find_by_name(&snap.input_labels, src_name),
        ) else {
            self.reply_er(er_code::UNKNOWN_NAME, Some(mnemonic));
            return;
        };
        let selected = match levels {
            Some(mask) => bitmap_levels(mask, snap.config.levels),
            None => (0..snap.config.levels).collect(),
        };
        self.take_indexed(mnemonic, dest, src, &selected, model);
    }

    fn take_indexed(
        &self,
        mnemonic: &str,
        dest: u32,
        src: u32,
        levels: &[u32],
        model: &RoutingModel,
    ) {
        if levels.is_empty() {
            self.reply_er(er_code::RANGE, Some(mnemonic));
            return;
        }
        let entries: Vec<RouteChange> = levels
            .iter()
            .map(|level| RouteChange {
                level: *level,
                dest,
                src,
            })
            .collect();
        let outcome = model.apply_routes(&entries, Some(self.peer.id), 0);
        if outcome.all_rejected() {
            self.reply_er(er_code::REFUSED, Some(mnemonic));
        } else {
            self.ack(mnemonic);
        }
    }

    fn handle_background(&mut self, sub: char, args: Vec<String>, model: &RoutingModel) {
        match sub {
            'N' => {
                let cfg = model.config();
                self.reply(&GvMessage::BackgroundReply {
                    sub,
                    args: vec![cfg.friendly_name],
                });
            }
            'd' => {
                let cfg = model.config();
                self.reply(&GvMessage::BackgroundReply {
                    sub,
                    args: vec![
                        format_index(cfg.outputs),
                        format_index(cfg.inputs),
                        format_index(cfg.levels),
                    ],
                });
            }
            'I' => {
                let cfg = model.config();
                self.reply(&GvMessage::BackgroundReply {
                    sub,
                    args: vec![format_index(cfg.inputs)],
                });
            }
            'E' => match args.first().map(String::as_str) {
                Some(value) => {
                    self.echo = value != "0";
                    self.ack("BK");
                }
                None => {
                    let state = if self.echo { "1" } else { "0" };
                    self.reply(&GvMessage::BackgroundReply {
                        sub,
                        args: vec![state.to_string()],
                    });
                }
            },
            'F' => {
                let flags = self.flags.load(Ordering::Relaxed);
                self.reply(&GvMessage::BackgroundReply {
                    sub,
                    args: vec![format_level_bitmap(flags)],
                });
            }
            'f' => {
                self.flags.store(0, Ordering::Relaxed);
                self.ack("BK");
            }
            'T' => {
                self.reply(&GvMessage::BackgroundReply {
                    sub,
                    args: vec![local_time()],
                });
            }
            't' => {
                // time set is accepted and ignored; the host clock rules
                self.ack("BK");
            }
            'R' | 'D' | 'A' | 'P' => {
                // port/config stubs: echo the sub-code with no payload
                self.reply(&GvMessage::BackgroundReply { sub, args: Vec::new() });
            }
            other => {
                debug!("[Peer {}] unknown BK sub-code {other:?}", self.peer.id);
                self.reply_er(er_code::SYNTAX, Some("BK"));
            }
        }
    }
}

/// Match a wire name against a label table: compared against the
/// 8-character wire rendering of each label.
fn find_by_name(labels: &[String], name: &str) -> Option<u32> {
    labels.iter().position(|label| {
        let wire: String = label.chars().take(8).collect();
        wire.trim_end() == name
    }).map(|i| i as u32)
}

fn bitmap_levels(mask: u32, levels: u32) -> Vec<u32> {
    (0..levels.min(32)).filter(|l| mask & (1 << l) != 0).collect()
}

fn local_time() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}
