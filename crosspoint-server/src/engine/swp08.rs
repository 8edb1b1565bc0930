//! SW-P-08 server engine.
//!
//! Sends nothing on accept; answers interrogates, connects, tally dumps
//! and name requests. Every verified frame is acknowledged with
//! `DLE ACK`, corrupt frames with `DLE NAK`. A successful connect is
//! broadcast to every peer as a `Crosspoint Connected` message.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crosspoint_core::{
    EngineError, EngineEvent, ModelEvent, PeerId, ProtocolKind, RouteChange, RoutingModel,
    Snapshot,
};
use crosspoint_protocol::swp08::{
    encode_ack, encode_message, encode_nak, CharLen, FrameReader, Swp08Item, Swp08Message,
    STANDARD_ADDRESS_MAX,
};

use crate::engine::{EngineBase, EngineConfig, SessionFactory};
use crate::peer::{alloc_peer_id, spawn_writer, PeerHandle, PeerRegistry};

/// Names per reply frame when answering a name request.
const NAMES_PER_FRAME: usize = 64;

pub struct Swp08Engine {
    base: EngineBase,
}

impl Swp08Engine {
    pub fn new(model: Arc<RoutingModel>, config: EngineConfig) -> Arc<Self> {
        let base = EngineBase::new(ProtocolKind::Swp08, Arc::clone(&model), config);
        let peers = Arc::clone(&base.peers);
        model.add_wire_listener(Box::new(move |event, origin| {
            broadcast_event(&peers, event, origin);
        }));
        Arc::new(Self { base })
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

/// Encode a crosspoint-connected tally, standard form when the
/// addresses fit, extended otherwise.
fn connected_frame(change: &RouteChange) -> Option<Bytes> {
    let extended =
        change.dest > STANDARD_ADDRESS_MAX as u32 || change.src > STANDARD_ADDRESS_MAX as u32;
    if change.dest > u16::MAX as u32 || change.src > u16::MAX as u32 || change.level > 0x0F {
        return None;
    }
    encode_message(&Swp08Message::Connected {
        matrix: 0,
        level: change.level as u8,
        dest: change.dest as u16,
        src: change.src as u16,
        extended,
    })
    .ok()
}

fn broadcast_event(peers: &PeerRegistry, event: &ModelEvent, origin: Option<PeerId>) {
    if let ModelEvent::RoutingChanged(changes) = event {
        // the originator's ACK precedes the broadcast
        if let Some(origin) = origin {
            if peers.contains(origin) {
                peers.send_to(origin, encode_ack());
            }
        }
        let mut out = BytesMut::new();
        for change in changes {
            if let Some(frame) = connected_frame(change) {
                out.put_slice(&frame);
            }
        }
        if !out.is_empty() {
            peers.broadcast(&out.freeze());
        }
    }
    // labels and locks have no unsolicited SW-P-08 messages; clients
    // re-issue name requests when they care
}

async fn run_session(
    engine: Arc<Swp08Engine>,
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
    info!("[Peer {id}] swp08 client connected from {addr}");
    base.peers.insert(handle.clone());
    base.bus.emit(EngineEvent::ClientConnected {
        id,
        addr: addr.to_string(),
    });

    let mut frames = FrameReader::new();
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
                    handle_item(&engine, &handle, item);
                }
            }
        }
    }

    base.peers.remove(id);
    base.bus.emit(EngineEvent::ClientDisconnected { id });
    info!("[Peer {id}] swp08 client disconnected");

    drop(handle);
    let _ = writer.await;
}

fn handle_item(engine: &Arc<Swp08Engine>, peer: &PeerHandle, item: Swp08Item) {
    let base = engine.base();
    let id = peer.id;

    let msg = match item {
        Swp08Item::Message(msg) => msg,
        Swp08Item::Invalid(e) => {
            warn!("[Peer {id}] corrupt frame: {e}");
            peer.try_send(encode_nak());
            return;
        }
        Swp08Item::Unhandled(op) => {
            debug!("[Peer {id}] unhandled opcode 0x{op:02X}");
            peer.try_send(encode_ack());
            return;
        }
        // stray controller-side tokens
        Swp08Item::Ack | Swp08Item::Nak => return,
    };

    match msg {
        Swp08Message::Interrogate { level, dest, extended, .. } => {
            base.bus.emit(EngineEvent::CommandReceived {
                id,
                description: format!("interrogate dest {dest} level {level}"),
            });
            base.model.with_snapshot(Some(id), |snap| {
                let mut out = BytesMut::new();
                out.put_slice(&encode_ack());
                if let Some(src) = snap.route(level as u32, dest as u32) {
                    if let Ok(frame) = encode_message(&Swp08Message::Tally {
                        matrix: 0,
                        level,
                        dest,
                        src: src as u16,
                        extended,
                    }) {
                        out.put_slice(&frame);
                    }
                }
                peer.try_send(out.freeze());
            });
        }
        Swp08Message::Connect { level, dest, src, .. } => {
            base.bus.emit(EngineEvent::CommandReceived {
                id,
                description: format!("connect dest {dest} src {src} level {level}"),
            });
            let entry = RouteChange {
                level: level as u32,
                dest: dest as u32,
                src: src as u32,
            };
            let outcome = base.model.apply_routes(&[entry], Some(id), 0);
            if outcome.applied.is_empty() {
                // frame verified but the take was refused; acknowledge
                // receipt and leave the matrix untouched
                debug!("[Peer {id}] connect rejected: dest {dest} src {src} level {level}");
                peer.try_send(encode_ack());
            }
        }
        Swp08Message::TallyDump { level, extended, .. } => {
            base.bus.emit(EngineEvent::CommandReceived {
                id,
                description: format!("tally dump level {level}"),
            });
            base.model.with_snapshot(Some(id), |snap| {
                peer.try_send(tally_dump(snap, level, extended));
            });
        }
        Swp08Message::SourceNamesRequest { chars, extended, .. } => {
            base.bus.emit(EngineEvent::CommandReceived {
                id,
                description: format!("source names ({} chars)", chars.width()),
            });
            base.model.with_snapshot(Some(id), |snap| {
                peer.try_send(name_replies(&snap.input_labels, chars, extended, true));
            });
        }
        Swp08Message::DestNamesRequest { chars, extended, .. } => {
            base.bus.emit(EngineEvent::CommandReceived {
                id,
                description: format!("dest names ({} chars)", chars.width()),
            });
            base.model.with_snapshot(Some(id), |snap| {
                peer.try_send(name_replies(&snap.output_labels, chars, extended, false));
            });
        }
        // controller-side messages; a router never receives these
        Swp08Message::Tally { .. }
        | Swp08Message::Connected { .. }
        | Swp08Message::SourceNamesReply { .. }
        | Swp08Message::DestNamesReply { .. } => {
            peer.try_send(encode_ack());
        }
    }
}

/// ACK plus one tally frame per destination of the level.
fn tally_dump(snap: &Snapshot, level: u8, extended: bool) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(&encode_ack());

    let Some(row) = snap.routes.get(level as usize) else {
        return out.freeze();
    };
    let limit = if extended {
        u16::MAX as usize + 1
    } else {
        STANDARD_ADDRESS_MAX as usize + 1
    };
    for (dest, src) in row.iter().enumerate().take(limit) {
        if let Ok(frame) = encode_message(&Swp08Message::Tally {
            matrix: 0,
            level,
            dest: dest as u16,
            src: *src as u16,
            extended,
        }) {
            out.put_slice(&frame);
        }
    }
    out.freeze()
}

/// ACK plus chunked name replies for the whole table.
fn name_replies(labels: &[String], chars: CharLen, extended: bool, sources: bool) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(&encode_ack());

    for (chunk_index, chunk) in labels.chunks(NAMES_PER_FRAME).enumerate() {
        let start = (chunk_index * NAMES_PER_FRAME) as u16;
        let names: Vec<String> = chunk.to_vec();
        let msg = if sources {
            Swp08Message::SourceNamesReply { matrix: 0, chars, start, names, extended }
        } else {
            Swp08Message::DestNamesReply { matrix: 0, chars, start, names, extended }
        };
        match encode_message(&msg) {
            Ok(frame) => out.put_slice(&frame),
            Err(e) => {
                debug!("name reply chunk at {start} not encodable: {e}");
                break;
            }
        }
    }
    out.freeze()
}
