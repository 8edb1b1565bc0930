//! VideoHub server engine.
//!
//! Pushes the full status dump on accept, answers query blocks with
//! `ACK` plus the requested section, applies update blocks to the model
//! and lets the wire listener fan the applied subset out to every peer.
//! The lock section is rendered per receiver (`O`/`L`/`U`).

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crosspoint_core::{
    EngineError, EngineEvent, LockOp, LockView, ModelEvent, PeerId, ProtocolKind, RouteChange,
    RoutingModel, Snapshot,
};
use crosspoint_protocol::videohub::{
    encode_block, encode_blocks, Block, BlockReader, DeviceInfo, LabelLines, LockChar, LockLines,
    RouteLines, PREAMBLE_VERSION,
};

use crate::engine::{EngineBase, EngineConfig, SessionFactory};
use crate::peer::{alloc_peer_id, spawn_writer, PeerHandle, PeerRegistry};

pub struct VideohubEngine {
    base: EngineBase,
}

impl VideohubEngine {
    pub fn new(model: Arc<RoutingModel>, config: EngineConfig) -> Arc<Self> {
        let base = EngineBase::new(ProtocolKind::Videohub, Arc::clone(&model), config);
        let peers = Arc::clone(&base.peers);
        // runs under the model mutex: the originator's ACK is enqueued
        // before the broadcast, and broadcasts follow mutation order
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

/// Wire fanout for committed mutations, invoked under the model mutex.
fn broadcast_event(peers: &PeerRegistry, event: &ModelEvent, origin: Option<PeerId>) {
    // ACK goes to the originator only when the mutation came in over
    // this engine's wire; a peer mid-disconnect is no longer registered
    // and gets nothing.
    let ack_origin = |peers: &PeerRegistry| {
        if let Some(origin) = origin {
            if peers.contains(origin) {
                peers.send_to(origin, encode_block(&Block::Ack));
            }
        }
    };

    match event {
        ModelEvent::RoutingChanged(changes) => {
            // VideoHub routes on level zero only
            let entries: Vec<(u32, u32)> = changes
                .iter()
                .filter(|c| c.level == 0)
                .map(|c| (c.dest, c.src))
                .collect();
            if entries.is_empty() {
                return;
            }
            ack_origin(peers);
            let block = encode_block(&Block::Routing(RouteLines::new(entries)));
            peers.broadcast(&block);
        }
        ModelEvent::LocksChanged(changes) => {
            ack_origin(peers);
            peers.broadcast_with(|viewer| {
                let entries = changes
                    .iter()
                    .map(|c| {
                        let state = match c.owner {
                            None => LockChar::Unlocked,
                            Some(owner) if owner == viewer => LockChar::Owned,
                            Some(_) => LockChar::Locked,
                        };
                        (c.dest, state)
                    })
                    .collect();
                Some(encode_block(&Block::Locks(LockLines::new(entries))))
            });
        }
        ModelEvent::InputLabelsChanged(changes) => {
            ack_origin(peers);
            let block = encode_block(&Block::InputLabels(LabelLines::new(
                changes.iter().map(|c| (c.index, c.label.clone())).collect(),
            )));
            peers.broadcast(&block);
        }
        ModelEvent::OutputLabelsChanged(changes) => {
            ack_origin(peers);
            let block = encode_block(&Block::OutputLabels(LabelLines::new(
                changes.iter().map(|c| (c.index, c.label.clone())).collect(),
            )));
            peers.broadcast(&block);
        }
        // level names have no VideoHub wire representation
        ModelEvent::LevelNamesChanged(_) => {}
    }
}

fn full_dump(snap: &Snapshot) -> Bytes {
    let viewer_locks = (0..snap.config.outputs)
        .map(|d| {
            let c = match snap.lock_view(d) {
                LockView::Owned => LockChar::Owned,
                LockView::Locked => LockChar::Locked,
                LockView::Unlocked => LockChar::Unlocked,
            };
            (d, c)
        })
        .collect();

    let blocks = vec![
        Block::Preamble {
            version: PREAMBLE_VERSION.to_string(),
        },
        Block::Device(DeviceInfo {
            present: true,
            model_name: snap.config.model_name.clone(),
            friendly_name: snap.config.friendly_name.clone(),
            unique_id: snap.config.unique_id.clone(),
            video_inputs: snap.config.inputs,
            video_outputs: snap.config.outputs,
        }),
        Block::InputLabels(LabelLines::new(indexed(&snap.input_labels))),
        Block::OutputLabels(LabelLines::new(indexed(&snap.output_labels))),
        Block::Routing(RouteLines::new(
            snap.routes
                .first()
                .map(|row| {
                    row.iter()
                        .enumerate()
                        .map(|(d, s)| (d as u32, *s))
                        .collect()
                })
                .unwrap_or_default(),
        )),
        Block::Locks(LockLines::new(viewer_locks)),
    ];
    encode_blocks(&blocks)
}

fn indexed(labels: &[String]) -> Vec<(u32, String)> {
    labels
        .iter()
        .enumerate()
        .map(|(i, l)| (i as u32, l.clone()))
        .collect()
}

async fn run_session(
    engine: Arc<VideohubEngine>,
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
    info!("[Peer {id}] videohub client connected from {addr}");

    // register and push the initial dump inside the model's critical
    // section so no broadcast can slip between the two
    base.model.with_snapshot(Some(id), |snap| {
        base.peers.insert(handle.clone());
        handle.try_send(full_dump(snap));
    });
    base.bus.emit(EngineEvent::ClientConnected {
        id,
        addr: addr.to_string(),
    });

    let mut frames = BlockReader::new();
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
                frames.push(&buf[..n]);
                loop {
                    match frames.next_block() {
                        Ok(Some(block)) => handle_block(&engine, &handle, block),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("[Peer {id}] framing error, closing: {e}");
                            break 'conn;
                        }
                    }
                }
            }
        }
    }

    // Closing: unregister first so the lock-release broadcast reaches
    // the remaining peers only, then drop every lock this peer holds.
    base.peers.remove(id);
    let released = base.model.release_all_locks_held_by(id);
    if !released.is_empty() {
        info!("[Peer {id}] released {} lock(s) on disconnect", released.len());
    }
    base.bus.emit(EngineEvent::ClientDisconnected { id });
    info!("[Peer {id}] videohub client disconnected");

    drop(handle);
    let _ = writer.await;
}

fn handle_block(engine: &Arc<VideohubEngine>, peer: &PeerHandle, block: Block) {
    let base = engine.base();
    let model = &base.model;
    let id = peer.id;

    match block {
        Block::Ping => {
            base.bus.emit(EngineEvent::CommandReceived {
                id,
                description: "ping".to_string(),
            });
            peer.try_send(encode_block(&Block::Ack));
        }
        Block::Routing(lines) => {
            if lines.is_query() {
                base.bus.emit(EngineEvent::CommandReceived {
                    id,
                    description: "query output routing".to_string(),
                });
                model.with_snapshot(Some(id), |snap| {
                    let entries = snap
                        .routes
                        .first()
                        .map(|row| row.iter().enumerate().map(|(d, s)| (d as u32, *s)).collect())
                        .unwrap_or_default();
                    peer.try_send(encode_blocks(&[
                        Block::Ack,
                        Block::Routing(RouteLines::new(entries)),
                    ]));
                });
                return;
            }
            base.bus.emit(EngineEvent::CommandReceived {
                id,
                description: format!("route update ({} entries)", lines.entries.len()),
            });
            let entries: Vec<RouteChange> = lines
                .entries
                .iter()
                .map(|(dest, src)| RouteChange {
                    level: 0,
                    dest: *dest,
                    src: *src,
                })
                .collect();
            let outcome = model.apply_routes(&entries, Some(id), lines.invalid);
            if outcome.all_rejected() {
                peer.try_send(encode_block(&Block::Nak));
            }
            // applied entries were ACKed and broadcast by the listener
        }
        Block::Locks(lines) => {
            if lines.is_query() {
                base.bus.emit(EngineEvent::CommandReceived {
                    id,
                    description: "query output locks".to_string(),
                });
                model.with_snapshot(Some(id), |snap| {
                    let entries = (0..snap.config.outputs)
                        .map(|d| {
                            let c = match snap.lock_view(d) {
                                LockView::Owned => LockChar::Owned,
                                LockView::Locked => LockChar::Locked,
                                LockView::Unlocked => LockChar::Unlocked,
                            };
                            (d, c)
                        })
                        .collect();
                    peer.try_send(encode_blocks(&[
                        Block::Ack,
                        Block::Locks(LockLines::new(entries)),
                    ]));
                });
                return;
            }
            base.bus.emit(EngineEvent::CommandReceived {
                id,
                description: format!("lock update ({} entries)", lines.entries.len()),
            });
            let mut rejected = lines.invalid;
            let mut ops = Vec::with_capacity(lines.entries.len());
            for (dest, c) in &lines.entries {
                match c {
                    LockChar::Owned => ops.push((*dest, LockOp::Own)),
                    LockChar::Unlocked => ops.push((*dest, LockOp::Unlock)),
                    LockChar::ForceUnlock => ops.push((*dest, LockOp::Force)),
                    // `L` is a status rendering, not a request
                    LockChar::Locked => rejected += 1,
                }
            }
            let outcome = model.apply_locks(&ops, id, rejected);
            if outcome.all_rejected() {
                peer.try_send(encode_block(&Block::Nak));
            }
        }
        Block::InputLabels(lines) => {
            handle_label_block(engine, peer, lines, crosspoint_core::LabelTable::Input)
        }
        Block::OutputLabels(lines) => {
            handle_label_block(engine, peer, lines, crosspoint_core::LabelTable::Output)
        }
        Block::Unknown(header) => {
            // unknown headers are ignored silently
            debug!("[Peer {id}] ignoring unknown block {header:?}");
        }
        // status blocks are only ever sent by us
        Block::Ack | Block::Nak | Block::Preamble { .. } | Block::Device(_) => {
            debug!("[Peer {id}] ignoring status block from client");
        }
    }
}

fn handle_label_block(
    engine: &Arc<VideohubEngine>,
    peer: &PeerHandle,
    lines: LabelLines,
    table: crosspoint_core::LabelTable,
) {
    let base = engine.base();
    let id = peer.id;
    let (what, section) = match table {
        crosspoint_core::LabelTable::Input => ("input labels", true),
        _ => ("output labels", false),
    };

    if lines.is_query() {
        base.bus.emit(EngineEvent::CommandReceived {
            id,
            description: format!("query {what}"),
        });
        base.model.with_snapshot(Some(id), |snap| {
            let labels = if section {
                &snap.input_labels
            } else {
                &snap.output_labels
            };
            let block = if section {
                Block::InputLabels(LabelLines::new(indexed(labels)))
            } else {
                Block::OutputLabels(LabelLines::new(indexed(labels)))
            };
            peer.try_send(encode_blocks(&[Block::Ack, block]));
        });
        return;
    }

    base.bus.emit(EngineEvent::CommandReceived {
        id,
        description: format!("{what} update ({} entries)", lines.entries.len()),
    });
    let outcome = base
        .model
        .apply_labels(table, &lines.entries, Some(id), lines.invalid);
    if outcome.all_rejected() {
        peer.try_send(encode_block(&Block::Nak));
    }
}
