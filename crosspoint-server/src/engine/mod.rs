//! Server engines: one TCP listener per protocol, all mutating the
//! shared routing model and broadcasting through per-peer writer
//! queues.
//!
//! The three engines share one connection-handling shape: an accept
//! loop spawning one reader task per connection, a dedicated writer
//! task fed by a bounded queue, and a shutdown watch that drains
//! everything on `stop()`. Protocol specifics live in the per-protocol
//! session modules.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use log::{error, info};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};

use crosspoint_core::{
    EngineError, EngineEvent, EventBus, LockOp, LockState, LockStateChange, ModelEvent,
    ProtocolKind, RoutingModel, Settings, Snapshot, LOCAL_PEER,
};

use crate::peer::PeerRegistry;

pub mod gvnative;
pub mod swp08;
pub mod videohub;

pub use gvnative::GvNativeEngine;
pub use swp08::Swp08Engine;
pub use videohub::VideohubEngine;

/// Listener configuration for one engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind: IpAddr,
    pub port: u16,
}

impl EngineConfig {
    pub fn for_protocol(protocol: ProtocolKind) -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: protocol.default_port(),
        }
    }
}

pub(crate) type SessionFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub(crate) type SessionFactory =
    Arc<dyn Fn(TcpStream, SocketAddr, watch::Receiver<bool>) -> SessionFuture + Send + Sync>;

struct Running {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// State common to every engine: model, peers, bus, listener lifecycle.
pub(crate) struct EngineBase {
    pub protocol: ProtocolKind,
    pub model: Arc<RoutingModel>,
    pub peers: Arc<PeerRegistry>,
    pub bus: EventBus,
    config: Mutex<EngineConfig>,
    running: AsyncMutex<Option<Running>>,
}

impl EngineBase {
    pub fn new(protocol: ProtocolKind, model: Arc<RoutingModel>, config: EngineConfig) -> Self {
        let bus = EventBus::new();
        let forward = bus.clone();
        // feed the UI subscriber channel from inside the model's
        // critical section so event order matches mutation order
        model.add_wire_listener(Box::new(move |event, _origin| {
            forward.emit(ui_event(event));
        }));
        Self {
            protocol,
            model,
            peers: PeerRegistry::new(),
            bus,
            config: Mutex::new(config),
            running: AsyncMutex::new(None),
        }
    }

    /// Bind the listener and spawn the accept loop. Idempotent: a
    /// running engine returns its current port.
    pub async fn start(&self, factory: SessionFactory) -> Result<u16, EngineError> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Ok(r.port);
        }

        let cfg = self.config.lock().clone();
        let listener = TcpListener::bind(SocketAddr::new(cfg.bind, cfg.port)).await?;
        let port = listener.local_addr()?.port();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let protocol = self.protocol;
        let accept_task = tokio::spawn(accept_loop(listener, shutdown_rx, factory, protocol));

        *running = Some(Running {
            port,
            shutdown_tx,
            accept_task,
        });
        info!("[{}] listening on {}:{port}", protocol.name(), cfg.bind);
        self.bus.emit(EngineEvent::ServerStarted { port });
        Ok(port)
    }

    /// Graceful shutdown: close the listener, signal every connection
    /// task, drop the peer queues and await termination.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(r) = running {
            let _ = r.shutdown_tx.send(true);
            self.peers.clear();
            if r.accept_task.await.is_err() {
                error!("[{}] accept loop panicked", self.protocol.name());
            }
            info!("[{}] stopped", self.protocol.name());
            self.bus.emit(EngineEvent::ServerStopped);
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Apply new settings. The matrix reconfigures immediately; a port
    /// change takes effect on the next `start()`.
    pub fn update_config(&self, settings: &Settings) {
        self.config.lock().port = settings.port;
        self.model.update_config(settings.router_config());
    }

    // UI-facing mutation surface: local writes use the reserved peer id
    // and follow the same broadcast path as wire-originated writes.

    pub fn set_route(&self, dest: u32, src: u32, level: u32) -> bool {
        self.model
            .set_route(level, dest, src, Some(LOCAL_PEER))
            .is_ok()
    }

    pub fn set_input_label(&self, index: u32, label: &str) -> bool {
        self.model
            .set_input_label(index, label.to_string(), Some(LOCAL_PEER))
            .is_ok()
    }

    pub fn set_output_label(&self, index: u32, label: &str) -> bool {
        self.model
            .set_output_label(index, label.to_string(), Some(LOCAL_PEER))
            .is_ok()
    }

    pub fn set_lock(&self, dest: u32, op: LockOp) -> bool {
        self.model.set_lock(dest, op, LOCAL_PEER).is_ok()
    }

    pub fn get_state(&self) -> Snapshot {
        self.model.snapshot(Some(LOCAL_PEER))
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
    factory: SessionFactory,
    protocol: ProtocolKind,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    sessions.spawn(factory(socket, addr, shutdown_rx.clone()));
                }
                Err(e) => {
                    error!("[{}] accept failed: {e}", protocol.name());
                }
            }
        }
    }
    drop(listener);
    while sessions.join_next().await.is_some() {}
}

/// Map a committed model event onto the UI event vocabulary. Lock
/// ownership is rendered relative to the local UI caller.
fn ui_event(event: &ModelEvent) -> EngineEvent {
    match event {
        ModelEvent::RoutingChanged(changes) => EngineEvent::RoutingChanged(changes.clone()),
        ModelEvent::LocksChanged(changes) => EngineEvent::LocksChanged(
            changes
                .iter()
                .map(|c| LockStateChange {
                    dest: c.dest,
                    state: match c.owner {
                        None => LockState::Unlocked,
                        Some(LOCAL_PEER) => LockState::OwnedBySelf,
                        Some(_) => LockState::OwnedByOther,
                    },
                })
                .collect(),
        ),
        ModelEvent::InputLabelsChanged(changes) => {
            EngineEvent::InputLabelsChanged(changes.clone())
        }
        ModelEvent::OutputLabelsChanged(changes) => {
            EngineEvent::OutputLabelsChanged(changes.clone())
        }
        ModelEvent::LevelNamesChanged(changes) => {
            EngineEvent::LevelNamesChanged(changes.clone())
        }
    }
}

/// Protocol-indexed engine dispatch: the UI picks an implementation by
/// name and only ever sees this capability surface.
pub enum AnyEngine {
    Videohub(Arc<VideohubEngine>),
    Swp08(Arc<Swp08Engine>),
    GvNative(Arc<GvNativeEngine>),
}

impl AnyEngine {
    pub fn new(protocol: ProtocolKind, model: Arc<RoutingModel>, config: EngineConfig) -> Self {
        match protocol {
            ProtocolKind::Videohub => AnyEngine::Videohub(VideohubEngine::new(model, config)),
            ProtocolKind::Swp08 => AnyEngine::Swp08(Swp08Engine::new(model, config)),
            ProtocolKind::GvNative => AnyEngine::GvNative(GvNativeEngine::new(model, config)),
        }
    }

    pub fn protocol(&self) -> ProtocolKind {
        match self {
            AnyEngine::Videohub(_) => ProtocolKind::Videohub,
            AnyEngine::Swp08(_) => ProtocolKind::Swp08,
            AnyEngine::GvNative(_) => ProtocolKind::GvNative,
        }
    }

    fn base(&self) -> &EngineBase {
        match self {
            AnyEngine::Videohub(e) => e.base(),
            AnyEngine::Swp08(e) => e.base(),
            AnyEngine::GvNative(e) => e.base(),
        }
    }

    pub async fn start(&self) -> Result<u16, EngineError> {
        match self {
            AnyEngine::Videohub(e) => e.start().await,
            AnyEngine::Swp08(e) => e.start().await,
            AnyEngine::GvNative(e) => e.start().await,
        }
    }

    pub async fn stop(&self) {
        self.base().stop().await
    }

    pub async fn is_running(&self) -> bool {
        self.base().is_running().await
    }

    pub fn update_config(&self, settings: &Settings) {
        self.base().update_config(settings)
    }

    pub fn set_route(&self, dest: u32, src: u32, level: u32) -> bool {
        self.base().set_route(dest, src, level)
    }

    pub fn set_input_label(&self, index: u32, label: &str) -> bool {
        self.base().set_input_label(index, label)
    }

    pub fn set_output_label(&self, index: u32, label: &str) -> bool {
        self.base().set_output_label(index, label)
    }

    pub fn set_lock(&self, dest: u32, op: LockOp) -> bool {
        self.base().set_lock(dest, op)
    }

    pub fn get_state(&self) -> Snapshot {
        self.base().get_state()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.base().subscribe()
    }
}
