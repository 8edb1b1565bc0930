//! crosspoint-client: controller-side engines for the three router
//! protocols.
//!
//! Each client keeps a local [`mirror::Mirror`] of the router state,
//! resynchronizes it on connect, applies writes optimistically with
//! rollback on rejection, and reconnects with exponential backoff when
//! the connection drops.

pub mod config;
pub mod gvnative;
pub mod mirror;
pub mod swp08;
mod task;
pub mod videohub;

pub use config::ClientConfig;
pub use gvnative::GvNativeClient;
pub use mirror::Mirror;
pub use swp08::Swp08Client;
pub use videohub::VideohubClient;

use crosspoint_core::{EngineError, EngineEvent, LockOp, ProtocolKind};

/// Protocol-indexed client dispatch: pick an implementation by name,
/// program against one capability surface.
pub enum AnyClient {
    Videohub(VideohubClient),
    Swp08(Swp08Client),
    GvNative(GvNativeClient),
}

impl AnyClient {
    pub fn new(protocol: ProtocolKind, config: ClientConfig) -> Self {
        match protocol {
            ProtocolKind::Videohub => AnyClient::Videohub(VideohubClient::new(config)),
            ProtocolKind::Swp08 => AnyClient::Swp08(Swp08Client::new(config)),
            ProtocolKind::GvNative => AnyClient::GvNative(GvNativeClient::new(config)),
        }
    }

    pub fn protocol(&self) -> ProtocolKind {
        match self {
            AnyClient::Videohub(_) => ProtocolKind::Videohub,
            AnyClient::Swp08(_) => ProtocolKind::Swp08,
            AnyClient::GvNative(_) => ProtocolKind::GvNative,
        }
    }

    pub async fn connect(&self) -> Result<(), EngineError> {
        match self {
            AnyClient::Videohub(c) => c.connect().await,
            AnyClient::Swp08(c) => c.connect().await,
            AnyClient::GvNative(c) => c.connect().await,
        }
    }

    pub async fn disconnect(&self) {
        match self {
            AnyClient::Videohub(c) => c.disconnect().await,
            AnyClient::Swp08(c) => c.disconnect().await,
            AnyClient::GvNative(c) => c.disconnect().await,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            AnyClient::Videohub(c) => c.is_connected(),
            AnyClient::Swp08(c) => c.is_connected(),
            AnyClient::GvNative(c) => c.is_connected(),
        }
    }

    pub fn state(&self) -> Mirror {
        match self {
            AnyClient::Videohub(c) => c.state(),
            AnyClient::Swp08(c) => c.state(),
            AnyClient::GvNative(c) => c.state(),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        match self {
            AnyClient::Videohub(c) => c.subscribe(),
            AnyClient::Swp08(c) => c.subscribe(),
            AnyClient::GvNative(c) => c.subscribe(),
        }
    }

    /// Route `src` to `dest` on `level` (VideoHub ignores the level).
    pub fn set_route(&self, dest: u32, src: u32, level: u32) -> bool {
        match self {
            AnyClient::Videohub(c) => c.set_route(dest, src).is_ok(),
            AnyClient::Swp08(c) => c.set_route(dest, src, level).is_ok(),
            AnyClient::GvNative(c) => c.set_route(dest, src, level).is_ok(),
        }
    }

    /// Destination locks exist on VideoHub only; other protocols
    /// report failure.
    pub fn set_lock(&self, dest: u32, op: LockOp) -> bool {
        match self {
            AnyClient::Videohub(c) => c.set_lock(dest, op).is_ok(),
            AnyClient::Swp08(_) | AnyClient::GvNative(_) => false,
        }
    }

    /// Label writes exist on VideoHub only; other protocols report
    /// failure.
    pub fn set_input_label(&self, index: u32, label: &str) -> bool {
        match self {
            AnyClient::Videohub(c) => c.set_input_label(index, label).is_ok(),
            AnyClient::Swp08(_) | AnyClient::GvNative(_) => false,
        }
    }

    pub fn set_output_label(&self, index: u32, label: &str) -> bool {
        match self {
            AnyClient::Videohub(c) => c.set_output_label(index, label).is_ok(),
            AnyClient::Swp08(_) | AnyClient::GvNative(_) => false,
        }
    }
}
