//! Shared core for the crosspoint engines: the routing model, the
//! UI-facing event bus, the engine error taxonomy and the persisted
//! settings blob.
//!
//! The model is the only globally mutable state in the system. It is
//! guarded by one mutex; wire listeners run inside the critical section
//! so broadcast order is a linearization of mutation order, and the
//! out-of-band subscriber channel is fed under the same lock.

pub mod error;
pub mod event;
pub mod model;
pub mod settings;

pub use error::EngineError;
pub use event::{EngineEvent, EventBus, LockState, LockStateChange};
pub use model::{
    BatchOutcome, LabelChange, LabelTable, LockChange, LockOp, LockView, ModelEvent, PeerId,
    RouteChange, RouterConfig, RoutingModel, Snapshot, LOCAL_PEER,
};
pub use settings::{ProtocolKind, RouterHistoryEntry, Settings, MAX_ROUTER_HISTORY};
