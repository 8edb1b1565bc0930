//! crosspoint-server: TCP server engines that simulate a broadcast
//! video router speaking VideoHub, SW-P-08 and GV Native.
//!
//! All engines mutate one shared [`crosspoint_core::RoutingModel`];
//! committed changes fan out to every connected peer in the protocol's
//! own vocabulary and to the UI subscriber channel.

pub mod engine;
pub mod logging;
pub mod peer;

pub use engine::{AnyEngine, EngineConfig, GvNativeEngine, Swp08Engine, VideohubEngine};
