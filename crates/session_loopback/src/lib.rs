//! Loopback session backend.
//!
//! Implements the session capability entirely in memory so hosting and joining work
//! without any online service. All backends built on the same [`LoopbackNetwork`] see
//! each other's advertised sessions, like players on one LAN. The backend reports the
//! `NULL` subsystem, so sessions created through it are LAN matches.

/// In-memory session backend
pub mod backend;
/// Loopback error types
pub mod error;
/// Shared registry of advertised sessions
pub mod network;
/// Async completion pump
pub mod pump;

pub use backend::{BackendRequest, DeliveryMode, LoopbackSessionBackend};
pub use error::LoopbackError;
pub use network::LoopbackNetwork;
pub use pump::CallbackPump;
