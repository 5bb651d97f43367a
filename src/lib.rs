//! Office Presence Agent Library
//!
//! Presence state machine, durable event queue and the sync/authentication
//! engine behind the desktop attendance agent.

pub mod api;
pub mod auth;
pub mod commands;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod logging;
pub mod model;
pub mod presence;
pub mod probe;
pub mod queue;
pub mod service;
pub mod storage;
pub mod sync;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use config::AgentConfig;
pub use error::{Error, Result};
pub use service::{PresenceObserver, PresenceService};
