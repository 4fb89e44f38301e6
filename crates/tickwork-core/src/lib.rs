//! `tickwork-core` — configuration, shared state types and errors used by the
//! scheduling engine and the `tickwork` binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::{EngineConfig, TickworkConfig};
pub use error::{Result, TickworkError};
pub use types::{JobId, JobOutcome, JobState, StateChanges};
