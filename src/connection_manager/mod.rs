//! Connection registry, per-connection handles and statistics

mod registry;
mod stats;
mod types;

pub use registry::{BindOutcome, ConnectionRegistry, UnregisterOutcome};
pub use stats::{ConnectionInfo, ConnectionStats, UserPresenceInfo};
pub use types::{ConnectionError, ConnectionHandle, ConnectionLimits, ConnectionState};
