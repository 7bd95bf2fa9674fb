//! Admission control for long-lived streaming connections.

mod controller;
mod guard;

pub use controller::{
    ConnectionCheck, ConnectionController, ConnectionCounts, ConnectionLimits, CountsSnapshot,
    DimensionCount, FailurePolicy, SseConnectionLimitError,
};
pub use guard::ConnectionGuard;
