//! Turnstile - Distributed Admission Control
//!
//! This crate bounds how much work a single tenant can impose on a
//! horizontally-scaled fleet when no instance holds authoritative state. All
//! coordination goes through a shared counter store:
//!
//! - [`ratelimit::SlidingWindowLimiter`] throttles discrete operations per key
//!   over a rolling time window, failing open if the store is down.
//! - [`connection::ConnectionController`] bounds simultaneous long-lived
//!   connections per user and per company, handing out
//!   [`connection::ConnectionGuard`]s that give the slot back on release.

pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use connection::{ConnectionController, ConnectionGuard, SseConnectionLimitError};
pub use error::{AdmissionError, Result};
pub use ratelimit::{RateLimitResult, SlidingWindowLimiter};
pub use store::CounterStore;
