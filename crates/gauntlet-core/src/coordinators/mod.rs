//! Retry coordinators
//!
//! CSRF refresh and rate-limit backoff. Both operate only on the
//! [`ExecutionContext`](crate::context::ExecutionContext) they are handed and
//! hold no process-wide state.

mod client;
mod csrf;
mod rate_limit;

pub use client::DirectClient;
pub use csrf::{CsrfConfig, CsrfCoordinator, TokenSource, TokenTarget};
pub use rate_limit::{RateLimitConfig, RateLimitCoordinator};
