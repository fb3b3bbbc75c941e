//! Retry and backoff for remote calls.
//!
//! - `backoff`: delay schedules, also used for lock polling
//! - `classify`: retryable vs fatal decisions, parsing of collaborator errors
//! - `coordinator`: the retry loop itself

pub mod backoff;
pub mod classify;
pub mod coordinator;

pub use backoff::Backoff;
pub use classify::{ErrorClass, classify};
pub use coordinator::{DEFAULT_RATE_LIMIT_DELAY, RetryCoordinator, RetryPolicy};
