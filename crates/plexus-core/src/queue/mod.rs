//! Bounded queue with fixed-delay retry.
//!
//! Used to serialize calls into stateful local resources: hardware status
//! queries and the model-serving backend's health and load endpoints.

mod executor;
mod retry;

pub use executor::{BoundedQueue, TaskHandle};
pub use retry::{retry_fixed, RetryPolicy, RetryStats};
