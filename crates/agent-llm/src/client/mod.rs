//! Decorators that wrap a provider while keeping its contract.

pub mod retry;

pub use retry::{RetryConfig, RetryProvider};
