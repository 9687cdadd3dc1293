//! Shared helpers for provider implementations.

pub mod http;
pub mod ndjson;
pub mod openai_compat;
pub mod sse;
