pub mod client;
pub mod models;

pub use client::{BoxedReader, BoxedWriter, McpConnection};
pub use models::*;
