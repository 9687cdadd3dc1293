pub mod stdio;

pub use stdio::{StdioProcess, StdioTransport};
