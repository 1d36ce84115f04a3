//! Message channel adapters
//!
//! - `source` - `MessageSource` trait and message types
//! - `line_source` - JSONL file (optionally followed) and stdin
//! - `memory` - in-process channel
//! - `error_handler` - exponential backoff for reconnects and retries

pub mod error_handler;
pub mod line_source;
pub mod memory;
pub mod source;

pub use error_handler::{ExponentialBackoff, MaxRetriesExceeded};
pub use line_source::LineSource;
pub use memory::{memory_channel, MemorySender, MemorySource};
pub use source::{ChannelError, ChannelMessage, MessageSource, Received};
