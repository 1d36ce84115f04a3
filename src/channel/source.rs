use async_trait::async_trait;
use thiserror::Error;

/// One raw message pulled from the channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub payload: Vec<u8>,
    /// Position after this message; resuming from it skips everything up to
    /// and including this message
    pub cursor: u64,
}

/// Result of a single poll
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Message(ChannelMessage),
    /// Nothing available right now (followed file at EOF)
    Idle,
    /// Finite source exhausted or producer gone
    Closed,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel unavailable: {0}")]
    Unavailable(String),
}

/// Durable message channel the pipeline reads from
///
/// `recv` must be cancel-safe: the reader wraps it in a timeout and a message
/// half-read when the timeout fires must not be lost.
#[async_trait]
pub trait MessageSource: Send {
    async fn recv(&mut self) -> Result<Received, ChannelError>;

    /// Cursor of the last message returned
    fn cursor(&self) -> u64;

    /// Source type for logging
    fn source_type(&self) -> &'static str;
}
