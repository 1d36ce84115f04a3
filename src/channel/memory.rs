//! In-process channel for embedders and tests

use super::source::{ChannelError, ChannelMessage, MessageSource, Received};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Producer side of a memory channel; dropping every sender closes the source
#[derive(Clone)]
pub struct MemorySender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl MemorySender {
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), ChannelError> {
        self.tx
            .send(payload.into())
            .await
            .map_err(|_| ChannelError::Unavailable("memory source dropped".to_string()))
    }
}

pub struct MemorySource {
    rx: mpsc::Receiver<Vec<u8>>,
    cursor: u64,
}

pub fn memory_channel(capacity: usize) -> (MemorySender, MemorySource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (MemorySender { tx }, MemorySource { rx, cursor: 0 })
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn recv(&mut self) -> Result<Received, ChannelError> {
        match self.rx.recv().await {
            Some(payload) => {
                self.cursor += 1;
                Ok(Received::Message(ChannelMessage {
                    payload,
                    cursor: self.cursor,
                }))
            }
            None => Ok(Received::Closed),
        }
    }

    fn cursor(&self) -> u64 {
        self.cursor
    }

    fn source_type(&self) -> &'static str {
        "Memory"
    }
}
