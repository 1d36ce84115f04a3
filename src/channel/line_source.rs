//! Newline-delimited message source over a file or stdin
//!
//! Cursor = number of lines consumed. A run started with `start_cursor = N`
//! skips the first N lines, so the cursor from a previous run's report resumes
//! right after the last message it handed out.
//!
//! In follow mode the file is tailed: EOF yields `Received::Idle`, a trailing
//! partial line waits for its newline, and a replaced (new inode) or truncated
//! file is reopened from the start.

use super::source::{ChannelError, ChannelMessage, MessageSource, Received};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

type LineReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

pub struct LineSource {
    reader: LineReader,
    path: Option<PathBuf>,
    inode: Option<u64>,
    /// Bytes consumed from the current file, for truncation detection
    offset: u64,
    pending: Vec<u8>,
    cursor: u64,
    skip: u64,
    follow: bool,
    source_type: &'static str,
}

impl LineSource {
    /// Open a JSONL file, skipping the first `start_cursor` lines
    pub async fn open_file(path: impl AsRef<Path>, follow: bool, start_cursor: u64) -> Result<Self, ChannelError> {
        let path = path.as_ref().to_path_buf();
        let (reader, inode) = open_reader(&path).await?;

        log::info!(
            "📖 Reading {} (follow: {}, start cursor: {})",
            path.display(),
            follow,
            start_cursor
        );

        Ok(Self {
            reader,
            path: Some(path),
            inode,
            offset: 0,
            pending: Vec::new(),
            cursor: start_cursor,
            skip: start_cursor,
            follow,
            source_type: "JSONL",
        })
    }

    pub fn stdin() -> Self {
        Self::from_reader(tokio::io::stdin(), "stdin")
    }

    /// Wrap any byte stream; EOF closes the source
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static, source_type: &'static str) -> Self {
        let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            reader: BufReader::new(boxed),
            path: None,
            inode: None,
            offset: 0,
            pending: Vec::new(),
            cursor: 0,
            skip: 0,
            follow: false,
            source_type,
        }
    }

    /// Whether the followed file was replaced or truncated since it was opened
    async fn detect_rotation(&mut self) -> Result<bool, ChannelError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            // Mid-rotation: old file moved away, new one not created yet
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        #[cfg(unix)]
        {
            if self.inode.map_or(false, |old| old != metadata.ino()) {
                return Ok(true);
            }
        }

        Ok(metadata.len() < self.offset)
    }

    async fn reopen(&mut self) -> Result<(), ChannelError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let (reader, inode) = open_reader(&path).await?;
        self.reader = reader;
        self.inode = inode;
        self.offset = 0;
        self.pending.clear();
        log::info!("🔄 File rotation detected, reopened: {}", path.display());
        Ok(())
    }

    /// Take the completed line out of `pending`; None for blank or skipped lines
    fn take_line(&mut self) -> Option<ChannelMessage> {
        let line = std::mem::take(&mut self.pending);
        if self.skip > 0 {
            self.skip -= 1;
            return None;
        }

        self.cursor += 1;
        let payload = trim_line(&line);
        if payload.is_empty() {
            return None;
        }
        Some(ChannelMessage {
            payload: payload.to_vec(),
            cursor: self.cursor,
        })
    }
}

async fn open_reader(path: &Path) -> Result<(LineReader, Option<u64>), ChannelError> {
    let file = File::open(path).await?;
    #[allow(unused_variables)]
    let metadata = file.metadata().await?;

    #[cfg(unix)]
    let inode = Some(metadata.ino());
    #[cfg(not(unix))]
    let inode = None;

    let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(file);
    Ok((BufReader::new(boxed), inode))
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &line[start..end]
}

#[async_trait]
impl MessageSource for LineSource {
    async fn recv(&mut self) -> Result<Received, ChannelError> {
        loop {
            // read_until appends to `pending`, so a cancelled read loses nothing
            let read = self.reader.read_until(b'\n', &mut self.pending).await?;
            self.offset += read as u64;

            if read > 0 {
                if self.pending.last() == Some(&b'\n') {
                    if let Some(message) = self.take_line() {
                        return Ok(Received::Message(message));
                    }
                }
                continue;
            }

            // EOF
            if self.follow {
                if self.detect_rotation().await? {
                    self.reopen().await?;
                    continue;
                }
                return Ok(Received::Idle);
            }

            if !self.pending.is_empty() {
                if let Some(message) = self.take_line() {
                    return Ok(Received::Message(message));
                }
                continue;
            }

            return Ok(Received::Closed);
        }
    }

    fn cursor(&self) -> u64 {
        self.cursor
    }

    fn source_type(&self) -> &'static str {
        self.source_type
    }
}
