//! Source, sink and dead-letter identifiers
//!
//! - source: `stdin`, `memory`, `jsonl:<path>` or a bare path
//! - sink: `sqlite:<path>` or a bare path
//! - dead letter: `jsonl:<path>` or `sqlite:<path>`

use crate::channel::{ChannelError, LineSource, MessageSource};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::dead_letter::{DeadLetterBackend, JsonlDeadLetterWriter, SqliteDeadLetterWriter, WriterError};
use crate::sink::{AnalyticsSink, SinkError, SqliteSink};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum EndpointError {
    #[error("empty {0} identifier")]
    Empty(&'static str),

    #[error("unsupported {kind} scheme {scheme:?} (expected {expected})")]
    UnsupportedScheme {
        kind: &'static str,
        scheme: String,
        expected: &'static str,
    },

    #[error("{0} requires a path")]
    MissingPath(&'static str),
}

/// Split `scheme:rest`; a Windows drive letter or a bare path has no scheme
fn split_scheme(id: &str) -> (Option<&str>, &str) {
    match id.split_once(':') {
        Some((scheme, rest)) if scheme.len() > 1 && scheme.chars().all(|c| c.is_ascii_alphanumeric()) => {
            (Some(scheme), rest)
        }
        _ => (None, id),
    }
}

fn require_path(kind: &'static str, path: &str) -> Result<PathBuf, EndpointError> {
    if path.trim().is_empty() {
        return Err(EndpointError::MissingPath(kind));
    }
    Ok(PathBuf::from(path))
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceSpec {
    Stdin,
    /// In-process channel; only meaningful to embedders
    Memory,
    Jsonl(PathBuf),
}

impl FromStr for SourceSpec {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointError::Empty("source"));
        }
        match s {
            "stdin" | "-" => return Ok(SourceSpec::Stdin),
            "memory" => return Ok(SourceSpec::Memory),
            _ => {}
        }
        match split_scheme(s) {
            (Some("jsonl"), path) => Ok(SourceSpec::Jsonl(require_path("jsonl source", path)?)),
            (Some(scheme), _) => Err(EndpointError::UnsupportedScheme {
                kind: "source",
                scheme: scheme.to_string(),
                expected: "stdin, jsonl:<path> or a path",
            }),
            (None, path) => Ok(SourceSpec::Jsonl(PathBuf::from(path))),
        }
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::Stdin => f.write_str("stdin"),
            SourceSpec::Memory => f.write_str("memory"),
            SourceSpec::Jsonl(path) => write!(f, "jsonl:{}", path.display()),
        }
    }
}

impl SourceSpec {
    pub async fn open(&self, follow: bool, start_cursor: u64) -> Result<Box<dyn MessageSource>, ChannelError> {
        match self {
            SourceSpec::Stdin => {
                if start_cursor > 0 {
                    log::warn!("⚠️  --start-cursor is ignored for stdin");
                }
                Ok(Box::new(LineSource::stdin()))
            }
            SourceSpec::Jsonl(path) => Ok(Box::new(LineSource::open_file(path, follow, start_cursor).await?)),
            SourceSpec::Memory => Err(ChannelError::Unavailable(
                "memory source can only be created in-process (channel::memory_channel)".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkSpec {
    Sqlite(PathBuf),
}

impl FromStr for SinkSpec {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointError::Empty("sink"));
        }
        match split_scheme(s) {
            (Some("sqlite"), path) => Ok(SinkSpec::Sqlite(require_path("sqlite sink", path)?)),
            (Some(scheme), _) => Err(EndpointError::UnsupportedScheme {
                kind: "sink",
                scheme: scheme.to_string(),
                expected: "sqlite:<path> or a path",
            }),
            (None, path) => Ok(SinkSpec::Sqlite(PathBuf::from(path))),
        }
    }
}

impl fmt::Display for SinkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkSpec::Sqlite(path) => write!(f, "sqlite:{}", path.display()),
        }
    }
}

impl SinkSpec {
    /// Statements wait on locks for at most the sink write timeout
    pub fn open(&self, config: &PipelineConfig) -> Result<Box<dyn AnalyticsSink>, SinkError> {
        match self {
            SinkSpec::Sqlite(path) => Ok(Box::new(SqliteSink::open(path, config.sink_write_timeout)?)),
        }
    }

    fn dir(&self) -> &Path {
        match self {
            SinkSpec::Sqlite(path) => path.parent().unwrap_or_else(|| Path::new("")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeadLetterSpec {
    Jsonl(PathBuf),
    Sqlite(PathBuf),
}

impl FromStr for DeadLetterSpec {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointError::Empty("dead-letter"));
        }
        match split_scheme(s) {
            (Some("jsonl"), path) => Ok(DeadLetterSpec::Jsonl(require_path("jsonl dead-letter", path)?)),
            (Some("sqlite"), path) => Ok(DeadLetterSpec::Sqlite(require_path("sqlite dead-letter", path)?)),
            (Some(scheme), _) => Err(EndpointError::UnsupportedScheme {
                kind: "dead-letter",
                scheme: scheme.to_string(),
                expected: "jsonl:<path> or sqlite:<path>",
            }),
            (None, path) => Ok(DeadLetterSpec::Jsonl(PathBuf::from(path))),
        }
    }
}

impl fmt::Display for DeadLetterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterSpec::Jsonl(path) => write!(f, "jsonl:{}", path.display()),
            DeadLetterSpec::Sqlite(path) => write!(f, "sqlite:{}", path.display()),
        }
    }
}

impl DeadLetterSpec {
    /// `dead_letters.jsonl` next to the sink database
    pub fn default_for(sink: &SinkSpec) -> Self {
        DeadLetterSpec::Jsonl(sink.dir().join("dead_letters.jsonl"))
    }

    pub fn open(&self, config: &PipelineConfig) -> Result<Box<dyn DeadLetterBackend>, WriterError> {
        match self {
            DeadLetterSpec::Jsonl(path) => Ok(Box::new(JsonlDeadLetterWriter::new(
                path,
                config.dead_letter_max_size_mb,
                config.dead_letter_max_rotations,
            )?)),
            DeadLetterSpec::Sqlite(path) => Ok(Box::new(SqliteDeadLetterWriter::open(
                path,
                config.dead_letter_write_timeout,
            )?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sources() {
        assert_eq!("stdin".parse::<SourceSpec>().unwrap(), SourceSpec::Stdin);
        assert_eq!("memory".parse::<SourceSpec>().unwrap(), SourceSpec::Memory);
        assert_eq!(
            "jsonl:/data/vitals.jsonl".parse::<SourceSpec>().unwrap(),
            SourceSpec::Jsonl(PathBuf::from("/data/vitals.jsonl"))
        );
        assert_eq!(
            "vitals.jsonl".parse::<SourceSpec>().unwrap(),
            SourceSpec::Jsonl(PathBuf::from("vitals.jsonl"))
        );
        assert!(matches!(
            "kafka:vitals".parse::<SourceSpec>(),
            Err(EndpointError::UnsupportedScheme { .. })
        ));
        assert_eq!("jsonl:".parse::<SourceSpec>(), Err(EndpointError::MissingPath("jsonl source")));
        assert_eq!("  ".parse::<SourceSpec>(), Err(EndpointError::Empty("source")));
    }

    #[test]
    fn test_parse_sinks() {
        assert_eq!(
            "sqlite:/var/lib/vitalflow/vitals.db".parse::<SinkSpec>().unwrap(),
            SinkSpec::Sqlite(PathBuf::from("/var/lib/vitalflow/vitals.db"))
        );
        assert_eq!(
            "vitals.db".parse::<SinkSpec>().unwrap(),
            SinkSpec::Sqlite(PathBuf::from("vitals.db"))
        );
        assert!("bigquery:project.dataset".parse::<SinkSpec>().is_err());
    }

    #[test]
    fn test_windows_drive_letter_is_a_path() {
        assert_eq!(
            r"C:\data\vitals.db".parse::<SinkSpec>().unwrap(),
            SinkSpec::Sqlite(PathBuf::from(r"C:\data\vitals.db"))
        );
    }

    #[test]
    fn test_default_dead_letter_next_to_sink() {
        let sink: SinkSpec = "sqlite:/var/lib/vitalflow/vitals.db".parse().unwrap();
        assert_eq!(
            DeadLetterSpec::default_for(&sink),
            DeadLetterSpec::Jsonl(PathBuf::from("/var/lib/vitalflow/dead_letters.jsonl"))
        );

        let bare: SinkSpec = "vitals.db".parse().unwrap();
        assert_eq!(
            DeadLetterSpec::default_for(&bare),
            DeadLetterSpec::Jsonl(PathBuf::from("dead_letters.jsonl"))
        );
    }

    #[test]
    fn test_display_roundtrips() {
        let spec: DeadLetterSpec = "sqlite:dl.db".parse().unwrap();
        assert_eq!(spec.to_string(), "sqlite:dl.db");
    }

    #[tokio::test]
    async fn test_memory_source_not_openable() {
        assert!(SourceSpec::Memory.open(false, 0).await.is_err());
    }
}
