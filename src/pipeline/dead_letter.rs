//! Dead-letter routing for messages the pipeline cannot deliver
//!
//! Every write is best-effort: failures and timeouts are logged and counted,
//! never returned to the caller.

use super::types::{format_ts, DeadLetterReason, DeadLetterRecord};
use crate::sink::schema::{run_migrations, DEAD_LETTERS};
use crate::sink::sqlite_pragma::{apply_optimized_pragmas, DEFAULT_BUSY_TIMEOUT};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Writer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait DeadLetterBackend: Send {
    /// Persist a single dead-letter record
    async fn write(&mut self, record: &DeadLetterRecord) -> Result<(), WriterError>;

    /// Flush pending writes to storage
    async fn flush(&mut self) -> Result<(), WriterError>;

    /// Backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// Run blocking file or database work on the blocking pool
///
/// The router's write timeout can then give up on a stuck write; the state
/// lock is taken inside the blocking task.
async fn run_blocking<S, T, F>(state: &Arc<Mutex<S>>, f: F) -> Result<T, WriterError>
where
    S: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut S) -> Result<T, WriterError> + Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || {
        let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    })
    .await?
}

/// Append-only JSONL file with size-based rotation
///
/// `dead_letters.jsonl` rotates to `dead_letters.jsonl.1`, older files shift
/// up, and anything past `max_rotations` is removed.
pub struct JsonlDeadLetterWriter {
    file: Arc<Mutex<JsonlFile>>,
}

struct JsonlFile {
    file: BufWriter<File>,
    current_size: u64,
    max_size: u64,
    base_path: PathBuf,
    rotation_count: u32,
    max_rotations: u32,
}

impl JsonlDeadLetterWriter {
    pub fn new(path: impl AsRef<Path>, max_size_mb: u64, max_rotations: u32) -> Result<Self, WriterError> {
        Self::with_max_bytes(path.as_ref(), max_size_mb.max(1) * 1024 * 1024, max_rotations)
    }

    fn with_max_bytes(path: &Path, max_size: u64, max_rotations: u32) -> Result<Self, WriterError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let current_size = file.metadata()?.len();

        Ok(Self {
            file: Arc::new(Mutex::new(JsonlFile {
                file: BufWriter::new(file),
                current_size,
                max_size: max_size.max(1),
                base_path: path.to_path_buf(),
                rotation_count: 0,
                max_rotations: max_rotations.max(1),
            })),
        })
    }
}

impl JsonlFile {
    fn append(&mut self, line: &str) -> Result<(), WriterError> {
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;

        self.current_size += (line.len() + 1) as u64;
        if self.current_size >= self.max_size {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotated_path(&self, index: u32) -> PathBuf {
        let mut name = self.base_path.as_os_str().to_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> Result<(), WriterError> {
        self.file.flush()?;

        let oldest = self.rotated_path(self.max_rotations);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        for i in (1..self.max_rotations).rev() {
            let old_path = self.rotated_path(i);
            if old_path.exists() {
                std::fs::rename(&old_path, self.rotated_path(i + 1))?;
            }
        }
        if self.base_path.exists() {
            std::fs::rename(&self.base_path, self.rotated_path(1))?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.base_path)?;
        self.file = BufWriter::new(file);
        self.current_size = 0;
        self.rotation_count += 1;

        log::info!("📄 Rotated dead-letter file (rotation #{})", self.rotation_count);
        Ok(())
    }
}

#[async_trait]
impl DeadLetterBackend for JsonlDeadLetterWriter {
    async fn write(&mut self, record: &DeadLetterRecord) -> Result<(), WriterError> {
        let line = serde_json::to_string(record)?;
        run_blocking(&self.file, move |file| file.append(&line)).await
    }

    async fn flush(&mut self) -> Result<(), WriterError> {
        run_blocking(&self.file, |file| Ok(file.file.flush()?)).await
    }

    fn backend_type(&self) -> &'static str {
        "JSONL"
    }
}

/// `dead_letters` table in a SQLite database
pub struct SqliteDeadLetterWriter {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDeadLetterWriter {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, WriterError> {
        Self::open(db_path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open with an explicit lock wait, normally the dead-letter write timeout
    pub fn open(db_path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, WriterError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn, busy_timeout)?;
        run_migrations(&conn, &[("02_dead_letters", DEAD_LETTERS)])?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl DeadLetterBackend for SqliteDeadLetterWriter {
    async fn write(&mut self, record: &DeadLetterRecord) -> Result<(), WriterError> {
        let record = record.clone();
        run_blocking(&self.conn, move |conn| {
            conn.execute(
                "INSERT INTO dead_letters (raw_payload, payload_encoding, reason, detail, arrival_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.raw_payload,
                    record.payload_encoding.as_str(),
                    record.reason.as_str(),
                    record.detail,
                    format_ts(&record.arrival_ts),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn flush(&mut self) -> Result<(), WriterError> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}

/// In-process backend for embedders and tests; clones share the same buffer
#[derive(Clone, Default)]
pub struct MemoryDeadLetterWriter {
    records: Arc<Mutex<Vec<DeadLetterRecord>>>,
}

impl MemoryDeadLetterWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn count_reason(&self, reason: DeadLetterReason) -> usize {
        self.records().iter().filter(|r| r.reason == reason).count()
    }
}

#[async_trait]
impl DeadLetterBackend for MemoryDeadLetterWriter {
    async fn write(&mut self, record: &DeadLetterRecord) -> Result<(), WriterError> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), WriterError> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "Memory"
    }
}

/// Shared entry point for every dead-letter producer in the pipeline
pub struct DeadLetterRouter {
    backend: tokio::sync::Mutex<Box<dyn DeadLetterBackend>>,
    backend_type: &'static str,
    write_timeout: Duration,
    routed: AtomicU64,
    failed: AtomicU64,
    by_reason: Mutex<HashMap<DeadLetterReason, u64>>,
}

impl DeadLetterRouter {
    pub fn new(backend: Box<dyn DeadLetterBackend>, write_timeout: Duration) -> Self {
        let backend_type = backend.backend_type();
        Self {
            backend: tokio::sync::Mutex::new(backend),
            backend_type,
            write_timeout,
            routed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            by_reason: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend_type(&self) -> &'static str {
        self.backend_type
    }

    /// Dead-letter raw bytes with a reason and human-readable detail
    pub async fn route(
        &self,
        payload: &[u8],
        reason: DeadLetterReason,
        detail: impl Into<String>,
        arrival_ts: DateTime<Utc>,
    ) {
        self.route_record(DeadLetterRecord::new(payload, reason, detail, arrival_ts))
            .await;
    }

    pub async fn route_record(&self, record: DeadLetterRecord) {
        if let Ok(mut by_reason) = self.by_reason.lock() {
            *by_reason.entry(record.reason).or_insert(0) += 1;
        }

        let write = async {
            let mut backend = self.backend.lock().await;
            backend.write(&record).await
        };

        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => {
                self.routed.fetch_add(1, Ordering::Relaxed);
                log::debug!("☠️  Dead-lettered {}: {}", record.reason, record.detail);
            }
            Ok(Err(e)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("❌ Dead-letter write failed ({}): {}", record.reason, e);
            }
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "❌ Dead-letter write timed out after {}ms ({})",
                    self.write_timeout.as_millis(),
                    record.reason
                );
            }
        }
    }

    pub async fn flush(&self) {
        let flush = async {
            let mut backend = self.backend.lock().await;
            backend.flush().await
        };
        match tokio::time::timeout(self.write_timeout, flush).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("❌ Dead-letter flush failed: {}", e),
            Err(_) => log::error!("❌ Dead-letter flush timed out"),
        }
    }

    /// Records successfully written
    pub fn routed_count(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    /// Records lost to write errors or timeouts
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Attempts per reason, written or not
    pub fn counts_by_reason(&self) -> HashMap<DeadLetterReason, u64> {
        self.by_reason.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct FailingBackend;

    #[async_trait]
    impl DeadLetterBackend for FailingBackend {
        async fn write(&mut self, _record: &DeadLetterRecord) -> Result<(), WriterError> {
            Err(WriterError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }

        async fn flush(&mut self) -> Result<(), WriterError> {
            Ok(())
        }

        fn backend_type(&self) -> &'static str {
            "Failing"
        }
    }

    struct StalledBackend;

    #[async_trait]
    impl DeadLetterBackend for StalledBackend {
        async fn write(&mut self, _record: &DeadLetterRecord) -> Result<(), WriterError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), WriterError> {
            Ok(())
        }

        fn backend_type(&self) -> &'static str {
            "Stalled"
        }
    }

    #[tokio::test]
    async fn test_jsonl_preserves_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dead_letters.jsonl");
        let writer = JsonlDeadLetterWriter::new(&path, 100, 10).unwrap();
        let router = DeadLetterRouter::new(Box::new(writer), Duration::from_secs(2));

        let raw = br#"{"patient_id": 1, "spo2": 150}"#;
        router
            .route(raw, DeadLetterReason::RangeError, "spo2 out of range", Utc::now())
            .await;
        router.flush().await;

        let content = std::fs::read_to_string(&path).unwrap();
        let record: DeadLetterRecord = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(record.reason, DeadLetterReason::RangeError);
        assert_eq!(record.payload_bytes().unwrap(), raw.to_vec());
        assert_eq!(router.routed_count(), 1);
    }

    #[tokio::test]
    async fn test_jsonl_rotation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dl.jsonl");
        // Rotate on every write
        let mut writer = JsonlDeadLetterWriter::with_max_bytes(&path, 1, 2).unwrap();

        for i in 0..4 {
            let record = DeadLetterRecord::new(
                format!("payload-{}", i).as_bytes(),
                DeadLetterReason::SchemaError,
                "",
                Utc::now(),
            );
            writer.write(&record).await.unwrap();
        }

        assert!(path.exists());
        assert!(dir.path().join("dl.jsonl.1").exists());
        assert!(dir.path().join("dl.jsonl.2").exists());
        assert!(!dir.path().join("dl.jsonl.3").exists());
        let newest = std::fs::read_to_string(dir.path().join("dl.jsonl.1")).unwrap();
        assert!(newest.contains("payload-3"));
    }

    #[tokio::test]
    async fn test_sqlite_backend() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("dl.db");
        let writer = SqliteDeadLetterWriter::new(&db_path).unwrap();
        let router = DeadLetterRouter::new(Box::new(writer), Duration::from_secs(2));

        router
            .route(&[0xff, 0x00], DeadLetterReason::SchemaError, "not utf-8", Utc::now())
            .await;

        let conn = Connection::open(&db_path).unwrap();
        let (encoding, reason): (String, String) = conn
            .query_row("SELECT payload_encoding, reason FROM dead_letters", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(encoding, "base64");
        assert_eq!(reason, "SchemaError");
    }

    #[tokio::test]
    async fn test_locked_sqlite_backend_times_out() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("dl.db");
        let writer = SqliteDeadLetterWriter::open(&db_path, Duration::from_millis(500)).unwrap();
        let router = DeadLetterRouter::new(Box::new(writer), Duration::from_millis(100));

        let holder = Connection::open(&db_path).unwrap();
        holder.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let started = std::time::Instant::now();
        router.route(b"x", DeadLetterReason::SinkRejected, "", Utc::now()).await;
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(router.failed_count(), 1);

        holder.execute_batch("COMMIT").unwrap();
    }

    #[tokio::test]
    async fn test_write_failure_is_counted_not_propagated() {
        let router = DeadLetterRouter::new(Box::new(FailingBackend), Duration::from_secs(1));
        router.route(b"x", DeadLetterReason::LateData, "", Utc::now()).await;

        assert_eq!(router.routed_count(), 0);
        assert_eq!(router.failed_count(), 1);
        assert_eq!(router.counts_by_reason().get(&DeadLetterReason::LateData), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_timeout() {
        let router = DeadLetterRouter::new(Box::new(StalledBackend), Duration::from_millis(50));
        router.route(b"x", DeadLetterReason::ShutdownDrop, "", Utc::now()).await;

        assert_eq!(router.failed_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_backend_shares_buffer() {
        let memory = MemoryDeadLetterWriter::new();
        let router = DeadLetterRouter::new(Box::new(memory.clone()), Duration::from_secs(1));
        router.route(b"a", DeadLetterReason::ClockSkew, "", Utc::now()).await;
        router.route(b"b", DeadLetterReason::LateData, "", Utc::now()).await;

        assert_eq!(memory.records().len(), 2);
        assert_eq!(memory.count_reason(DeadLetterReason::ClockSkew), 1);
    }
}
