use super::schema::{run_migrations, ANALYTICS_MIGRATIONS};
use super::sqlite_pragma::{apply_optimized_pragmas, DEFAULT_BUSY_TIMEOUT};
use super::writer_backend::{AnalyticsSink, SinkError};
use crate::pipeline::types::{format_ts, AnalyticsRecord};
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Map SQLite failures onto retry semantics
///
/// Busy/locked databases and I/O trouble clear up on their own; constraint
/// and SQL errors do not.
pub fn classify(err: rusqlite::Error) -> SinkError {
    match err.sqlite_error_code() {
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::OutOfMemory,
        ) => SinkError::Transient(err.to_string()),
        _ => SinkError::Permanent(err.to_string()),
    }
}

/// SQLite analytics store with natural-key upserts
///
/// Every statement runs on the blocking pool, so a caller's timeout can give
/// up on a write that is stuck waiting for a lock.
pub struct SqliteSink {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteSink {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, SinkError> {
        Self::open(db_path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open with an explicit lock wait; pass the sink write timeout so a
    /// blocked statement gives up about when its caller does
    pub fn open(db_path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, SinkError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SinkError::Permanent(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path).map_err(classify)?;
        apply_optimized_pragmas(&conn, busy_timeout).map_err(classify)?;
        run_migrations(&conn, ANALYTICS_MIGRATIONS).map_err(classify)?;

        log::info!(
            "✅ SQLite analytics sink initialized with WAL mode: {} (busy timeout {}ms)",
            db_path.display(),
            busy_timeout.as_millis()
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: db_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, SinkError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut conn)
        })
        .await
        .map_err(|e| SinkError::Transient(format!("SQLite task failed: {}", e)))?
        .map_err(classify)
    }
}

fn write_batch(conn: &mut Connection, records: &[AnalyticsRecord]) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut insert_event = tx.prepare_cached(
            "INSERT INTO vitals_events
             (patient_id, event_ts, ingest_ts, heart_rate, temperature,
              bp_systolic, bp_diastolic, spo2, risk_level)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(patient_id, event_ts) DO UPDATE SET
                heart_rate = excluded.heart_rate,
                temperature = excluded.temperature,
                bp_systolic = excluded.bp_systolic,
                bp_diastolic = excluded.bp_diastolic,
                spo2 = excluded.spo2,
                risk_level = excluded.risk_level",
        )?;
        let mut insert_window = tx.prepare_cached(
            "INSERT INTO vitals_window_aggregates
             (patient_id, window_start, window_end, avg_heart_rate,
              spo2_alert_count, event_count, max_risk_level, is_partial)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(patient_id, window_start) DO UPDATE SET
                window_end = excluded.window_end,
                avg_heart_rate = excluded.avg_heart_rate,
                spo2_alert_count = excluded.spo2_alert_count,
                event_count = excluded.event_count,
                max_risk_level = excluded.max_risk_level,
                is_partial = excluded.is_partial",
        )?;

        for record in records {
            match record {
                AnalyticsRecord::Event(r) => {
                    insert_event.execute(params![
                        r.patient_id,
                        format_ts(&r.event_ts),
                        format_ts(&r.ingest_ts),
                        r.heart_rate,
                        r.temperature,
                        r.bp_systolic,
                        r.bp_diastolic,
                        r.spo2,
                        r.risk_level.as_str(),
                    ])?;
                }
                AnalyticsRecord::Window(w) => {
                    insert_window.execute(params![
                        w.patient_id,
                        format_ts(&w.window_start),
                        format_ts(&w.window_end),
                        w.avg_heart_rate,
                        w.spo2_alert_count as i64,
                        w.event_count as i64,
                        w.max_risk_level.as_str(),
                        w.is_partial,
                    ])?;
                }
            }
        }
    }
    tx.commit()
}

#[async_trait]
impl AnalyticsSink for SqliteSink {
    async fn upsert_batch(&mut self, records: &[AnalyticsRecord]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }
        let count = records.len();
        let records = records.to_vec();
        self.with_conn(move |conn| write_batch(conn, &records)).await?;
        log::debug!("✅ Upserted {} records to SQLite", count);
        Ok(())
    }

    async fn health_check(&mut self) -> Result<(), SinkError> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
            .await
            .map(|_| ())
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::risk::RiskLevel;
    use crate::pipeline::types::{VitalsRecord, WindowAggregate};
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn event_record(patient_id: i64, secs: i64, heart_rate: i64, risk: RiskLevel) -> AnalyticsRecord {
        let ts = Utc.timestamp_opt(1_704_067_200 + secs, 0).unwrap();
        AnalyticsRecord::Event(VitalsRecord {
            event_ts: ts,
            ingest_ts: ts,
            patient_id,
            heart_rate,
            temperature: 98.6,
            bp_systolic: 120,
            bp_diastolic: 80,
            spo2: 97,
            risk_level: risk,
        })
    }

    fn window_record(patient_id: i64, avg: f64, count: u64, is_partial: bool) -> AnalyticsRecord {
        let start = Utc.timestamp_opt(1_704_067_200, 0).unwrap();
        AnalyticsRecord::Window(WindowAggregate {
            patient_id,
            window_start: start,
            window_end: start + chrono::Duration::seconds(60),
            avg_heart_rate: avg,
            spo2_alert_count: 1,
            event_count: count,
            max_risk_level: RiskLevel::Elevated,
            is_partial,
        })
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_basic_write() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("vitals.db");
        let mut sink = SqliteSink::new(&db_path).unwrap();

        sink.upsert_batch(&[event_record(7, 10, 210, RiskLevel::Critical)])
            .await
            .unwrap();

        let conn = Connection::open(&db_path).unwrap();
        let (event_ts, risk): (String, String) = conn
            .query_row(
                "SELECT event_ts, risk_level FROM vitals_events WHERE patient_id = 7",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(event_ts, "2024-01-01T00:00:10.000000Z");
        assert_eq!(risk, "Critical");
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("vitals.db");
        let mut sink = SqliteSink::new(&db_path).unwrap();

        let batch = vec![
            event_record(1, 1, 60, RiskLevel::Normal),
            event_record(1, 2, 80, RiskLevel::Normal),
            event_record(2, 1, 130, RiskLevel::Elevated),
            window_record(1, 70.0, 2, false),
        ];
        sink.upsert_batch(&batch).await.unwrap();
        sink.upsert_batch(&batch).await.unwrap();

        let conn = Connection::open(&db_path).unwrap();
        assert_eq!(count(&conn, "vitals_events"), 3);
        assert_eq!(count(&conn, "vitals_window_aggregates"), 1);
    }

    #[tokio::test]
    async fn test_window_upsert_replaces_partial() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("vitals.db");
        let mut sink = SqliteSink::new(&db_path).unwrap();

        sink.upsert_batch(&[window_record(3, 70.0, 2, true)]).await.unwrap();
        sink.upsert_batch(&[window_record(3, 75.0, 4, false)]).await.unwrap();

        let conn = Connection::open(&db_path).unwrap();
        let (avg, events, partial): (f64, i64, bool) = conn
            .query_row(
                "SELECT avg_heart_rate, event_count, is_partial FROM vitals_window_aggregates",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(avg, 75.0);
        assert_eq!(events, 4);
        assert!(!partial);
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = tempdir().unwrap();
        let mut sink = SqliteSink::new(dir.path().join("nested/dir/vitals.db")).unwrap();
        assert!(sink.health_check().await.is_ok());
        assert_eq!(sink.backend_type(), "SQLite");
    }

    #[tokio::test]
    async fn test_locked_database_respects_caller_timeout() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("vitals.db");
        let mut sink = SqliteSink::open(&db_path, Duration::from_millis(500)).unwrap();

        let holder = Connection::open(&db_path).unwrap();
        holder.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let batch = [event_record(1, 1, 70, RiskLevel::Normal)];
        let started = std::time::Instant::now();
        let timed = tokio::time::timeout(Duration::from_millis(100), sink.upsert_batch(&batch)).await;
        assert!(timed.is_err());
        assert!(started.elapsed() < Duration::from_millis(400));

        // Without a caller timeout the busy timeout still ends the wait
        let started = std::time::Instant::now();
        let err = sink.upsert_batch(&batch).await.unwrap_err();
        assert!(err.is_transient());
        assert!(started.elapsed() < Duration::from_secs(3));

        holder.execute_batch("COMMIT").unwrap();
        sink.upsert_batch(&batch).await.unwrap();
        assert_eq!(count(&holder, "vitals_events"), 1);
    }

    #[test]
    fn test_classify_errors() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(classify(busy).is_transient());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!classify(constraint).is_transient());
    }
}
