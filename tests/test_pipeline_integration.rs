//! End-to-end tests: channel → coordinator → SQLite sink / dead letters
//!
//! Each test drives a full `PipelineCoordinator` run with an in-memory source
//! and checks what actually landed in the store.

#[cfg(test)]
mod pipeline_integration_tests {
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rusqlite::Connection;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use vitalflow::channel::memory_channel;
    use vitalflow::pipeline::{
        AnalyticsRecord, Clock, JsonlDeadLetterWriter, MemoryDeadLetterWriter, PipelineConfig, PipelineCoordinator,
    };
    use vitalflow::pipeline::types::DeadLetterReason;
    use vitalflow::simulator::{ErrorMode, SimulatorConfig, VitalsSimulator};
    use vitalflow::sink::{AnalyticsSink, SinkError, SqliteSink};

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            worker_count: 2,
            sink_batch_size: 10,
            sink_batch_interval: Duration::from_millis(50),
            window_trigger_interval: Duration::from_millis(20),
            channel_poll_interval: Duration::from_millis(10),
            channel_read_timeout: Duration::from_millis(100),
            shutdown_deadline: Duration::from_secs(5),
            ..PipelineConfig::default()
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn fixed_clock(secs: i64) -> Clock {
        let now = at(secs);
        Arc::new(move || now)
    }

    fn vitals(event_ts: DateTime<Utc>, patient_id: i64, heart_rate: i64) -> String {
        format!(
            r#"{{"event_ts": "{}", "patient_id": {}, "heart_rate": {}, "temperature": 98.6, "bp_systolic": 120, "bp_diastolic": 80, "spo2": 97}}"#,
            event_ts.to_rfc3339(),
            patient_id,
            heart_rate
        )
    }

    fn open_db(path: &Path) -> Connection {
        Connection::open(path).unwrap()
    }

    #[tokio::test]
    async fn test_critical_event_lands_in_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("vitals.db");
        let sink = SqliteSink::new(&db_path).unwrap();
        let coordinator = PipelineCoordinator::new(fast_config(), Box::new(sink), Box::new(MemoryDeadLetterWriter::new()))
            .with_clock(fixed_clock(11));

        let (tx, source) = memory_channel(8);
        tx.send(
            r#"{"event_ts": "2024-01-01T00:00:10Z", "patient_id": 7, "heart_rate": 210, "temperature": 98.6, "bp_systolic": 120, "bp_diastolic": 80, "spo2": 97}"#,
        )
        .await
        .unwrap();
        drop(tx);

        let report = coordinator.run(Box::new(source), std::future::pending()).await.unwrap();
        assert_eq!(report.valid_events, 1);

        let conn = open_db(&db_path);
        let (patient_id, event_ts, risk): (i64, String, String) = conn
            .query_row(
                "SELECT patient_id, event_ts, risk_level FROM vitals_events",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(patient_id, 7);
        assert_eq!(event_ts, "2024-01-01T00:00:10.000000Z");
        assert_eq!(risk, "Critical");

        let (window_start, max_risk, is_partial): (String, String, bool) = conn
            .query_row(
                "SELECT window_start, max_risk_level, is_partial FROM vitals_window_aggregates WHERE patient_id = 7",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(window_start, "2024-01-01T00:00:00.000000Z");
        assert_eq!(max_risk, "Critical");
        assert!(is_partial);
    }

    #[tokio::test]
    async fn test_closed_window_aggregate_in_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("vitals.db");
        let config = PipelineConfig {
            worker_count: 1,
            max_out_of_orderness: Duration::ZERO,
            ..fast_config()
        };
        let coordinator = PipelineCoordinator::new(
            config,
            Box::new(SqliteSink::new(&db_path).unwrap()),
            Box::new(MemoryDeadLetterWriter::new()),
        )
        .with_clock(fixed_clock(96));

        let (tx, source) = memory_channel(16);
        for (secs, hr) in [(15, 60), (25, 80), (45, 100)] {
            tx.send(vitals(at(secs), 1, hr)).await.unwrap();
        }
        // Pushes the watermark past window end + allowed lateness
        tx.send(vitals(at(95), 2, 70)).await.unwrap();
        drop(tx);

        let report = coordinator.run(Box::new(source), std::future::pending()).await.unwrap();
        assert_eq!(report.valid_events, 4);
        assert_eq!(report.windows_emitted, 2);

        let conn = open_db(&db_path);
        let (avg, count, is_partial): (f64, i64, bool) = conn
            .query_row(
                "SELECT avg_heart_rate, event_count, is_partial FROM vitals_window_aggregates WHERE patient_id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(avg, 80.0);
        assert_eq!(count, 3);
        assert!(!is_partial);

        let events: i64 = conn
            .query_row("SELECT COUNT(*) FROM vitals_events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(events, 4);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("vitals.db");
        let messages: Vec<String> = (0..5).map(|i| vitals(at(i * 7), 3, 70 + i)).collect();

        for _ in 0..2 {
            let coordinator = PipelineCoordinator::new(
                fast_config(),
                Box::new(SqliteSink::new(&db_path).unwrap()),
                Box::new(MemoryDeadLetterWriter::new()),
            )
            .with_clock(fixed_clock(40));
            let (tx, source) = memory_channel(16);
            for message in &messages {
                tx.send(message.clone()).await.unwrap();
            }
            drop(tx);
            coordinator.run(Box::new(source), std::future::pending()).await.unwrap();
        }

        let conn = open_db(&db_path);
        let events: i64 = conn
            .query_row("SELECT COUNT(*) FROM vitals_events", [], |row| row.get(0))
            .unwrap();
        let windows: i64 = conn
            .query_row("SELECT COUNT(*) FROM vitals_window_aggregates", [], |row| row.get(0))
            .unwrap();
        assert_eq!(events, 5);
        assert_eq!(windows, 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_partial_windows() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("vitals.db");
        let coordinator = PipelineCoordinator::new(
            fast_config(),
            Box::new(SqliteSink::new(&db_path).unwrap()),
            Box::new(MemoryDeadLetterWriter::new()),
        )
        .with_clock(fixed_clock(30));

        let (tx, source) = memory_channel(16);
        for patient_id in 1..=3 {
            tx.send(vitals(at(10), patient_id, 75)).await.unwrap();
        }

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn(coordinator.run(Box::new(source), async {
            let _ = shutdown_rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown_tx.send(()).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        drop(tx);

        assert_eq!(report.partial_windows, 3);
        assert_eq!(report.last_cursor, 3);

        let conn = open_db(&db_path);
        let partial: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM vitals_window_aggregates WHERE is_partial = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(partial, 3);
    }

    #[tokio::test]
    async fn test_dead_letter_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let dl_path = dir.path().join("dead_letters.jsonl");
        let coordinator = PipelineCoordinator::new(
            fast_config(),
            Box::new(SqliteSink::new(dir.path().join("vitals.db")).unwrap()),
            Box::new(JsonlDeadLetterWriter::new(&dl_path, 100, 10).unwrap()),
        )
        .with_clock(fixed_clock(20));

        let (tx, source) = memory_channel(16);
        tx.send(vitals(at(10), 1, 72)).await.unwrap();
        tx.send(r#"{"patient_id": 1, "bp_systolic": "one-sixty"}"#).await.unwrap();
        tx.send(vitals(at(10), 2, 72).replace("\"spo2\": 97", "\"spo2\": 101")).await.unwrap();
        tx.send(vec![0xff, 0xfe, 0x00]).await.unwrap();
        tx.send(vitals(at(20 + 3600), 3, 72)).await.unwrap();
        drop(tx);

        let report = coordinator.run(Box::new(source), std::future::pending()).await.unwrap();
        assert_eq!(report.valid_events, 1);
        assert_eq!(report.invalid_events, 4);
        assert_eq!(report.dead_letters_written, 4);

        let contents = std::fs::read_to_string(&dl_path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 4);

        let reasons: Vec<&str> = lines.iter().map(|l| l["reason"].as_str().unwrap()).collect();
        let count = |reason: &str| reasons.iter().filter(|r| **r == reason).count();
        assert_eq!(count("SchemaError"), 2);
        assert_eq!(count("RangeError"), 1);
        assert_eq!(count("ClockSkew"), 1);

        let binary = lines
            .iter()
            .find(|l| l["payload_encoding"] == "base64")
            .expect("non-UTF-8 payload should be base64 encoded");
        assert_eq!(binary["raw_payload"], "//4A");
        for line in &lines {
            assert!(line["arrival_ts"].as_str().unwrap().starts_with("2024-01-01T00:00:20"));
            assert!(!line["detail"].as_str().unwrap().is_empty());
        }
    }

    /// Fails every write while `healthy` is false
    #[derive(Clone)]
    struct ToggleSink {
        healthy: Arc<AtomicBool>,
        written: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AnalyticsSink for ToggleSink {
        async fn upsert_batch(&mut self, records: &[AnalyticsRecord]) -> Result<(), SinkError> {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(SinkError::Transient("database is locked".to_string()));
            }
            self.written.fetch_add(records.len(), Ordering::SeqCst);
            Ok(())
        }

        async fn health_check(&mut self) -> Result<(), SinkError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(SinkError::Transient("database is locked".to_string()))
            }
        }

        fn backend_type(&self) -> &'static str {
            "Toggle"
        }
    }

    async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_backpressure_pauses_and_resumes_reader() {
        let sink = ToggleSink {
            healthy: Arc::new(AtomicBool::new(true)),
            written: Arc::new(AtomicUsize::new(0)),
        };
        let dead_letters = MemoryDeadLetterWriter::new();
        let config = PipelineConfig {
            worker_count: 1,
            sink_batch_size: 1,
            sink_batch_interval: Duration::from_millis(20),
            sink_retry_max_attempts: 2,
            sink_retry_backoff_base: Duration::from_millis(10),
            sink_retry_backoff_max: Duration::from_millis(20),
            sink_write_timeout: Duration::from_secs(1),
            sink_recovery_probe_interval: Duration::from_millis(50),
            ..fast_config()
        };
        let coordinator = PipelineCoordinator::new(config, Box::new(sink.clone()), Box::new(dead_letters.clone()));
        let stats = coordinator.stats();
        let signal = coordinator.backpressure();

        let (tx, source) = memory_channel(16);
        let run = tokio::spawn(coordinator.run(Box::new(source), std::future::pending()));

        // Startup probe passed; now the store goes down
        tokio::time::sleep(Duration::from_millis(100)).await;
        sink.healthy.store(false, Ordering::SeqCst);
        tx.send(vitals(Utc::now(), 1, 72)).await.unwrap();
        wait_until("backpressure to engage", || signal.is_engaged()).await;

        for patient_id in 2..=4 {
            tx.send(vitals(Utc::now(), patient_id, 72)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        // At most one read was already in flight when the signal flipped
        assert!(stats.messages_received.load(Ordering::SeqCst) <= 2);
        assert!(signal.is_engaged());

        sink.healthy.store(true, Ordering::SeqCst);
        wait_until("reader to resume", || stats.messages_received.load(Ordering::SeqCst) == 4).await;
        assert!(!signal.is_engaged());
        drop(tx);

        let report = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(report.backpressure_pauses >= 1);
        assert!(report.sink_batches_rejected >= 1);
        assert!(dead_letters.count_reason(DeadLetterReason::SinkRejected) >= 1);
        // Everything read after recovery reached the store
        assert!(sink.written.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_simulated_stream_is_fully_accounted_for() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("vitals.db");
        let dead_letters = MemoryDeadLetterWriter::new();
        let coordinator = PipelineCoordinator::new(
            fast_config(),
            Box::new(SqliteSink::new(&db_path).unwrap()),
            Box::new(dead_letters.clone()),
        );

        let sim_config = SimulatorConfig {
            patient_count: 5,
            error_rate: 0.2,
            error_mode: ErrorMode::Mixed,
            ..SimulatorConfig::default()
        };
        let mut simulator = VitalsSimulator::new(sim_config, StdRng::seed_from_u64(7));

        let (tx, source) = memory_channel(256);
        let mut injected = 0;
        for i in 0..200 {
            // Distinct event times keep every valid event its own row
            let payload = simulator.next_payload(Utc::now() - chrono::Duration::milliseconds(i));
            if payload["_is_error"] == true {
                injected += 1;
            }
            tx.send(serde_json::to_vec(&payload).unwrap()).await.unwrap();
        }
        drop(tx);

        let report = coordinator.run(Box::new(source), std::future::pending()).await.unwrap();
        assert_eq!(report.messages_received, 200);
        assert_eq!(report.valid_events + report.invalid_events, 200);
        assert!(report.invalid_events >= injected);
        assert_eq!(dead_letters.records().len() as u64, report.invalid_events);

        let conn = open_db(&db_path);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM vitals_events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows as u64, report.valid_events);
    }
}
