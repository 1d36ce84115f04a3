//! Analytics store schema
//!
//! Migrations are embedded and must stay idempotent (`IF NOT EXISTS`); they run
//! in order on every startup.

use rusqlite::Connection;

pub const VITALS_EVENTS: &str = "
CREATE TABLE IF NOT EXISTS vitals_events (
    patient_id    INTEGER NOT NULL,
    event_ts      TEXT    NOT NULL,
    ingest_ts     TEXT    NOT NULL,
    heart_rate    INTEGER NOT NULL,
    temperature   REAL    NOT NULL,
    bp_systolic   INTEGER NOT NULL,
    bp_diastolic  INTEGER NOT NULL,
    spo2          INTEGER NOT NULL,
    risk_level    TEXT    NOT NULL,
    PRIMARY KEY (patient_id, event_ts)
);
CREATE INDEX IF NOT EXISTS idx_vitals_events_ts ON vitals_events(event_ts DESC);
CREATE INDEX IF NOT EXISTS idx_vitals_events_risk ON vitals_events(risk_level, event_ts DESC);
";

pub const VITALS_WINDOW_AGGREGATES: &str = "
CREATE TABLE IF NOT EXISTS vitals_window_aggregates (
    patient_id        INTEGER NOT NULL,
    window_start      TEXT    NOT NULL,
    window_end        TEXT    NOT NULL,
    avg_heart_rate    REAL    NOT NULL,
    spo2_alert_count  INTEGER NOT NULL,
    event_count       INTEGER NOT NULL,
    max_risk_level    TEXT    NOT NULL,
    is_partial        INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (patient_id, window_start)
);
CREATE INDEX IF NOT EXISTS idx_window_aggregates_start ON vitals_window_aggregates(window_start DESC);
";

pub const DEAD_LETTERS: &str = "
CREATE TABLE IF NOT EXISTS dead_letters (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    raw_payload       TEXT NOT NULL,
    payload_encoding  TEXT NOT NULL,
    reason            TEXT NOT NULL,
    detail            TEXT NOT NULL,
    arrival_ts        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dead_letters_reason ON dead_letters(reason, arrival_ts DESC);
";

/// Ordered migrations for the analytics tables
pub const ANALYTICS_MIGRATIONS: &[(&str, &str)] = &[
    ("00_vitals_events", VITALS_EVENTS),
    ("01_vitals_window_aggregates", VITALS_WINDOW_AGGREGATES),
];

/// Run a list of migrations in order, stopping at the first failure
pub fn run_migrations(conn: &Connection, migrations: &[(&str, &str)]) -> rusqlite::Result<()> {
    for (name, sql) in migrations {
        log::debug!("   ├─ Executing migration: {}", name);
        conn.execute_batch(sql)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn, ANALYTICS_MIGRATIONS).unwrap();
        run_migrations(&conn, ANALYTICS_MIGRATIONS).unwrap();
        run_migrations(&conn, &[("02_dead_letters", DEAD_LETTERS)]).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('vitals_events', 'vitals_window_aggregates', 'dead_letters')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }
}
