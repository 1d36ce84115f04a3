//! Connection tuning shared by every SQLite writer
//!
//! WAL lets the dashboard read while the pipeline writes; NORMAL sync is safe
//! under WAL and avoids an fsync per transaction.

use rusqlite::Connection;
use std::time::Duration;

/// Lock wait for writers opened without an explicit write timeout
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// WAL, NORMAL sync, in-memory temp tables, 256MB mmap, 64MB page cache,
/// autocheckpoint every 1000 pages
///
/// `busy_timeout` bounds how long a statement waits on another writer's lock
/// before failing with `SQLITE_BUSY`.
pub fn apply_optimized_pragmas(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", 268_435_456i64)?;
    conn.pragma_update(None, "cache_size", -64_000i64)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000i64)?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}
