//! SQLite helpers shared by the state and noise baseline stores.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// How long a writer waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens (or creates) a database file. `":memory:"` gives a private in-memory database.
pub fn open(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("Failed to set busy timeout")?;
    Ok(conn)
}

/// RFC 3339 with full sub-second precision so ordering survives a round trip
pub fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn decode_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let ts = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp {:?}", s))?;
    Ok(ts.with_timezone(&Utc))
}
