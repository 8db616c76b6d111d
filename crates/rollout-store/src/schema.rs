/// SQL DDL for the event log.
/// `seq` is the rowid; sequence numbers are assigned by the writer, never
/// by AUTOINCREMENT.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY,
    id TEXT NOT NULL,
    time INTEGER NOT NULL,
    name TEXT NOT NULL,
    data TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_id ON events(id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

/// Pragmas for the single writer connection.
pub fn writer_pragmas(synchronous: &str, busy_timeout_ms: u32) -> String {
    format!(
        "PRAGMA journal_mode = WAL;\
         PRAGMA busy_timeout = {busy_timeout_ms};\
         PRAGMA synchronous = {synchronous};"
    )
}

/// Pragmas for pooled reader connections.
pub fn reader_pragmas(busy_timeout_ms: u32) -> String {
    format!(
        "PRAGMA busy_timeout = {busy_timeout_ms};\
         PRAGMA query_only = ON;"
    )
}
