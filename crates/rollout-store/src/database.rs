use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::config::LogConfig;
use crate::error::LogError;
use crate::schema;

/// Pool of `query_only` connections used by readers.
pub type ReaderPool = Pool<SqliteConnectionManager>;

/// Runs on every pooled reader connection.
#[derive(Debug)]
struct ReaderCustomizer {
    busy_timeout_ms: u32,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ReaderCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(&schema::reader_pragmas(self.busy_timeout_ms))
    }
}

/// SQLite handle with one exclusive writer connection and a pool of readers.
///
/// The writer sits behind a `parking_lot::Mutex` so every write path is
/// serialized; WAL mode lets readers run against a committed snapshot while
/// the writer holds its lock.
pub struct Database {
    writer: Arc<Mutex<Option<Connection>>>,
    readers: ReaderPool,
    closed: Arc<AtomicBool>,
    path: PathBuf,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &Path, config: &LogConfig) -> Result<Self, LogError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| LogError::Io(format!("create dir {}: {e}", parent.display())))?;
        }

        let conn = Connection::open(path).map_err(|e| LogError::Database(e.to_string()))?;

        conn.execute_batch(&schema::writer_pragmas(
            config.durability.synchronous_pragma(),
            config.busy_timeout_ms,
        ))
        .map_err(|e| LogError::Database(format!("pragmas: {e}")))?;

        conn.execute_batch(schema::CREATE_TABLES)
            .map_err(|e| LogError::Database(format!("schema: {e}")))?;

        check_schema_version(&conn)?;

        let manager = SqliteConnectionManager::file(path);
        let readers = Pool::builder()
            .max_size(config.reader_pool_size.max(1))
            .connection_timeout(Duration::from_secs(5))
            .connection_customizer(Box::new(ReaderCustomizer {
                busy_timeout_ms: config.busy_timeout_ms,
            }))
            .build(manager)?;

        info!(path = %path.display(), durability = ?config.durability, "event log database opened");

        Ok(Self {
            writer: Arc::new(Mutex::new(Some(conn))),
            readers,
            closed: Arc::new(AtomicBool::new(false)),
            path: path.to_owned(),
        })
    }

    /// Execute a closure with exclusive access to the writer connection.
    pub fn with_writer<F, T>(&self, f: F) -> Result<T, LogError>
    where
        F: FnOnce(&mut Connection) -> Result<T, LogError>,
    {
        let mut guard = self.writer.lock();
        let conn = guard.as_mut().ok_or(LogError::Closed)?;
        f(conn)
    }

    /// Like [`with_writer`](Self::with_writer), but gives up after `timeout`.
    pub fn with_writer_timeout<F, T>(&self, timeout: Duration, f: F) -> Result<T, LogError>
    where
        F: FnOnce(&mut Connection) -> Result<T, LogError>,
    {
        let mut guard = self
            .writer
            .try_lock_for(timeout)
            .ok_or(LogError::WriterBusy(timeout))?;
        let conn = guard.as_mut().ok_or(LogError::Closed)?;
        f(conn)
    }

    /// Execute a closure with a pooled reader connection.
    pub fn with_reader<F, T>(&self, f: F) -> Result<T, LogError>
    where
        F: FnOnce(&Connection) -> Result<T, LogError>,
    {
        if self.is_closed() {
            return Err(LogError::Closed);
        }
        let conn = self.readers.get()?;
        f(&conn)
    }

    /// Checkpoint the WAL into the main file and release the writer.
    /// Returns `false` when the database was already closed.
    pub fn close(&self) -> Result<bool, LogError> {
        let guard = self.writer.lock();
        self.close_locked(guard)
    }

    /// [`close`](Self::close) that gives up after `timeout`.
    pub fn close_timeout(&self, timeout: Duration) -> Result<bool, LogError> {
        let guard = self
            .writer
            .try_lock_for(timeout)
            .ok_or(LogError::WriterBusy(timeout))?;
        self.close_locked(guard)
    }

    fn close_locked(
        &self,
        mut guard: parking_lot::MutexGuard<'_, Option<Connection>>,
    ) -> Result<bool, LogError> {
        let Some(conn) = guard.take() else {
            return Ok(false);
        };
        self.closed.store(true, Ordering::SeqCst);

        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            warn!(error = %e, "WAL checkpoint on close failed");
        }
        conn.close()
            .map_err(|(_, e)| LogError::Database(format!("close: {e}")))?;

        info!(path = %self.path.display(), "event log database closed");
        Ok(true)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
            readers: self.readers.clone(),
            closed: self.closed.clone(),
            path: self.path.clone(),
        }
    }
}

fn check_schema_version(conn: &Connection) -> Result<(), LogError> {
    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    match version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [schema::SCHEMA_VERSION],
            )
            .map_err(|e| LogError::Database(format!("schema version: {e}")))?;
            Ok(())
        }
        Some(v) if v > schema::SCHEMA_VERSION => Err(LogError::Database(format!(
            "schema version {v} is newer than supported version {}",
            schema::SCHEMA_VERSION
        ))),
        Some(_) => Ok(()),
    }
}
