use crate::query::QueryError;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("database error: {0}")]
    Database(String),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt event row at events.{column}: {detail}")]
    CorruptRow { column: &'static str, detail: String },

    #[error("invalid range: {0}")]
    InvalidRange(#[from] QueryError),

    #[error("event log is closed")]
    Closed,

    #[error("event log writer busy for {0:?}")]
    WriterBusy(std::time::Duration),
}

/// Coarse classification used by callers to pick a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Storage could not be opened, read or written.
    IoFailure,
    /// The query bounds or limit were rejected.
    InvalidRange,
}

impl LogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRange(_) => ErrorKind::InvalidRange,
            _ => ErrorKind::IoFailure,
        }
    }
}

impl From<rusqlite::Error> for LogError {
    fn from(e: rusqlite::Error) -> Self {
        LogError::Database(e.to_string())
    }
}

impl From<r2d2::Error> for LogError {
    fn from(e: r2d2::Error) -> Self {
        LogError::Pool(e.to_string())
    }
}

impl From<serde_json::Error> for LogError {
    fn from(e: serde_json::Error) -> Self {
        LogError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_errors_classified() {
        let err = LogError::from(QueryError::Limit(0));
        assert_eq!(err.kind(), ErrorKind::InvalidRange);
        assert!(err.to_string().starts_with("invalid range"));
    }

    #[test]
    fn storage_errors_are_io_failures() {
        assert_eq!(LogError::Closed.kind(), ErrorKind::IoFailure);
        let err: LogError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert!(matches!(err, LogError::Database(_)));
    }
}
