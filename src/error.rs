use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("archive {} error: {source}", .path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("partial write: {affected} of {attempted} rows stored")]
    PartialWrite { attempted: u64, affected: u64 },
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification handed to read callers so they can tell "no data"
/// from "bad request" from "try again later".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    NotFound,
    InvalidInput,
    PartialWrite,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Db(source) | Error::Archive { source, .. } => {
                if is_connection_error(source) {
                    ErrorKind::Connection
                } else {
                    ErrorKind::Other
                }
            }
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::PartialWrite { .. } => ErrorKind::PartialWrite,
            Error::Context { source, .. } => source.kind(),
            _ => ErrorKind::Other,
        }
    }

    pub fn is_connection(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    /// True when the hot store (Postgres) itself is unreachable.
    pub fn is_hot_store_outage(&self) -> bool {
        match self {
            Error::Db(source) => is_connection_error(source),
            Error::Context { source, .. } => source.is_hot_store_outage(),
            _ => false,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }
}

fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeouts_are_connection_errors() {
        let err = Error::Db(sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.is_hot_store_outage());
    }

    #[test]
    fn archive_outage_is_not_a_hot_store_outage() {
        let err = Error::Archive {
            path: PathBuf::from("2024-01-10.db"),
            source: sqlx::Error::PoolClosed,
        };
        assert!(err.is_connection());
        assert!(!err.is_hot_store_outage());
    }

    #[test]
    fn context_preserves_kind() {
        let res: Result<()> = Err(Error::NotFound("archive for 2024-01-01".into()));
        let err = res.context("resolving counts").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            err.to_string(),
            "resolving counts: not found: archive for 2024-01-01"
        );
    }

    #[test]
    fn row_not_found_is_other() {
        assert_eq!(Error::Db(sqlx::Error::RowNotFound).kind(), ErrorKind::Other);
    }
}
