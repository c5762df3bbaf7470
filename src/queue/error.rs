//! Error types for queue persistence.

use std::fmt;

use thiserror::Error;

/// Structured classification of database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDbErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (unique/check/not-null).
    ConstraintViolation,
    /// Connection pool timed out or is closed.
    PoolUnavailable,
    /// Expected row was not found.
    RowNotFound,
    /// Unclassified database failure.
    Other,
}

impl QueueDbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => Self::PoolUnavailable,
            sqlx::Error::RowNotFound => Self::RowNotFound,
            sqlx::Error::Database(database_error) => classify_database_error(database_error.as_ref()),
            _ => Self::Other,
        }
    }
}

impl fmt::Display for QueueDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolUnavailable => "pool_unavailable",
            Self::RowNotFound => "row_not_found",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

fn classify_database_error(
    database_error: &(dyn sqlx::error::DatabaseError + 'static),
) -> QueueDbErrorKind {
    let code = database_error.code();
    let message = database_error.message().to_ascii_lowercase();
    if matches!(code.as_deref(), Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6"))
        || message.contains("database is locked")
        || message.contains("database is busy")
    {
        return QueueDbErrorKind::BusyOrLocked;
    }
    if database_error.is_unique_violation()
        || database_error.is_check_violation()
        || code
            .as_deref()
            .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT"))
    {
        return QueueDbErrorKind::ConstraintViolation;
    }
    QueueDbErrorKind::Other
}

/// Errors from [`super::QueueStore`].
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// Database operation failed.
    #[error("database error ({kind}): {message}")]
    Database {
        kind: QueueDbErrorKind,
        message: String,
    },

    /// No item with this id.
    #[error(
        "queue item not found: id {0}\n  Suggestion: run `list` to see current item ids"
    )]
    ItemNotFound(i64),

    /// A JSON column could not be encoded.
    #[error("could not serialize {field} for item {id}: {message}")]
    Serialization {
        id: i64,
        field: &'static str,
        message: String,
    },
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: QueueDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl QueueError {
    /// Typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<QueueDbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::ItemNotFound(_) | Self::Serialization { .. } => None,
        }
    }

    /// True for `SQLITE_BUSY` / `SQLITE_LOCKED`.
    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        self.database_kind() == Some(QueueDbErrorKind::BusyOrLocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_error_message_carries_kind() {
        let err = QueueError::Database {
            kind: QueueDbErrorKind::BusyOrLocked,
            message: "database is locked".to_string(),
        };
        assert!(err.to_string().contains("busy_or_locked"));
        assert!(err.is_busy_or_locked());
    }

    #[test]
    fn test_item_not_found_has_suggestion() {
        let msg = QueueError::ItemNotFound(42).to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("Suggestion"));
        assert_eq!(QueueError::ItemNotFound(1).database_kind(), None);
    }

    #[test]
    fn test_pool_errors_classified() {
        assert_eq!(
            QueueDbErrorKind::from_sqlx(&sqlx::Error::PoolTimedOut),
            QueueDbErrorKind::PoolUnavailable
        );
        assert_eq!(
            QueueDbErrorKind::from_sqlx(&sqlx::Error::RowNotFound),
            QueueDbErrorKind::RowNotFound
        );
    }
}
