use deadpool::managed::PoolError;

/// Which constraint a rejected write ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// Another row already holds the primary key
    DuplicateKey,
    /// The referenced target does not exist
    MissingTarget,
    /// CHECK or NOT NULL
    Check,
}

/// Why a backend operation failed.
///
/// Only `Connectivity` and `Backend` are worth retrying unchanged; a
/// constraint violation fails again until the input is corrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Connectivity,
    Constraint(Violation),
    Backend,
}

impl FailureKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::Constraint(_))
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Connectivity => write!(f, "connectivity"),
            FailureKind::Constraint(Violation::DuplicateKey) => write!(f, "duplicate key"),
            FailureKind::Constraint(Violation::MissingTarget) => write!(f, "missing target"),
            FailureKind::Constraint(Violation::Check) => write!(f, "constraint"),
            FailureKind::Backend => write!(f, "backend"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("connection pool: {0}")]
    Pool(#[from] PoolError<libsql::Error>),
    #[error(transparent)]
    Libsql(#[from] libsql::Error),
    #[error("unreadable timestamp in storage: {0}")]
    Timestamp(#[from] chrono::ParseError),
    #[error("column {column} out of range: {value}")]
    OutOfRange { column: &'static str, value: i64 },
}

impl DbError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DbError::Pool(PoolError::Backend(err)) => classify(err),
            DbError::Pool(_) => FailureKind::Connectivity,
            DbError::Libsql(err) => classify(err),
            DbError::Timestamp(_) | DbError::OutOfRange { .. } => FailureKind::Backend,
        }
    }
}

// SQLITE_BUSY, SQLITE_LOCKED, SQLITE_IOERR, SQLITE_CANTOPEN
const TRANSIENT_CODES: [i32; 4] = [5, 6, 10, 14];
const SQLITE_CONSTRAINT: i32 = 19;

fn classify(err: &libsql::Error) -> FailureKind {
    match err {
        libsql::Error::ConnectionFailed(_) => FailureKind::Connectivity,
        libsql::Error::SqliteFailure(code, message) => {
            let primary = code & 0xff;
            if primary == SQLITE_CONSTRAINT {
                FailureKind::Constraint(violation_from_message(message))
            } else if TRANSIENT_CODES.contains(&primary) {
                FailureKind::Connectivity
            } else {
                classify_message(message)
            }
        }
        other => classify_message(&other.to_string()),
    }
}

/// Remote errors only carry SQLite's message text, so classification falls
/// back to the wording SQLite uses for each failure.
fn classify_message(message: &str) -> FailureKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("constraint failed") {
        FailureKind::Constraint(violation_from_message(&lower))
    } else if [
        "database is locked",
        "unable to open",
        "disk i/o",
        "connection",
        "timed out",
        "stream expired",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
    {
        FailureKind::Connectivity
    } else {
        FailureKind::Backend
    }
}

fn violation_from_message(message: &str) -> Violation {
    let lower = message.to_ascii_lowercase();
    if lower.contains("unique") || lower.contains("primary key") {
        Violation::DuplicateKey
    } else if lower.contains("foreign key") {
        Violation::MissingTarget
    } else {
        Violation::Check
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_constraint_codes() {
        let dup = libsql::Error::SqliteFailure(
            1555,
            "UNIQUE constraint failed: url_performance_metrics.sample_timestamp".into(),
        );
        assert_eq!(classify(&dup), FailureKind::Constraint(Violation::DuplicateKey));

        let fk = libsql::Error::SqliteFailure(787, "FOREIGN KEY constraint failed".into());
        assert_eq!(classify(&fk), FailureKind::Constraint(Violation::MissingTarget));

        let check = libsql::Error::SqliteFailure(
            275,
            "CHECK constraint failed: response_time >= 0".into(),
        );
        assert_eq!(classify(&check), FailureKind::Constraint(Violation::Check));
    }

    #[test]
    fn test_busy_is_connectivity() {
        let busy = libsql::Error::SqliteFailure(5, "database is locked".into());
        assert_eq!(classify(&busy), FailureKind::Connectivity);
        assert!(classify(&busy).is_retryable());
    }

    #[test]
    fn test_message_fallback() {
        assert_eq!(
            classify_message("SQLite error: UNIQUE constraint failed: t.a, t.b"),
            FailureKind::Constraint(Violation::DuplicateKey)
        );
        assert_eq!(classify_message("connection refused"), FailureKind::Connectivity);
        assert_eq!(classify_message("no such table: target_urls"), FailureKind::Backend);
    }

    #[test]
    fn test_constraint_not_retryable() {
        assert!(!FailureKind::Constraint(Violation::DuplicateKey).is_retryable());
        assert!(FailureKind::Backend.is_retryable());
    }
}
