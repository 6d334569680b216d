use std::fmt;
use std::path::PathBuf;

use crate::lock::LockError;
use crate::vcs::VcsError;

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ConfigParseError,
    ValidationFailed,
    NotFound,
    AlreadyExists,
    InvalidStateTransition,
    DirtyWorkingTree,
    TransactionFailed,
    DeadlineExceeded,
    VcsOperationFailed,
    MigrationFailed,
    StoreFailure,
    FileWriteFailed,
    LockContention,
    QueueSaturated,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::ValidationFailed => "E2001",
            Self::NotFound => "E2002",
            Self::AlreadyExists => "E2003",
            Self::InvalidStateTransition => "E2004",
            Self::DirtyWorkingTree => "E3001",
            Self::TransactionFailed => "E3002",
            Self::DeadlineExceeded => "E3003",
            Self::VcsOperationFailed => "E4001",
            Self::MigrationFailed => "E4002",
            Self::StoreFailure => "E5001",
            Self::FileWriteFailed => "E5002",
            Self::LockContention => "E5003",
            Self::QueueSaturated => "E5004",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "State store not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::ValidationFailed => "Invalid input",
            Self::NotFound => "Record not found",
            Self::AlreadyExists => "Record already exists",
            Self::InvalidStateTransition => "Invalid state transition",
            Self::DirtyWorkingTree => "Working tree has uncommitted changes",
            Self::TransactionFailed => "Transaction rolled back",
            Self::DeadlineExceeded => "Deadline exceeded",
            Self::VcsOperationFailed => "Version control command failed",
            Self::MigrationFailed => "Migration rolled back",
            Self::StoreFailure => "State store failure",
            Self::FileWriteFailed => "Artifact file I/O failed",
            Self::LockContention => "Lock contention",
            Self::QueueSaturated => "Write queue saturated",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Initialize the state store or run the migration first."),
            Self::ConfigParseError => Some("Fix syntax in .lockstep/config.toml and retry."),
            Self::ValidationFailed => Some("Correct the input and retry."),
            Self::NotFound | Self::AlreadyExists => None,
            Self::InvalidStateTransition => Some(
                "Follow valid story transitions: todo -> in_progress -> review -> done (review may return to in_progress).",
            ),
            Self::DirtyWorkingTree => {
                Some("Commit or discard local changes, or run a consistency repair.")
            }
            Self::TransactionFailed => {
                Some("Nothing was committed. Inspect the cause, then retry the operation.")
            }
            Self::DeadlineExceeded => Some("Retry with a longer timeout."),
            Self::VcsOperationFailed => {
                Some("Inspect the git error output; the operation was not retried.")
            }
            Self::MigrationFailed => {
                Some("The tree is back at the pre-migration revision. Fix the cause and rerun.")
            }
            Self::StoreFailure => Some("Run a consistency check; restore the store file from git if corrupt."),
            Self::FileWriteFailed => Some("Check disk space and write permissions."),
            Self::LockContention => Some("Retry after the other writer releases its lock."),
            Self::QueueSaturated => Some("Back off and resubmit the write."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Error taxonomy shared by every component of the state layer.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Bad enum value, malformed identifier, or missing required field.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("epic not found: {0}")]
    EpicNotFound(i64),

    #[error("{entity} already exists: {key}")]
    AlreadyExists { entity: &'static str, key: String },

    #[error("invalid transition for {entity} {key}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        key: String,
        from: String,
        to: String,
    },

    #[error("working tree has uncommitted changes: {}", .paths.join(", "))]
    DirtyWorkingTree { paths: Vec<String> },

    /// Any failure inside the write protocol; both stores were rolled back.
    #[error("transaction '{operation}' rolled back: {source}")]
    TransactionFailed {
        operation: String,
        #[source]
        source: Box<StateError>,
    },

    #[error("deadline exceeded during {0}")]
    DeadlineExceeded(&'static str),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error("migration failed in phase '{phase}' (restored to {restored_revision}): {source}")]
    MigrationFailed {
        phase: String,
        restored_revision: String,
        #[source]
        source: Box<StateError>,
    },

    #[error("state store not initialized at {}", .0.display())]
    NotInitialized(PathBuf),

    #[error("state store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", .path.display())]
    Config { path: PathBuf, message: String },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("write queue is full")]
    QueueFull,

    #[error("write queue worker has shut down")]
    QueueClosed,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used across the crate.
pub type Result<T, E = StateError> = std::result::Result<T, E>;

impl StateError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::NotFound { .. } | Self::EpicNotFound(_) => ErrorCode::NotFound,
            Self::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::InvalidTransition { .. } => ErrorCode::InvalidStateTransition,
            Self::DirtyWorkingTree { .. } => ErrorCode::DirtyWorkingTree,
            Self::TransactionFailed { .. } => ErrorCode::TransactionFailed,
            Self::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            Self::Vcs(_) => ErrorCode::VcsOperationFailed,
            Self::MigrationFailed { .. } => ErrorCode::MigrationFailed,
            Self::NotInitialized(_) => ErrorCode::NotInitialized,
            Self::Store(_) => ErrorCode::StoreFailure,
            Self::Io { .. } => ErrorCode::FileWriteFailed,
            Self::Config { .. } => ErrorCode::ConfigParseError,
            Self::Lock(err) => err.code(),
            Self::QueueFull | Self::QueueClosed => ErrorCode::QueueSaturated,
            Self::Internal(_) => ErrorCode::InternalUnexpected,
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// The innermost cause of a wrapped protocol failure.
    ///
    /// `TransactionFailed` and `MigrationFailed` are unwrapped recursively so
    /// callers can match on the business error that triggered the rollback.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::TransactionFailed { source, .. } | Self::MigrationFailed { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn not_found(entity: &'static str, key: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub(crate) fn already_exists(entity: &'static str, key: impl fmt::Display) -> Self {
        Self::AlreadyExists {
            entity,
            key: key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, StateError};
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::NotInitialized,
            ErrorCode::ConfigParseError,
            ErrorCode::ValidationFailed,
            ErrorCode::NotFound,
            ErrorCode::AlreadyExists,
            ErrorCode::InvalidStateTransition,
            ErrorCode::DirtyWorkingTree,
            ErrorCode::TransactionFailed,
            ErrorCode::DeadlineExceeded,
            ErrorCode::VcsOperationFailed,
            ErrorCode::MigrationFailed,
            ErrorCode::StoreFailure,
            ErrorCode::FileWriteFailed,
            ErrorCode::LockContention,
            ErrorCode::QueueSaturated,
            ErrorCode::InternalUnexpected,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::InvalidStateTransition.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn root_cause_unwraps_nested_rollbacks() {
        let err = StateError::TransactionFailed {
            operation: "create story 5.1".to_string(),
            source: Box::new(StateError::EpicNotFound(5)),
        };
        assert!(matches!(err.root_cause(), StateError::EpicNotFound(5)));
        assert_eq!(err.code(), ErrorCode::TransactionFailed);
        assert_eq!(err.root_cause().code(), ErrorCode::NotFound);
    }
}
