use thiserror::Error;
use tonic::{Code, Status};

/// Closed set of failures a scheduler operation can report.
///
/// Business logic returns these; only the gRPC layer turns them into a
/// [`Status`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("canceled: {0}")]
    Canceled(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    pub fn code(&self) -> Code {
        match self {
            SchedulerError::InvalidArgument(_) => Code::InvalidArgument,
            SchedulerError::NotFound(_) => Code::NotFound,
            SchedulerError::AlreadyExists(_) => Code::AlreadyExists,
            SchedulerError::FailedPrecondition(_) => Code::FailedPrecondition,
            SchedulerError::Unauthenticated(_) => Code::Unauthenticated,
            SchedulerError::PermissionDenied(_) => Code::PermissionDenied,
            SchedulerError::Unavailable(_) => Code::Unavailable,
            SchedulerError::Internal(_) => Code::Internal,
            SchedulerError::Canceled(_) => Code::Cancelled,
        }
    }

    /// Transient failures the caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::Unavailable(_))
    }

    fn message(&self) -> &str {
        match self {
            SchedulerError::InvalidArgument(m)
            | SchedulerError::NotFound(m)
            | SchedulerError::AlreadyExists(m)
            | SchedulerError::FailedPrecondition(m)
            | SchedulerError::Unauthenticated(m)
            | SchedulerError::PermissionDenied(m)
            | SchedulerError::Unavailable(m)
            | SchedulerError::Internal(m)
            | SchedulerError::Canceled(m) => m,
        }
    }
}

impl From<SchedulerError> for Status {
    fn from(err: SchedulerError) -> Self {
        if let SchedulerError::Internal(ref msg) = err {
            tracing::error!(error = %msg, "Internal error");
        }
        Status::new(err.code(), err.message().to_string())
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => SchedulerError::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                SchedulerError::Unavailable(format!("database: {}", err))
            }
            sqlx::Error::Database(ref db) if is_busy_code(db.code().as_deref()) => {
                SchedulerError::Unavailable(format!("database busy: {}", db.message()))
            }
            other => SchedulerError::Internal(format!("database: {}", other)),
        }
    }
}

impl From<object_store::Error> for SchedulerError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => {
                SchedulerError::NotFound(format!("blob {}", path))
            }
            other => SchedulerError::Unavailable(format!("blob store: {}", other)),
        }
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_busy_code(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}
