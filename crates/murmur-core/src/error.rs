use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Kind of a transient, retryable failure.
///
/// Assigned once at the API-call boundary (HTTP status, transport error,
/// pool error) so downstream code can match on it instead of inspecting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// Connection refused, reset or dropped.
    ConnectionReset,
    /// The call exceeded its deadline.
    Timeout,
    /// The remote side answered 429.
    RateLimited,
    /// The remote side answered with a 5xx status.
    ServerError(u16),
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientKind::ConnectionReset => write!(f, "connection"),
            TransientKind::Timeout => write!(f, "timeout"),
            TransientKind::RateLimited => write!(f, "rate limited"),
            TransientKind::ServerError(status) => write!(f, "server error {}", status),
        }
    }
}

/// Coarse classification every [`AppError`] maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff.
    Transient(TransientKind),
    /// Specific to one job or request; recorded, not retried automatically.
    Permanent,
    /// Process-level; the run must stop.
    Fatal,
}

impl ErrorClass {
    /// Short label used in logs and batch outcomes.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClass::Transient(TransientKind::ConnectionReset) => "connection",
            ErrorClass::Transient(TransientKind::Timeout) => "timeout",
            ErrorClass::Transient(TransientKind::RateLimited) => "rate_limited",
            ErrorClass::Transient(TransientKind::ServerError(_)) => "server_error",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Fatal => "fatal",
        }
    }
}

/// Application-wide error type.
///
/// Uses `thiserror` with `#[from]` conversions for the underlying library errors:
/// - `sqlx::Error` → `AppError::DatabaseError`
/// - `serde_json::Error` → `AppError::SerializationError`
///
/// Remote failures are classified when they are constructed (see
/// [`AppError::from_status`]), never by inspecting the message later.
///
/// # Examples
///
/// ```
/// use murmur_core::error::{AppError, ErrorClass};
///
/// let err = AppError::from_status(503, "upstream unavailable");
/// assert!(err.is_retryable());
///
/// let err = AppError::from_status(400, "bad input");
/// assert_eq!(err.class(), ErrorClass::Permanent);
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// A transient failure that may succeed if retried.
    #[error("Transient failure ({kind}): {message}")]
    Transient {
        kind: TransientKind,
        message: String,
    },

    /// A failure tied to the item being processed (malformed content,
    /// missing parent record, 4xx from a collaborator).
    #[error("Permanent failure: {reason}")]
    Permanent { reason: String },

    /// A process-level failure (invalid credentials, broken schema).
    #[error("Fatal error: {reason}")]
    Fatal { reason: String },

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Required configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A job id did not resolve to a stored job.
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// The job exists but is no longer `processing`, so this worker's claim
    /// was lost (reaped, released or finalized elsewhere).
    #[error("Job {0} is no longer claimed by this worker")]
    ClaimLost(Uuid),

    /// Generic application error for cases not covered by specific variants.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Builds a transient error of the given kind.
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        AppError::Transient {
            kind,
            message: message.into(),
        }
    }

    /// Builds a timeout error for a call that ran longer than `secs` seconds.
    pub fn timeout(secs: u64) -> Self {
        Self::transient(
            TransientKind::Timeout,
            format!("request timed out after {} seconds", secs),
        )
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        AppError::Permanent {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        AppError::Fatal {
            reason: reason.into(),
        }
    }

    /// Classifies a non-success HTTP status from a collaborator.
    ///
    /// 429 and 5xx are transient; 401/403 mean the credentials are wrong and
    /// are fatal; every other status is permanent for the request at hand.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => Self::transient(TransientKind::RateLimited, message),
            500..=599 => Self::transient(TransientKind::ServerError(status), message),
            401 | 403 => Self::fatal(format!("HTTP {}: {}", status, message)),
            _ => Self::permanent(format!("HTTP {}: {}", status, message)),
        }
    }

    /// Returns the classification of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::Transient { kind, .. } => ErrorClass::Transient(*kind),
            AppError::DatabaseError(e) => classify_sqlx(e),
            AppError::Fatal { .. } | AppError::ConfigError(_) => ErrorClass::Fatal,
            AppError::Permanent { .. }
            | AppError::SerializationError(_)
            | AppError::JobNotFound(_)
            | AppError::ClaimLost(_)
            | AppError::Generic(_) => ErrorClass::Permanent,
        }
    }

    /// Returns true if this error is retryable.
    ///
    /// ```
    /// use murmur_core::error::{AppError, TransientKind};
    ///
    /// assert!(AppError::transient(TransientKind::RateLimited, "slow down").is_retryable());
    /// assert!(!AppError::permanent("comment has no parent post").is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient(_))
    }

    /// Returns true if this error is a timeout.
    ///
    /// Timeouts are evidence of downstream overload and push the adaptive
    /// controller straight into panic mode.
    pub fn is_timeout(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient(TransientKind::Timeout))
    }

    /// Returns true if the process should stop.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Normalized message stored as a job's `last_error`.
    pub fn job_message(&self) -> String {
        self.to_string()
    }

    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DatabaseError(e) => match classify_sqlx(e) {
                ErrorClass::Transient(_) => {
                    "Cannot connect to database. Is PostgreSQL running?\n   Check DATABASE_URL."
                        .to_string()
                }
                _ => format!("Database error: {}", e),
            },
            AppError::Transient {
                kind: TransientKind::RateLimited,
                ..
            } => "Embedding API rate limit reached.\n   Wait a moment or lower --parallelism."
                .to_string(),
            AppError::Transient {
                kind: TransientKind::Timeout,
                message,
            } => format!(
                "{}.\n   The embedding API may be overloaded. Try again later.",
                message
            ),
            AppError::Fatal { reason } => {
                format!("{}\n   Check OPENAI_API_KEY and the API base URL.", reason)
            }
            AppError::ConfigError(msg) => {
                format!("Configuration error: {}\n   Check your environment.", msg)
            }
            _ => self.to_string(),
        }
    }
}

/// Pool exhaustion and I/O failures are worth retrying; query and
/// constraint errors are not.
fn classify_sqlx(e: &sqlx::Error) -> ErrorClass {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => {
            ErrorClass::Transient(TransientKind::ConnectionReset)
        }
        sqlx::Error::PoolClosed => ErrorClass::Fatal,
        sqlx::Error::Tls(_) | sqlx::Error::Configuration(_) => ErrorClass::Fatal,
        _ => ErrorClass::Permanent,
    }
}
