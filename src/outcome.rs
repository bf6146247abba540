//! Handler outcomes and the transient/permanent error taxonomy.
//!
//! Everything a handler can produce funnels into [`Outcome`] on success and
//! [`JobError`] on failure. The split drives queue behavior: transient errors
//! are rescheduled with backoff, permanent errors go straight to the failure
//! sink.

use std::fmt;

/// A handler finished without raising.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Terminal but uninteresting: the processed marker is still set so
    /// replays do not re-run, and no alert fires.
    Ignored(String),
}

/// Classified job failure. The message is surfaced in `last_error` and in
/// failure alerts, so keep it short and specific.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Network faults, timeouts, 408/429/5xx from any dependency. Retried.
    Transient(String),
    /// Schema failures surviving repair, other 4xx, missing required fields,
    /// configuration errors surfaced at runtime. Never retried.
    Permanent(String),
}

impl JobError {
    pub fn transient(msg: impl Into<String>) -> Self {
        JobError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        JobError::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            JobError::Transient(m) | JobError::Permanent(m) => m,
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Transient(m) => write!(f, "transient: {}", m),
            JobError::Permanent(m) => write!(f, "permanent: {}", m),
        }
    }
}

impl std::error::Error for JobError {}

pub type HandlerResult = Result<Outcome, JobError>;

/// Map an HTTP status from a dependency into the taxonomy.
/// 408, 429 and 5xx are retryable; every other 4xx is not.
pub fn classify_status(status: u16, context: &str) -> JobError {
    match status {
        408 | 429 | 500..=599 => JobError::Transient(format!("{} HTTP {}", context, status)),
        _ => JobError::Permanent(format!("{} HTTP {}", context, status)),
    }
}

/// Map a reqwest transport error. Timeouts and connection problems are
/// transient; request-construction errors are not going to fix themselves.
pub fn classify_reqwest(err: &reqwest::Error, context: &str) -> JobError {
    if err.is_timeout() || err.is_connect() || err.is_request() && err.is_body() {
        JobError::Transient(format!("{}: {}", context, err))
    } else if err.is_builder() {
        JobError::Permanent(format!("{}: {}", context, err))
    } else {
        // Undifferentiated transport failures get retried.
        JobError::Transient(format!("{}: {}", context, err))
    }
}
