use std::any::Any;
use std::time::Duration;

use thiserror::Error;

/// An error captured by a job, or raised while submitting one.
///
/// A job stores exactly one outcome, and every caller that inspects a failed job gets its own
/// copy of the error. This is why the type is [`Clone`] and does not carry the original
/// error sources, which are logged at the point of conversion instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The request parameters are malformed or ambiguous.
    ///
    /// This is detected when the job is constructed, before anything is executed.
    #[error("{code}: {message}")]
    BadRequest { code: &'static str, message: String },

    /// The computation itself failed, for example because a resource limit was exceeded.
    #[error("{code}: {message}")]
    Computation { code: &'static str, message: String },

    /// The service is temporarily unable to take on (or continue) work.
    ///
    /// Callers may retry the same request later.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The job was cancelled before it could finish.
    #[error("job was cancelled")]
    Cancelled,

    /// The job exceeded the cache-wide maximum execution time and was force-cancelled.
    #[error("job exceeded the maximum execution time of {}", humantime::format_duration(*.0))]
    HardTimeout(Duration),

    /// An unexpected fault, such as a panic inside a computation.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl JobError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn computation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Computation {
            code,
            message: message.into(),
        }
    }

    /// Whether the same request may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(_))
    }

    /// Whether this error ended the job before its computation could finish.
    ///
    /// Jobs ending with such an error are never served to new requests.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::HardTimeout(_) | Self::ServiceUnavailable(_)
        )
    }

    /// Logs the given error and wraps it as an [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr, "unexpected error in job");
        Self::InternalError(e.to_string())
    }

    /// Converts the payload of a caught panic.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_owned()
        };
        tracing::error!(%message, "job computation panicked");
        Self::InternalError(message)
    }
}

impl From<serde_yaml::Error> for JobError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::from_std_error(e)
    }
}
