//! Error types for ironcheck.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::gateway::{GatewayError, InstanceKey};

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by harness operations.
///
/// Absence of a job is deliberately *not* an error at activation time: a
/// timed-out activation yields a pending [`JobHandle`](crate::JobHandle) and
/// the caller decides whether that is a failure.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid input rejected before any request reached the gateway.
    #[error("{0}")]
    InvalidArgument(String),

    /// A job handle operation was attempted from a state that does not allow it.
    ///
    /// The message always carries the quoted state token (e.g. `'ERROR_THROWN'`).
    #[error("cannot {operation} {job}: job is in state '{state}'")]
    StateConflict {
        /// The attempted operation (`complete`, `fail`, ...).
        operation: &'static str,
        /// Human readable job description (key and type).
        job: String,
        /// The state token the handle was in.
        state: &'static str,
    },

    /// An expectation over job variables or headers did not hold.
    #[error("expected {subject} to be {expected} but got {actual}")]
    AssertionMismatch {
        /// What was compared (`job variables`, `job headers`, ...).
        subject: String,
        /// The expected mapping, rendered as JSON.
        expected: String,
        /// The actual mapping, rendered as JSON.
        actual: String,
    },

    /// A job that had to be present was not activated before the deadline.
    #[error("expected a job of type '{job_type}' to be activated within {}ms", .waited.as_millis())]
    NoJob {
        /// The requested job type.
        job_type: String,
        /// The activation deadline that elapsed.
        waited: Duration,
    },

    /// The workflow instance did not complete before the deadline.
    #[error(
        "workflow instance {instance_key} did not complete within {}ms{}",
        .elapsed.as_millis(),
        .incident.as_deref().map(|i| format!(" (incident: {i})")).unwrap_or_default()
    )]
    CompletionTimeout {
        /// The instance that was observed.
        instance_key: InstanceKey,
        /// Wall-clock time spent waiting.
        elapsed: Duration,
        /// Incident reported by the broker for the instance, if any.
        incident: Option<String>,
    },

    /// A second instance was bound while another one was still bound.
    #[error("workflow instance {current} is already bound; nested instance bindings are not supported")]
    InstanceAlreadyBound {
        /// The instance currently bound to the harness.
        current: InstanceKey,
    },

    /// Error reported by the engine gateway, propagated unchanged.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Failed to read a process definition resource.
    #[error("failed to read workflow resource {}: {source}", .path.display())]
    Io {
        /// The resource path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to serialize variables to JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid harness configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// Create an assertion mismatch error from two JSON values.
    pub(crate) fn mismatch(
        subject: impl Into<String>,
        expected: &serde_json::Value,
        actual: &serde_json::Value,
    ) -> Self {
        Error::AssertionMismatch {
            subject: subject.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Returns `true` for terminal-state re-transition attempts.
    pub fn is_state_conflict(&self) -> bool {
        matches!(self, Error::StateConflict { .. })
    }
}
