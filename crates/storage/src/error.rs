//! Error types for metric stores.

use core::error::Error;

use derive_more::Display;
use error_stack::Report;
use metric_types::MetricError;
use metric_types::MetricKind;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, Report<StoreError>>;

/// Errors surfaced by every [`Store`](crate::Store) backend.
///
/// The first four variants are validation failures and are never retryable.
/// `Connection` is the only variant the retry utility treats as transient.
#[derive(Debug, Display, Clone, PartialEq)]
pub enum StoreError {
    #[display("metric name is empty")]
    BadName,

    #[display("unknown metric type `{kind}`")]
    BadKindType { kind: String },

    #[display("bad value for {kind} metric: {reason}")]
    BadValue { kind: MetricKind, reason: String },

    #[display("metric `{name}` is bound to {bound}, got {incoming}")]
    KindMismatch {
        name: String,
        bound: MetricKind,
        incoming: MetricKind,
    },

    #[display("metric `{name}` not found")]
    NotFound { name: String },

    #[display("persistence error: {message}")]
    Persistence { message: String },

    #[display("database error: {message}")]
    Database { message: String },

    #[display("database connection error: {message}")]
    Connection { message: String },
}

impl Error for StoreError {}

impl StoreError {
    /// Lift a model validation error, naming the metric it concerns.
    pub fn from_metric(name: &str, err: MetricError) -> Self {
        match err {
            MetricError::BadName => StoreError::BadName,
            MetricError::BadKindType(kind) => StoreError::BadKindType { kind },
            MetricError::BadValue { kind, reason } => StoreError::BadValue { kind, reason },
            MetricError::KindMismatch { bound, incoming } => StoreError::KindMismatch {
                name: name.to_string(),
                bound,
                incoming,
            },
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        StoreError::Persistence {
            message: message.into(),
        }
    }

    /// True for caller mistakes as opposed to backend failures.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StoreError::BadName
                | StoreError::BadKindType { .. }
                | StoreError::BadValue { .. }
                | StoreError::KindMismatch { .. }
        )
    }

    /// Classifier for [`utils::retry::retry_action`].
    pub fn is_retryable(report: &Report<StoreError>) -> bool {
        matches!(report.current_context(), StoreError::Connection { .. })
    }
}
