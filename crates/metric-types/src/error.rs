use thiserror::Error;

use crate::value::MetricKind;

/// Validation failures of the metric model.
///
/// None of these are retryable: resending the same input cannot succeed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("metric name is empty")]
    BadName,

    #[error("unknown metric type `{0}`")]
    BadKindType(String),

    #[error("bad value for {kind} metric: {reason}")]
    BadValue { kind: MetricKind, reason: String },

    #[error("metric is bound to {bound}, got {incoming}")]
    KindMismatch {
        bound: MetricKind,
        incoming: MetricKind,
    },
}

impl MetricError {
    pub(crate) fn bad_value(kind: MetricKind, reason: impl Into<String>) -> Self {
        Self::BadValue {
            kind,
            reason: reason.into(),
        }
    }
}
