//! Scalar metric values and their aggregation rules.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::MetricError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricKind::Counter),
            "gauge" => Ok(MetricKind::Gauge),
            other => Err(MetricError::BadKindType(other.to_string())),
        }
    }
}

/// A counter accumulator or a gauge reading.
///
/// Counters are merged by summing deltas, gauges by replacement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueMetric {
    Counter(i64),
    Gauge(f64),
}

impl ValueMetric {
    pub const fn kind(&self) -> MetricKind {
        match self {
            ValueMetric::Counter(_) => MetricKind::Counter,
            ValueMetric::Gauge(_) => MetricKind::Gauge,
        }
    }

    /// Merge `incoming` into `self`, returning the aggregated value.
    ///
    /// # Errors
    ///
    /// - [`MetricError::KindMismatch`] if the kinds differ
    /// - [`MetricError::BadValue`] if a counter sum overflows `i64`
    pub fn merge(&self, incoming: &ValueMetric) -> Result<ValueMetric, MetricError> {
        match (self, incoming) {
            (ValueMetric::Counter(current), ValueMetric::Counter(delta)) => current
                .checked_add(*delta)
                .map(ValueMetric::Counter)
                .ok_or_else(|| MetricError::bad_value(MetricKind::Counter, "counter overflow")),
            (ValueMetric::Gauge(_), ValueMetric::Gauge(value)) => Ok(ValueMetric::Gauge(*value)),
            (current, incoming) => Err(MetricError::KindMismatch {
                bound: current.kind(),
                incoming: incoming.kind(),
            }),
        }
    }

    /// Return the current value; a counter is reset to zero in place.
    pub fn read_and_clear(&mut self) -> ValueMetric {
        let current = *self;
        if let ValueMetric::Counter(delta) = self {
            *delta = 0;
        }
        current
    }

    /// Build a value from a kind tag and the optional wire payloads.
    ///
    /// Exactly the payload matching the kind must be present; the other one is
    /// ignored.
    pub fn from_parts(
        kind: &str,
        delta: Option<i64>,
        value: Option<f64>,
    ) -> Result<ValueMetric, MetricError> {
        match kind.parse::<MetricKind>()? {
            MetricKind::Counter => delta
                .map(ValueMetric::Counter)
                .ok_or_else(|| MetricError::bad_value(MetricKind::Counter, "missing delta")),
            MetricKind::Gauge => match value {
                Some(v) if v.is_finite() => Ok(ValueMetric::Gauge(v)),
                Some(v) => Err(MetricError::bad_value(
                    MetricKind::Gauge,
                    format!("non-finite value {v}"),
                )),
                None => Err(MetricError::bad_value(MetricKind::Gauge, "missing value")),
            },
        }
    }

    /// Split into `(kind, delta, value)` wire parts.
    pub fn to_parts(&self) -> (MetricKind, Option<i64>, Option<f64>) {
        match self {
            ValueMetric::Counter(delta) => (MetricKind::Counter, Some(*delta), None),
            ValueMetric::Gauge(value) => (MetricKind::Gauge, None, Some(*value)),
        }
    }

    /// Parse the text form used by the plain-text endpoint.
    pub fn parse(kind: MetricKind, raw: &str) -> Result<ValueMetric, MetricError> {
        match kind {
            MetricKind::Counter => raw
                .parse::<i64>()
                .map(ValueMetric::Counter)
                .map_err(|e| MetricError::bad_value(kind, format!("`{raw}`: {e}"))),
            MetricKind::Gauge => match raw.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(ValueMetric::Gauge(v)),
                Ok(_) => Err(MetricError::bad_value(kind, format!("`{raw}` is not finite"))),
                Err(e) => Err(MetricError::bad_value(kind, format!("`{raw}`: {e}"))),
            },
        }
    }
}

impl fmt::Display for ValueMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueMetric::Counter(delta) => write!(f, "{delta}"),
            ValueMetric::Gauge(value) => write!(f, "{value}"),
        }
    }
}
