//! Shared metric type definitions
//!
//! This crate contains the metric model shared by the agent, the server and the
//! storage backends: the scalar [`ValueMetric`] with its merge rules, the JSON
//! wire record [`Metrics`], and the transient [`Sample`] / [`Batch`] carriers.

pub mod error;
pub mod rpc;
pub mod value;
pub mod wire;

pub use error::MetricError;
pub use value::MetricKind;
pub use value::ValueMetric;
pub use wire::Metrics;

/// A named value emitted by a collector or decoded off the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub value: ValueMetric,
}

impl Sample {
    pub fn new(name: impl Into<String>, value: ValueMetric) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn counter(name: impl Into<String>, delta: i64) -> Self {
        Self::new(name, ValueMetric::Counter(delta))
    }

    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, ValueMetric::Gauge(value))
    }
}

/// An ordered group of samples shipped together in one delivery attempt.
///
/// `id` is assigned by the producer and only used to correlate asynchronous
/// delivery results; it never travels on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub id: u64,
    pub samples: Vec<Sample>,
}

impl Batch {
    pub fn new(id: u64, samples: Vec<Sample>) -> Self {
        Self { id, samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Wire records for every sample, in order.
    pub fn to_wire(&self) -> Vec<Metrics> {
        self.samples.iter().map(Metrics::from).collect()
    }
}
