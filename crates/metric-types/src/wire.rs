//! JSON wire record shared by the HTTP API, the RPC binding and the file backend.

use serde::Deserialize;
use serde::Serialize;

use crate::error::MetricError;
use crate::value::MetricKind;
use crate::value::ValueMetric;
use crate::Sample;

/// One metric as it travels on the wire.
///
/// `delta` is present for counters and `value` for gauges. The type tag is kept
/// as a string so an unknown tag surfaces as [`MetricError::BadKindType`]
/// rather than a deserialization failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Metrics {
    /// A lookup request: name and type without payload.
    pub fn query(id: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            id: id.into(),
            kind: kind.as_str().to_string(),
            delta: None,
            value: None,
        }
    }

    pub fn kind(&self) -> Result<MetricKind, MetricError> {
        self.kind.parse()
    }

    /// Validate the record and turn it into a [`Sample`].
    ///
    /// # Errors
    ///
    /// - [`MetricError::BadName`] for an empty id
    /// - [`MetricError::BadKindType`] for an unknown type tag
    /// - [`MetricError::BadValue`] if the payload does not match the type
    pub fn to_sample(&self) -> Result<Sample, MetricError> {
        if self.id.is_empty() {
            return Err(MetricError::BadName);
        }
        let value = ValueMetric::from_parts(&self.kind, self.delta, self.value)?;
        Ok(Sample::new(self.id.clone(), value))
    }
}

impl From<&Sample> for Metrics {
    fn from(sample: &Sample) -> Self {
        let (kind, delta, value) = sample.value.to_parts();
        Self {
            id: sample.name.clone(),
            kind: kind.as_str().to_string(),
            delta,
            value,
        }
    }
}

impl From<Sample> for Metrics {
    fn from(sample: Sample) -> Self {
        Metrics::from(&sample)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn counter_serializes_without_value_field() {
        let json = serde_json::to_string(&Metrics::from(Sample::counter("PollCount", 3)))
            .expect("should serialize");
        assert_eq!(json, r#"{"id":"PollCount","type":"counter","delta":3}"#);
    }

    #[test]
    fn gauge_serializes_without_delta_field() {
        let json = serde_json::to_string(&Metrics::from(Sample::gauge("Alloc", 1.5)))
            .expect("should serialize");
        assert_eq!(json, r#"{"id":"Alloc","type":"gauge","value":1.5}"#);
    }

    #[test]
    fn unknown_type_tag_deserializes_then_fails_validation() {
        let record: Metrics = serde_json::from_str(r#"{"id":"x","type":"summary","value":1}"#)
            .expect("should deserialize");
        assert_eq!(
            record.to_sample(),
            Err(MetricError::BadKindType("summary".to_string()))
        );
    }

    #[test]
    fn empty_id_is_bad_name() {
        let record: Metrics = serde_json::from_str(r#"{"id":"","type":"counter","delta":1}"#)
            .expect("should deserialize");
        assert_eq!(record.to_sample(), Err(MetricError::BadName));
    }
}
