//! Server-side entry point to the store: validates incoming records and
//! answers lookups in wire form.

use std::sync::Arc;

use error_stack::Report;
use metric_types::MetricKind;
use metric_types::Metrics;
use metric_types::Sample;
use metric_types::ValueMetric;
use storage::Store;
use storage::StoreError;
use storage::StoreResult;

#[derive(Clone)]
pub struct Aggregator {
    store: Arc<dyn Store>,
}

fn validation(name: &str, err: metric_types::MetricError) -> Report<StoreError> {
    Report::new(StoreError::from_metric(name, err))
}

fn parse_kind(name: &str, kind: &str) -> StoreResult<MetricKind> {
    kind.parse().map_err(|e| validation(name, e))
}

impl Aggregator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Merge one wire record and return the aggregated value.
    pub async fn update(&self, record: Metrics) -> StoreResult<Metrics> {
        let sample = record.to_sample().map_err(|e| validation(&record.id, e))?;
        let merged = self.store.add(&sample.name, sample.value).await?;
        Ok(Metrics::from(Sample::new(sample.name, merged)))
    }

    /// Merge `records` in order; the returned list is parallel to the input.
    pub async fn update_batch(&self, records: Vec<Metrics>) -> StoreResult<Vec<Metrics>> {
        let merged = self.store.add_multi(records).await?;
        Ok(merged.into_iter().map(Metrics::from).collect())
    }

    /// Merge a value given as path segments, e.g. `counter`, `hits`, `5`.
    pub async fn update_plain(&self, kind: &str, name: &str, raw: &str) -> StoreResult<Metrics> {
        let kind = parse_kind(name, kind)?;
        if name.is_empty() {
            return Err(Report::new(StoreError::BadName));
        }
        let value = ValueMetric::parse(kind, raw).map_err(|e| validation(name, e))?;
        let merged = self.store.add(name, value).await?;
        Ok(Metrics::from(Sample::new(name, merged)))
    }

    /// Look up `name`, which must be stored with the requested kind.
    pub async fn value(&self, kind: &str, name: &str) -> StoreResult<Metrics> {
        let kind = parse_kind(name, kind)?;
        if name.is_empty() {
            return Err(Report::new(StoreError::BadName));
        }
        let value = self.store.get(name).await?;
        if value.kind() != kind {
            return Err(Report::new(StoreError::NotFound {
                name: name.to_string(),
            })
            .attach_printable(format!("stored as {}, requested {kind}", value.kind())));
        }
        Ok(Metrics::from(Sample::new(name, value)))
    }

    pub async fn snapshot(&self) -> StoreResult<Vec<Sample>> {
        self.store.snapshot().await
    }

    pub async fn ping(&self) -> StoreResult<()> {
        self.store.ping().await
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use storage::MemoryStore;

    use super::*;

    fn aggregator() -> Aggregator {
        Aggregator::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn counter_updates_accumulate() {
        let aggregator = aggregator();
        aggregator
            .update(Metrics::from(Sample::counter("requests", 5)))
            .await
            .expect("should update");
        let merged = aggregator
            .update(Metrics::from(Sample::counter("requests", 7)))
            .await
            .expect("should update");

        assert_eq!(merged, Metrics::from(Sample::counter("requests", 12)));
    }

    #[tokio::test]
    async fn plain_update_parses_by_kind() {
        let aggregator = aggregator();
        let merged = aggregator
            .update_plain("gauge", "temp", "36.6")
            .await
            .expect("should update");
        assert_eq!(merged.value, Some(36.6));

        let err = aggregator
            .update_plain("counter", "hits", "1.5")
            .await
            .expect_err("fractional counter should fail");
        assert!(matches!(err.current_context(), StoreError::BadValue { .. }));

        let err = aggregator
            .update_plain("histogram", "hits", "1")
            .await
            .expect_err("unknown kind should fail");
        assert!(matches!(err.current_context(), StoreError::BadKindType { .. }));
    }

    #[tokio::test]
    async fn lookup_with_wrong_kind_is_not_found() {
        let aggregator = aggregator();
        aggregator
            .update_plain("gauge", "temp", "1")
            .await
            .expect("should update");

        let err = aggregator
            .value("counter", "temp")
            .await
            .expect_err("should be missing");
        assert!(matches!(err.current_context(), StoreError::NotFound { .. }));

        let found = aggregator.value("gauge", "temp").await.expect("should exist");
        assert_eq!(found, Metrics::from(Sample::gauge("temp", 1.0)));
    }

    #[tokio::test]
    async fn record_without_payload_is_bad_value() {
        let aggregator = aggregator();
        let err = aggregator
            .update(Metrics::query("temp", MetricKind::Gauge))
            .await
            .expect_err("should fail");
        assert!(matches!(err.current_context(), StoreError::BadValue { .. }));
    }
}
