//! In-memory [`Store`] guarded by a single lock.

use std::collections::BTreeMap;

use async_trait::async_trait;
use error_stack::Report;
use metric_types::Metrics;
use metric_types::Sample;
use metric_types::ValueMetric;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::error::StoreResult;
use crate::Store;
use crate::Visitor;

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, ValueMetric>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-filled with `samples`, merging repeated names.
    pub fn with_samples(samples: impl IntoIterator<Item = Sample>) -> StoreResult<Self> {
        let mut entries = BTreeMap::new();
        for sample in samples {
            merge_into(&mut entries, &sample.name, sample.value)?;
        }
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }
}

fn merge_into(
    entries: &mut BTreeMap<String, ValueMetric>,
    name: &str,
    value: ValueMetric,
) -> StoreResult<ValueMetric> {
    if name.is_empty() {
        return Err(Report::new(StoreError::BadName));
    }
    let merged = match entries.get(name) {
        Some(current) => current
            .merge(&value)
            .map_err(|e| Report::new(StoreError::from_metric(name, e)))?,
        None => value,
    };
    entries.insert(name.to_string(), merged);
    Ok(merged)
}

#[async_trait]
impl Store for MemoryStore {
    async fn add(&self, name: &str, value: ValueMetric) -> StoreResult<ValueMetric> {
        let mut entries = self.entries.lock().await;
        merge_into(&mut entries, name, value)
    }

    async fn get(&self, name: &str) -> StoreResult<ValueMetric> {
        let entries = self.entries.lock().await;
        entries.get(name).copied().ok_or_else(|| {
            Report::new(StoreError::NotFound {
                name: name.to_string(),
            })
        })
    }

    async fn read_all(&self, visit: &mut Visitor<'_>) -> StoreResult<()> {
        let entries = self.entries.lock().await;
        for (name, value) in entries.iter() {
            visit(name, value)?;
        }
        Ok(())
    }

    async fn read_all_and_clear(&self, visit: &mut Visitor<'_>) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        for (name, value) in entries.iter() {
            visit(name, value)?;
        }
        // counters are reset only once every entry was accepted
        for value in entries.values_mut() {
            value.read_and_clear();
        }
        Ok(())
    }

    async fn add_multi(&self, records: Vec<Metrics>) -> StoreResult<Vec<Sample>> {
        let mut entries = self.entries.lock().await;
        let mut merged = Vec::with_capacity(records.len());
        for record in &records {
            let sample = record
                .to_sample()
                .map_err(|e| Report::new(StoreError::from_metric(&record.id, e)))?;
            let value = merge_into(&mut entries, &sample.name, sample.value)?;
            merged.push(Sample::new(sample.name, value));
        }
        Ok(merged)
    }
}
