//! Metric aggregation stores.
//!
//! Every backend implements [`Store`] and is injected as `Arc<dyn Store>`.
//! [`open`] picks the backend from a [`StorageConfig`]: a database DSN selects
//! PostgreSQL, otherwise a file path selects the snapshot file, otherwise the
//! store lives in memory only.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metric_types::Metrics;
use metric_types::Sample;
use metric_types::ValueMetric;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod error;
pub mod file;
pub mod memory;
pub mod postgres;

pub use error::StoreError;
pub use error::StoreResult;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Callback used by the iteration methods; returning an error stops iteration.
pub type Visitor<'a> = dyn FnMut(&str, &ValueMetric) -> StoreResult<()> + Send + 'a;

/// Name-keyed metric aggregation shared by the agent and the server.
///
/// Every operation is atomic per metric name. Iteration happens in name order
/// over a consistent cut of the store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create `name` or merge `value` into it, returning the merged value.
    async fn add(&self, name: &str, value: ValueMetric) -> StoreResult<ValueMetric>;

    async fn get(&self, name: &str) -> StoreResult<ValueMetric>;

    async fn read_all(&self, visit: &mut Visitor<'_>) -> StoreResult<()>;

    /// Like [`read_all`](Store::read_all), resetting each counter to zero in
    /// the same critical section it was read in.
    async fn read_all_and_clear(&self, visit: &mut Visitor<'_>) -> StoreResult<()>;

    /// Apply wire records in order and return the merged samples.
    async fn add_multi(&self, records: Vec<Metrics>) -> StoreResult<Vec<Sample>>;

    async fn snapshot(&self) -> StoreResult<Vec<Sample>> {
        let mut samples = Vec::new();
        self.read_all(&mut |name, value| {
            samples.push(Sample::new(name, *value));
            Ok(())
        })
        .await?;
        Ok(samples)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Backend selection inputs, usually straight from the server configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_dsn: Option<String>,
    pub file_path: Option<PathBuf>,
    pub restore: bool,
    /// Zero flushes the file after every write.
    pub store_interval: Duration,
    pub batch_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_dsn: None,
            file_path: None,
            restore: true,
            store_interval: Duration::from_secs(300),
            batch_limit: postgres::DEFAULT_BATCH_LIMIT,
        }
    }
}

/// An opened backend.
///
/// `flusher` is set for the file backend so the owner can drive
/// [`FileStore::run_flusher`].
pub struct Backend {
    pub store: Arc<dyn Store>,
    pub flusher: Option<Arc<FileStore>>,
}

/// Open the backend selected by `config`.
///
/// `token` interrupts the PostgreSQL connection retries.
pub async fn open(config: &StorageConfig, token: &CancellationToken) -> StoreResult<Backend> {
    if let Some(dsn) = config.database_dsn.as_deref().filter(|dsn| !dsn.is_empty()) {
        info!("using postgres metric store");
        let store = PostgresStore::connect(dsn, config.batch_limit, token).await?;
        return Ok(Backend {
            store: Arc::new(store),
            flusher: None,
        });
    }

    if let Some(path) = config.file_path.as_ref().filter(|p| !p.as_os_str().is_empty()) {
        info!(path = %path.display(), restore = config.restore, "using file metric store");
        let store = Arc::new(
            FileStore::open(path.clone(), config.restore, config.store_interval).await?,
        );
        return Ok(Backend {
            store: store.clone(),
            flusher: Some(store),
        });
    }

    info!("using in-memory metric store");
    Ok(Backend {
        store: Arc::new(MemoryStore::new()),
        flusher: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_config_selects_memory() {
        let backend = open(&StorageConfig::default(), &CancellationToken::new())
            .await
            .expect("should open memory store");
        assert!(backend.flusher.is_none());
        backend
            .store
            .add("hits", ValueMetric::Counter(1))
            .await
            .expect("should add");
    }

    #[tokio::test]
    async fn file_path_selects_file_backend() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let config = StorageConfig {
            file_path: Some(dir.path().join("metrics.json.gz")),
            ..StorageConfig::default()
        };

        let backend = open(&config, &CancellationToken::new())
            .await
            .expect("should open file store");
        assert!(backend.flusher.is_some());
    }
}
