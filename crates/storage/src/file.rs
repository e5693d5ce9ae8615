//! Snapshot-file [`Store`]: an in-memory store persisted as gzip NDJSON.
//!
//! The whole store is rewritten on every flush. A flush writes a temporary
//! sibling of the target and renames it over the target, so a crash leaves
//! either the previous or the new snapshot on disk.

use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use flate2::read::GzDecoder;
use metric_types::Metrics;
use metric_types::Sample;
use metric_types::ValueMetric;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::StoreError;
use crate::error::StoreResult;
use crate::memory::MemoryStore;
use crate::Store;
use crate::Visitor;

#[derive(Debug)]
pub struct FileStore {
    memory: MemoryStore,
    path: PathBuf,
    interval: Duration,
    flush_lock: Mutex<()>,
}

impl FileStore {
    /// Open the store backed by `path`.
    ///
    /// With `restore` the existing snapshot is loaded; a missing file yields an
    /// empty store. A zero `interval` flushes synchronously after every write.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Persistence`] if the file exists but cannot be read or decoded
    pub async fn open(path: PathBuf, restore: bool, interval: Duration) -> StoreResult<Self> {
        let memory = if restore {
            let samples = load(&path).await?;
            info!(path = %path.display(), metrics = samples.len(), "restored metric snapshot");
            MemoryStore::with_samples(samples)?
        } else {
            MemoryStore::new()
        };

        Ok(Self {
            memory,
            path,
            interval,
            flush_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn is_sync(&self) -> bool {
        self.interval.is_zero()
    }

    /// Write the current contents to disk.
    pub async fn flush(&self) -> StoreResult<()> {
        let _guard = self.flush_lock.lock().await;
        let samples = self.memory.snapshot().await?;
        let body = encode(&samples)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .change_context(StoreError::persistence("cannot create snapshot directory"))
                .attach_printable_lazy(|| format!("directory: {}", parent.display()))?;
        }

        let tmp = temp_sibling(&self.path);
        tokio::fs::write(&tmp, &body)
            .await
            .change_context(StoreError::persistence("cannot write snapshot"))
            .attach_printable_lazy(|| format!("path: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .change_context(StoreError::persistence("cannot replace snapshot"))
            .attach_printable_lazy(|| format!("path: {}", self.path.display()))?;

        debug!(path = %self.path.display(), metrics = samples.len(), "metric snapshot flushed");
        Ok(())
    }

    /// Flush every `interval` until `token` is cancelled.
    ///
    /// Returns immediately in synchronous mode. Flush failures are logged and
    /// the loop keeps going.
    pub async fn run_flusher(self: Arc<Self>, token: CancellationToken) {
        if self.is_sync() {
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("file flusher shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        error!("periodic snapshot flush failed: {e:?}");
                    }
                }
            }
        }
    }

    async fn flush_if_sync(&self) -> StoreResult<()> {
        if self.is_sync() {
            self.flush().await?;
        }
        Ok(())
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn encode(samples: &[Sample]) -> StoreResult<Vec<u8>> {
    let mut ndjson = Vec::new();
    for sample in samples {
        serde_json::to_writer(&mut ndjson, &Metrics::from(sample))
            .change_context(StoreError::persistence("cannot encode snapshot record"))?;
        ndjson.push(b'\n');
    }
    utils::codec::gzip(&ndjson).change_context(StoreError::persistence("cannot compress snapshot"))
}

async fn load(path: &Path) -> StoreResult<Vec<Sample>> {
    let compressed = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "no metric snapshot to restore");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(Report::new(e)
                .change_context(StoreError::persistence("cannot read snapshot"))
                .attach_printable(format!("path: {}", path.display())));
        }
    };
    decode(&compressed).attach_printable_lazy(|| format!("path: {}", path.display()))
}

fn decode(compressed: &[u8]) -> StoreResult<Vec<Sample>> {
    let mut ndjson = Vec::new();
    GzDecoder::new(compressed)
        .read_to_end(&mut ndjson)
        .change_context(StoreError::persistence("snapshot is not valid gzip"))?;

    let mut samples = Vec::new();
    for record in serde_json::Deserializer::from_slice(&ndjson).into_iter::<Metrics>() {
        let record =
            record.change_context(StoreError::persistence("malformed snapshot record"))?;
        let sample = record.to_sample().map_err(|e| {
            Report::new(StoreError::persistence("invalid snapshot record"))
                .attach_printable(format!("record `{}`: {e}", record.id))
        })?;
        samples.push(sample);
    }
    Ok(samples)
}

#[async_trait]
impl Store for FileStore {
    async fn add(&self, name: &str, value: ValueMetric) -> StoreResult<ValueMetric> {
        let merged = self.memory.add(name, value).await?;
        self.flush_if_sync().await?;
        Ok(merged)
    }

    async fn get(&self, name: &str) -> StoreResult<ValueMetric> {
        self.memory.get(name).await
    }

    async fn read_all(&self, visit: &mut Visitor<'_>) -> StoreResult<()> {
        self.memory.read_all(visit).await
    }

    async fn read_all_and_clear(&self, visit: &mut Visitor<'_>) -> StoreResult<()> {
        self.memory.read_all_and_clear(visit).await?;
        self.flush_if_sync().await
    }

    async fn add_multi(&self, records: Vec<Metrics>) -> StoreResult<Vec<Sample>> {
        let result = self.memory.add_multi(records).await;
        // records applied before a failure are kept, so persist them either way
        self.flush_if_sync().await?;
        result
    }

    async fn snapshot(&self) -> StoreResult<Vec<Sample>> {
        self.memory.snapshot().await
    }

    async fn close(&self) -> StoreResult<()> {
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[tokio::test]
    async fn close_then_restore_round_trips() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("metrics.gz");

        let store = FileStore::open(path.clone(), true, Duration::from_secs(300))
            .await
            .expect("should open");
        store.add("requests", ValueMetric::Counter(5)).await.expect("should add");
        store.add("requests", ValueMetric::Counter(7)).await.expect("should add");
        store.add("temp", ValueMetric::Gauge(36.6)).await.expect("should add");
        store.close().await.expect("should flush on close");

        let restored = FileStore::open(path, true, Duration::from_secs(300))
            .await
            .expect("should restore");
        assert_eq!(
            restored.snapshot().await.expect("should snapshot"),
            vec![Sample::counter("requests", 12), Sample::gauge("temp", 36.6)]
        );
    }

    #[tokio::test]
    async fn missing_file_restores_empty() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let store = FileStore::open(dir.path().join("absent.gz"), true, Duration::ZERO)
            .await
            .expect("should open");
        assert!(store.snapshot().await.expect("should snapshot").is_empty());
    }

    #[tokio::test]
    async fn restore_disabled_ignores_existing_file() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("metrics.gz");
        std::fs::write(&path, b"garbage").expect("should write");

        let store = FileStore::open(path, false, Duration::ZERO)
            .await
            .expect("should open without reading");
        assert!(store.snapshot().await.expect("should snapshot").is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_aborts_restore() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("metrics.gz");
        std::fs::write(&path, b"not a gzip stream").expect("should write");

        let err = FileStore::open(path, true, Duration::ZERO)
            .await
            .expect_err("should fail to decode");
        assert!(matches!(err.current_context(), StoreError::Persistence { .. }));
    }

    #[tokio::test]
    async fn invalid_record_aborts_restore() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("metrics.gz");
        let body = utils::codec::gzip(b"{\"id\":\"x\",\"type\":\"histogram\",\"value\":1}\n")
            .expect("should compress");
        std::fs::write(&path, body).expect("should write");

        let err = FileStore::open(path, true, Duration::ZERO)
            .await
            .expect_err("should reject record");
        assert!(matches!(err.current_context(), StoreError::Persistence { .. }));
    }

    #[tokio::test]
    async fn sync_mode_flushes_every_write() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("nested").join("metrics.gz");

        let store = FileStore::open(path.clone(), true, Duration::ZERO)
            .await
            .expect("should open");
        store.add("hits", ValueMetric::Counter(2)).await.expect("should add");

        assert!(path.exists());
        assert!(!temp_sibling(&path).exists());
        let on_disk = load(&path).await.expect("should load");
        assert_eq!(on_disk, vec![Sample::counter("hits", 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn flusher_writes_on_tick_and_stops_on_cancel() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("metrics.gz");
        let store = Arc::new(
            FileStore::open(path.clone(), false, Duration::from_secs(5))
                .await
                .expect("should open"),
        );
        store.add("hits", ValueMetric::Counter(1)).await.expect("should add");
        assert!(!path.exists());

        let token = CancellationToken::new();
        let flusher = tokio::spawn(store.clone().run_flusher(token.clone()));
        tokio::time::sleep(Duration::from_secs(6)).await;
        token.cancel();
        flusher.await.expect("flusher should stop");

        assert_eq!(load(&path).await.expect("should load"), vec![Sample::counter("hits", 1)]);
    }
}
