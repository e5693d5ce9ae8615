//! Report loop: drains the local store into batches and hands them to the
//! worker pool.
//!
//! Batches are remembered until their result arrives. When delivery fails
//! transiently or is cancelled, the counter deltas of the batch are merged
//! back into the store so the next report carries them; gauges are dropped
//! since a newer reading supersedes them. Batches the server refused are
//! dropped: it may already have applied part of them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metric_types::Batch;
use metric_types::Sample;
use metric_types::ValueMetric;
use storage::Store;
use storage::StoreResult;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::pool::Job;
use crate::pool::JobResult;
use crate::pool::WorkerPool;

/// Time the pool gets to deliver the final report on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type InFlight = Arc<Mutex<HashMap<u64, Batch>>>;

pub struct Dispatcher {
    store: Arc<dyn Store>,
    pool: WorkerPool,
    in_flight: InFlight,
    consumer: JoinHandle<()>,
    chunk_size: usize,
    interval: Duration,
    next_id: u64,
}

impl Dispatcher {
    /// `chunk_size` is the number of samples per batch; anything below one is
    /// treated as one.
    pub fn new(
        store: Arc<dyn Store>,
        pool: WorkerPool,
        results: mpsc::Receiver<JobResult>,
        chunk_size: usize,
        interval: Duration,
    ) -> Self {
        let in_flight = InFlight::default();
        let consumer = tokio::spawn(consume_results(results, in_flight.clone(), store.clone()));
        Self {
            store,
            pool,
            in_flight,
            consumer,
            chunk_size: chunk_size.max(1),
            interval,
            next_id: 0,
        }
    }

    /// Drain the store and queue its contents; returns the number of batches.
    pub async fn report(&mut self) -> StoreResult<usize> {
        let mut samples = Vec::new();
        self.store
            .read_all_and_clear(&mut |name, value| {
                samples.push(Sample::new(name, *value));
                Ok(())
            })
            .await?;
        if samples.is_empty() {
            return Ok(0);
        }

        let total = samples.len();
        let mut queued = 0;
        for chunk in samples.chunks(self.chunk_size) {
            self.next_id += 1;
            let batch = Batch::new(self.next_id, chunk.to_vec());
            self.in_flight.lock().await.insert(batch.id, batch.clone());

            if let Err(job) = self.pool.submit(Job { batch }).await {
                warn!(batch = job.batch.id, "pool is shutting down, keeping batch for later");
                self.in_flight.lock().await.remove(&job.batch.id);
                requeue_counters(self.store.as_ref(), &job.batch).await;
            } else {
                queued += 1;
            }
        }
        debug!(metrics = total, batches = queued, "report queued");
        Ok(queued)
    }

    /// Report every interval until `token` fires, then send a final report and
    /// shut the pool down.
    pub async fn run(mut self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        // no report at startup
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("dispatcher shutdown requested, sending final report");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.report().await {
                        error!("report failed: {e:?}");
                    }
                }
            }
        }

        if let Err(e) = self.report().await {
            error!("final report failed: {e:?}");
        }
        self.shutdown().await;
    }

    async fn shutdown(self) {
        self.pool.shutdown(SHUTDOWN_GRACE).await;
        if let Err(e) = self.consumer.await {
            error!("result consumer failed: {e}");
        }
        let lost = self.in_flight.lock().await.len();
        if lost > 0 {
            warn!(batches = lost, "batches without a delivery result at exit");
        }
    }
}

async fn consume_results(
    mut results: mpsc::Receiver<JobResult>,
    in_flight: InFlight,
    store: Arc<dyn Store>,
) {
    while let Some(result) = results.recv().await {
        let batch = in_flight.lock().await.remove(&result.id);
        let Some(error) = result.error else {
            continue;
        };
        match batch {
            Some(batch) if error.current_context().is_resendable() => {
                warn!(batch = result.id, "delivery failed, re-merging counters: {error:?}");
                requeue_counters(store.as_ref(), &batch).await;
            }
            Some(batch) => {
                error!(
                    batch = result.id,
                    metrics = batch.len(),
                    "batch refused, dropping it: {error:?}"
                );
            }
            None => warn!(batch = result.id, "delivery failed for unknown batch: {error:?}"),
        }
    }
}

/// Merge the counter deltas of an undelivered batch back into `store`.
async fn requeue_counters(store: &dyn Store, batch: &Batch) {
    for sample in &batch.samples {
        let ValueMetric::Counter(delta) = sample.value else {
            continue;
        };
        if delta == 0 {
            continue;
        }
        if let Err(e) = store.add(&sample.name, ValueMetric::Counter(delta)).await {
            error!(metric = %sample.name, delta, "cannot re-merge undelivered counter: {e:?}");
        }
    }
}
