//! Agent wiring: local store, collector, transport, worker pool and dispatcher.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use storage::MemoryStore;
use storage::Store;
use utils::tasks::Tasks;

use crate::collector::Collector;
use crate::collector::HostSource;
use crate::config::AgentConfig;
use crate::dispatch::Dispatcher;
use crate::pool::PoolConfig;
use crate::pool::WorkerPool;
use crate::transport::HttpEndpoint;
use crate::transport::Strategy;
use crate::transport::REQUEST_TIMEOUT;

/// Time allowed for every task to stop once shutdown starts.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Agent {
    config: AgentConfig,
    store: Arc<dyn Store>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            store: Arc::new(MemoryStore::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Build the delivery side of the pipeline.
    pub fn dispatcher(&self) -> Result<Dispatcher> {
        let strategy = Strategy::resolve(self.config.content_format, self.config.batch_size);
        let endpoint = HttpEndpoint::new(
            &self.config.address,
            self.config.key.as_deref(),
            REQUEST_TIMEOUT,
        )
        .map_err(|e| anyhow::anyhow!("Failed to create server endpoint: {e:?}"))?;
        tracing::info!(
            %strategy,
            server = %endpoint.base(),
            signed = self.config.key.is_some(),
            "reporting strategy resolved"
        );

        let transport = strategy.build(endpoint);
        let (pool, results) = WorkerPool::new(PoolConfig::new(self.config.rate_limit), transport);
        let chunk_size = if strategy.is_batched() {
            self.config.batch_size
        } else {
            1
        };
        Ok(Dispatcher::new(
            self.store.clone(),
            pool,
            results,
            chunk_size,
            self.config.report_interval,
        ))
    }

    /// Run until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let mut tasks = Tasks::new();

        let collector = Collector::new(self.store.clone(), self.config.poll_interval)
            .with_source(HostSource::new(self.config.collect_cpu));
        tasks.spawn("collector", collector.run(tasks.token()));

        let dispatcher = self.dispatcher()?;
        tasks.spawn("dispatcher", dispatcher.run(tasks.token()));

        tasks
            .wait_for_completion(TASK_SHUTDOWN_TIMEOUT)
            .await?;
        tracing::info!("Agent stopped");
        Ok(())
    }
}
