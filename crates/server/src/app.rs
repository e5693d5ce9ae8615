//! Server wiring: storage backend, snapshot flusher and HTTP API.

use std::time::Duration;

use anyhow::Result;
use utils::codec::CodecStack;
use utils::tasks::Tasks;

use crate::aggregator::Aggregator;
use crate::api::ApiServer;
use crate::config::ServerConfig;

/// Time allowed for every task to stop once shutdown starts.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct MetricsServer {
    config: ServerConfig,
}

impl MetricsServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Run until a shutdown signal arrives or the API server exits.
    pub async fn run(self) -> Result<()> {
        let mut tasks = Tasks::new();

        let backend = storage::open(&self.config.storage(), &tasks.token())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open metric store: {e:?}"))?;

        if let Some(flusher) = backend.flusher.clone() {
            if !flusher.interval().is_zero() {
                tasks.spawn("snapshot flusher", flusher.run_flusher(tasks.token()));
            }
        }

        let codec = CodecStack::for_key(self.config.key.as_deref());
        let api_server = ApiServer::new(
            Aggregator::new(backend.store.clone()),
            codec,
            self.config.address.clone(),
        );
        let token = tasks.token();
        tasks.spawn("api server", async move {
            if let Err(e) = api_server.run(token).await {
                tracing::error!("API server error: {e:?}");
            }
        });

        tasks.wait_for_completion(TASK_SHUTDOWN_TIMEOUT).await?;

        if let Err(e) = backend.store.close().await {
            tracing::error!("Failed to close metric store: {e:?}");
        }
        tracing::info!("Server stopped");
        Ok(())
    }
}
