//! RPC transports: JSON messages posted to the `metrics.Metrics` methods.

use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use metric_types::rpc::RpcCode;
use metric_types::rpc::RpcReply;
use metric_types::rpc::UpdateRequest;
use metric_types::rpc::UpdatesRequest;
use metric_types::rpc::UPDATES_METHOD;
use metric_types::rpc::UPDATE_METHOD;
use metric_types::Batch;
use metric_types::Metrics;
use serde::Serialize;
use tracing::debug;

use super::http::classify;
use super::HttpEndpoint;
use super::Transport;
use super::TransportError;
use super::TransportResult;

async fn call<T: Serialize>(
    endpoint: &HttpEndpoint,
    method: &str,
    request: &T,
) -> TransportResult<RpcReply> {
    let segments: Vec<&str> = method.trim_start_matches('/').split('/').collect();
    let response = endpoint.post_json(&segments, request).await?;
    let body = response.bytes().await.map_err(|e| Report::new(classify(e)))?;
    let reply: RpcReply = serde_json::from_slice(&body).change_context(TransportError::Server {
        message: format!("malformed reply from {method}"),
    })?;

    match reply.code {
        RpcCode::Ok => Ok(reply),
        RpcCode::InvalidArgument | RpcCode::NotFound | RpcCode::Unauthenticated => {
            Err(Report::new(TransportError::Rejected {
                message: format!("{:?}: {}", reply.code, reply.message),
            }))
        }
        RpcCode::Internal => Err(Report::new(TransportError::Server {
            message: reply.message,
        })),
    }
}

/// One `Update` call per sample.
pub struct RpcSender {
    endpoint: Arc<HttpEndpoint>,
}

impl RpcSender {
    pub fn new(endpoint: Arc<HttpEndpoint>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Transport for RpcSender {
    async fn send(&self, batch: &Batch) -> TransportResult<()> {
        for sample in &batch.samples {
            let request = UpdateRequest {
                metric: Metrics::from(sample),
            };
            call(&self.endpoint, UPDATE_METHOD, &request)
                .await
                .attach_printable_lazy(|| format!("metric: {}", sample.name))?;
        }
        debug!(batch = batch.id, metrics = batch.len(), "rpc batch delivered");
        Ok(())
    }
}

/// One `Updates` call per batch.
pub struct RpcBatchSender {
    endpoint: Arc<HttpEndpoint>,
}

impl RpcBatchSender {
    pub fn new(endpoint: Arc<HttpEndpoint>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Transport for RpcBatchSender {
    async fn send(&self, batch: &Batch) -> TransportResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let request = UpdatesRequest {
            metrics: batch.to_wire(),
        };
        let reply = call(&self.endpoint, UPDATES_METHOD, &request).await?;
        debug!(
            batch = batch.id,
            metrics = batch.len(),
            merged = reply.metrics.len(),
            "rpc batch delivered"
        );
        Ok(())
    }
}
