use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use metric_types::rpc::UPDATES_METHOD;
use metric_types::rpc::UPDATE_METHOD;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::get;
use poem::post;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::info;
use utils::codec::CodecStack;

use super::errors::ApiError;
use super::handlers;
use super::middleware::CodecMiddleware;
use super::rpc;
use crate::aggregator::Aggregator;

const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

/// Build the full route table around `aggregator`.
pub fn routes(aggregator: Aggregator, codec: Arc<CodecStack>) -> impl Endpoint {
    Route::new()
        .at("/", get(handlers::index))
        .at("/ping", get(handlers::ping))
        .at("/update/", post(handlers::update_json))
        .at("/updates/", post(handlers::update_batch_json))
        .at("/value/", post(handlers::value_json))
        .at("/update/:kind/:name/:value", post(handlers::update_plain))
        .at("/value/:kind/:name", get(handlers::value_plain))
        .at(UPDATE_METHOD, post(rpc::update))
        .at(UPDATES_METHOD, post(rpc::updates))
        .with(CodecMiddleware::new(codec.clone()))
        .data(aggregator)
        .data(codec)
        .with(Tracing)
}

/// API server
pub struct ApiServer {
    aggregator: Aggregator,
    codec: Arc<CodecStack>,
    listen_addr: String,
}

impl ApiServer {
    pub fn new(aggregator: Aggregator, codec: CodecStack, listen_addr: String) -> Self {
        Self {
            aggregator,
            codec: Arc::new(codec),
            listen_addr,
        }
    }

    /// Serve until `cancellation_token` fires.
    ///
    /// # Errors
    ///
    /// - [`ApiError::ServerError`] if binding or serving fails
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), Report<ApiError>> {
        info!("Starting HTTP API server on {}", self.listen_addr);

        let app = routes(self.aggregator, self.codec);
        Server::new(TcpListener::bind(&self.listen_addr))
            .run_with_graceful_shutdown(
                app,
                async move { cancellation_token.cancelled().await },
                Some(GRACEFUL_SHUTDOWN),
            )
            .await
            .change_context(ApiError::ServerError {
                message: format!("HTTP server on {} failed", self.listen_addr),
            })?;

        info!("HTTP API server stopped");
        Ok(())
    }
}
