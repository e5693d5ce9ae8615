//! Delivery of metric batches to the server.
//!
//! A [`Strategy`] is resolved once from the configured content format and batch
//! size and turned into a shared [`Transport`] used by every worker.

use core::error::Error;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use derive_more::Display;
use error_stack::Report;
use metric_types::Batch;
use tracing::warn;

use crate::config::ContentFormat;

mod http;
mod rpc;

pub use http::HttpEndpoint;
pub use http::JsonBatchSender;
pub use http::JsonSender;
pub use http::PlainSender;
pub use rpc::RpcBatchSender;
pub use rpc::RpcSender;

/// Upper bound for one HTTP exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub type TransportResult<T> = Result<T, Report<TransportError>>;

#[derive(Debug, Display, Clone, PartialEq)]
pub enum TransportError {
    #[display("network error: {message}")]
    Network { message: String },

    #[display("request timed out")]
    Timeout,

    /// The server refused the payload; resending it cannot succeed.
    #[display("request rejected: {message}")]
    Rejected { message: String },

    #[display("server error: {message}")]
    Server { message: String },

    #[display("cannot encode payload")]
    Encoding,

    #[display("delivery cancelled")]
    Cancelled,
}

impl Error for TransportError {}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Network { .. } | TransportError::Timeout | TransportError::Server { .. }
        )
    }

    /// Whether the payload may be delivered again later: transient failures,
    /// and cancellations where nothing reached the server.
    pub fn is_resendable(&self) -> bool {
        self.is_retryable() || matches!(self, TransportError::Cancelled)
    }

    /// Classifier for [`utils::retry::retry_action`].
    pub fn is_retryable_report(report: &Report<TransportError>) -> bool {
        report.current_context().is_retryable()
    }
}

/// Sends one batch; implementations are shared across workers.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, batch: &Batch) -> TransportResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Strategy {
    #[display("plain")]
    PlainSingle,
    #[display("json")]
    JsonSingle,
    #[display("json-batch")]
    JsonBatch,
    #[display("rpc")]
    RpcSingle,
    #[display("rpc-batch")]
    RpcBatch,
}

impl Strategy {
    /// Pick the strategy for `format`; a batch size above one selects the
    /// batched form where there is one.
    pub fn resolve(format: ContentFormat, batch_size: usize) -> Self {
        let batched = batch_size > 1;
        match (format, batched) {
            (ContentFormat::Plain, true) => {
                warn!(batch_size, "plain format has no batch form, sending metrics one by one");
                Strategy::PlainSingle
            }
            (ContentFormat::Plain, false) => Strategy::PlainSingle,
            (ContentFormat::Json, false) => Strategy::JsonSingle,
            (ContentFormat::Json, true) => Strategy::JsonBatch,
            (ContentFormat::Rpc, false) => Strategy::RpcSingle,
            (ContentFormat::Rpc, true) => Strategy::RpcBatch,
        }
    }

    pub fn is_batched(self) -> bool {
        matches!(self, Strategy::JsonBatch | Strategy::RpcBatch)
    }

    pub fn build(self, endpoint: HttpEndpoint) -> Arc<dyn Transport> {
        let endpoint = Arc::new(endpoint);
        match self {
            Strategy::PlainSingle => Arc::new(PlainSender::new(endpoint)),
            Strategy::JsonSingle => Arc::new(JsonSender::new(endpoint)),
            Strategy::JsonBatch => Arc::new(JsonBatchSender::new(endpoint)),
            Strategy::RpcSingle => Arc::new(RpcSender::new(endpoint)),
            Strategy::RpcBatch => Arc::new(RpcBatchSender::new(endpoint)),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn strategy_follows_format_and_batch_size() {
        let cases = [
            (ContentFormat::Plain, 0, Strategy::PlainSingle),
            (ContentFormat::Plain, 50, Strategy::PlainSingle),
            (ContentFormat::Json, 0, Strategy::JsonSingle),
            (ContentFormat::Json, 1, Strategy::JsonSingle),
            (ContentFormat::Json, 2, Strategy::JsonBatch),
            (ContentFormat::Rpc, 1, Strategy::RpcSingle),
            (ContentFormat::Rpc, 10, Strategy::RpcBatch),
        ];
        for (format, batch_size, expected) in cases {
            assert_eq!(
                Strategy::resolve(format, batch_size),
                expected,
                "format {format:?} batch size {batch_size}"
            );
        }
    }

    #[test]
    fn refused_payloads_are_not_resendable() {
        assert!(TransportError::Cancelled.is_resendable());
        assert!(TransportError::Timeout.is_resendable());
        assert!(!TransportError::Encoding.is_resendable());
        assert!(!TransportError::Rejected {
            message: "400".to_string()
        }
        .is_resendable());
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::Network {
            message: "refused".to_string()
        }
        .is_retryable());
        assert!(TransportError::Server {
            message: "500".to_string()
        }
        .is_retryable());
        assert!(!TransportError::Rejected {
            message: "400".to_string()
        }
        .is_retryable());
        assert!(!TransportError::Encoding.is_retryable());
        assert!(!TransportError::Cancelled.is_retryable());
    }
}
