//! HTTP transports: plain path updates and gzip JSON bodies.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use metric_types::Batch;
use metric_types::Metrics;
use reqwest::header::CONTENT_ENCODING;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use reqwest::Response;
use reqwest::Url;
use serde::Serialize;
use tracing::debug;
use utils::codec::CodecStack;
use utils::codec::HASH_HEADER;

use super::Transport;
use super::TransportError;
use super::TransportResult;

/// Server base URL, HTTP client and codec shared by every sender.
#[derive(Debug)]
pub struct HttpEndpoint {
    client: Client,
    base: Url,
    codec: CodecStack,
}

impl HttpEndpoint {
    /// `address` is `host:port` or a full URL; bodies are signed when `key`
    /// is set.
    pub fn new(address: &str, key: Option<&str>, timeout: Duration) -> TransportResult<Self> {
        let base = base_url(address)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Report::new(classify(e)))?;
        Ok(Self {
            client,
            base,
            codec: CodecStack::for_key(key),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// URL of `segments` below the base, each one percent-encoded.
    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> TransportResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| {
                Report::new(TransportError::Encoding)
                    .attach_printable("base URL cannot have a path")
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// POST `payload` as JSON through the codec stack.
    pub(crate) async fn post_json<T: Serialize + ?Sized>(
        &self,
        segments: &[&str],
        payload: &T,
    ) -> TransportResult<Response> {
        let json = serde_json::to_vec(payload).change_context(TransportError::Encoding)?;
        let encoded = self
            .codec
            .encode(&json)
            .change_context(TransportError::Encoding)?;

        let mut request = self
            .client
            .post(self.url(segments.iter().copied())?)
            .header(CONTENT_TYPE, "application/json");
        if self.codec.is_compressing() {
            request = request.header(CONTENT_ENCODING, "gzip");
        }
        if let Some(signature) = encoded.signature {
            request = request.header(HASH_HEADER, signature);
        }

        let response = request
            .body(encoded.body)
            .send()
            .await
            .map_err(|e| Report::new(classify(e)))?;
        check_status(response).await
    }

    pub(crate) async fn post_plain(&self, segments: &[&str]) -> TransportResult<Response> {
        let response = self
            .client
            .post(self.url(segments.iter().copied())?)
            .header(CONTENT_TYPE, "text/plain")
            .send()
            .await
            .map_err(|e| Report::new(classify(e)))?;
        check_status(response).await
    }
}

fn base_url(address: &str) -> TransportResult<Url> {
    let address = address.trim();
    let raw = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    };
    Url::parse(&raw).map_err(|e| {
        Report::new(TransportError::Encoding)
            .attach_printable(format!("bad address `{address}`: {e}"))
    })
}

pub(crate) fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network {
            message: err.to_string(),
        }
    }
}

async fn check_status(response: Response) -> TransportResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{status}: {}", body.trim());
    if status.is_client_error() {
        Err(Report::new(TransportError::Rejected { message }))
    } else {
        Err(Report::new(TransportError::Server { message }))
    }
}

/// `POST /update/{type}/{name}/{value}` for every sample.
pub struct PlainSender {
    endpoint: Arc<HttpEndpoint>,
}

impl PlainSender {
    pub fn new(endpoint: Arc<HttpEndpoint>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Transport for PlainSender {
    async fn send(&self, batch: &Batch) -> TransportResult<()> {
        for sample in &batch.samples {
            let value = sample.value.to_string();
            self.endpoint
                .post_plain(&[
                    "update",
                    sample.value.kind().as_str(),
                    sample.name.as_str(),
                    value.as_str(),
                ])
                .await
                .attach_printable_lazy(|| format!("metric: {}", sample.name))?;
        }
        debug!(batch = batch.id, metrics = batch.len(), "plain batch delivered");
        Ok(())
    }
}

/// `POST /update/` with one JSON record per request.
pub struct JsonSender {
    endpoint: Arc<HttpEndpoint>,
}

impl JsonSender {
    pub fn new(endpoint: Arc<HttpEndpoint>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Transport for JsonSender {
    async fn send(&self, batch: &Batch) -> TransportResult<()> {
        for sample in &batch.samples {
            self.endpoint
                .post_json(&["update", ""], &Metrics::from(sample))
                .await
                .attach_printable_lazy(|| format!("metric: {}", sample.name))?;
        }
        debug!(batch = batch.id, metrics = batch.len(), "json batch delivered");
        Ok(())
    }
}

/// `POST /updates/` with the whole batch as a JSON array.
pub struct JsonBatchSender {
    endpoint: Arc<HttpEndpoint>,
}

impl JsonBatchSender {
    pub fn new(endpoint: Arc<HttpEndpoint>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Transport for JsonBatchSender {
    async fn send(&self, batch: &Batch) -> TransportResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.endpoint
            .post_json(&["updates", ""], &batch.to_wire())
            .await?;
        debug!(batch = batch.id, metrics = batch.len(), "json batch delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use metric_types::Sample;
    use similar_asserts::assert_eq;
    use utils::codec::gunzip;
    use wiremock::matchers::header;
    use wiremock::matchers::header_exists;
    use wiremock::matchers::method;
    use wiremock::matchers::path;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;

    use super::*;

    fn endpoint(server: &MockServer, key: Option<&str>) -> Arc<HttpEndpoint> {
        Arc::new(
            HttpEndpoint::new(&server.uri(), key, Duration::from_secs(2))
                .expect("should build endpoint"),
        )
    }

    #[test]
    fn bare_address_gets_http_scheme() {
        let url = base_url("localhost:8080").expect("should parse");
        assert_eq!(url.as_str(), "http://localhost:8080/");
        let url = base_url("https://metrics.example.com").expect("should parse");
        assert_eq!(url.scheme(), "https");
    }

    #[tokio::test]
    async fn plain_sender_posts_each_sample_to_its_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/update/counter/PollCount/5"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/update/gauge/Alloc/1.5"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = PlainSender::new(endpoint(&server, None));
        let batch = Batch::new(
            1,
            vec![Sample::counter("PollCount", 5), Sample::gauge("Alloc", 1.5)],
        );
        sender.send(&batch).await.expect("should deliver");
    }

    #[tokio::test]
    async fn json_batch_sender_gzips_and_signs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/updates/"))
            .and(header("content-encoding", "gzip"))
            .and(header("content-type", "application/json"))
            .and(header_exists(HASH_HEADER))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = JsonBatchSender::new(endpoint(&server, Some("secret")));
        let batch = Batch::new(
            7,
            vec![Sample::counter("PollCount", 3), Sample::gauge("Alloc", 2.0)],
        );
        sender.send(&batch).await.expect("should deliver");

        let requests = server.received_requests().await.expect("should record requests");
        let request = &requests[0];
        let signature = request
            .headers
            .get(HASH_HEADER)
            .and_then(|v| v.to_str().ok())
            .expect("should carry signature");
        assert_eq!(
            Some(signature.to_string()),
            CodecStack::for_key(Some("secret")).sign(&request.body)
        );
        let records: Vec<Metrics> =
            serde_json::from_slice(&gunzip(&request.body).expect("should be gzip"))
                .expect("should be a JSON array");
        assert_eq!(records, batch.to_wire());
    }

    #[tokio::test]
    async fn json_sender_posts_one_record_per_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/update/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let sender = JsonSender::new(endpoint(&server, None));
        let batch = Batch::new(
            1,
            vec![Sample::counter("a", 1), Sample::counter("b", 2)],
        );
        sender.send(&batch).await.expect("should deliver");
    }

    #[tokio::test]
    async fn client_errors_are_rejections_and_server_errors_are_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/update/counter/bad/1"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad metric"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/update/counter/busy/1"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let sender = PlainSender::new(endpoint(&server, None));

        let err = sender
            .send(&Batch::new(1, vec![Sample::counter("bad", 1)]))
            .await
            .expect_err("should be rejected");
        assert!(matches!(err.current_context(), TransportError::Rejected { .. }));
        assert!(!err.current_context().is_retryable());

        let err = sender
            .send(&Batch::new(2, vec![Sample::counter("busy", 1)]))
            .await
            .expect_err("should fail");
        assert!(matches!(err.current_context(), TransportError::Server { .. }));
        assert!(err.current_context().is_retryable());
    }

    #[tokio::test]
    async fn unreachable_server_is_a_network_error() {
        let endpoint = Arc::new(
            HttpEndpoint::new("127.0.0.1:1", None, Duration::from_secs(1))
                .expect("should build endpoint"),
        );
        let err = JsonBatchSender::new(endpoint)
            .send(&Batch::new(1, vec![Sample::counter("a", 1)]))
            .await
            .expect_err("should fail to connect");
        assert!(matches!(
            err.current_context(),
            TransportError::Network { .. } | TransportError::Timeout
        ));
    }
}
