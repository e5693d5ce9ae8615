use std::sync::Arc;

use poem::http::header::CONTENT_ENCODING;
use poem::http::HeaderName;
use poem::http::HeaderValue;
use poem::http::StatusCode;
use poem::Endpoint;
use poem::IntoResponse;
use poem::Middleware;
use poem::Request;
use poem::Response;
use poem::Result as PoemResult;
use tracing::debug;
use tracing::warn;
use utils::codec::CodecStack;
use utils::codec::HASH_HEADER;

/// Paths whose handlers decode their own payloads.
pub const RPC_PREFIX: &str = "/rpc/";

/// Lowercase form of [`HASH_HEADER`] for header maps.
pub fn hash_header_name() -> HeaderName {
    HeaderName::from_static("hashsha256")
}

pub fn is_gzip(req: &Request) -> bool {
    req.headers()
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
}

pub fn signature(req: &Request) -> Option<String> {
    req.headers()
        .get(HASH_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Verifies and inflates request bodies, and signs response bodies when a key
/// is configured.
pub struct CodecMiddleware {
    codec: Arc<CodecStack>,
}

impl CodecMiddleware {
    pub fn new(codec: Arc<CodecStack>) -> Self {
        Self { codec }
    }
}

impl<E> Middleware<E> for CodecMiddleware
where E: Endpoint
{
    type Output = CodecEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        CodecEndpoint {
            inner: ep,
            codec: self.codec.clone(),
        }
    }
}

pub struct CodecEndpoint<E> {
    inner: E,
    codec: Arc<CodecStack>,
}

impl<E> Endpoint for CodecEndpoint<E>
where E: Endpoint
{
    type Output = Response;

    async fn call(&self, mut req: Request) -> PoemResult<Self::Output> {
        if req.uri().path().starts_with(RPC_PREFIX) {
            return self.inner.call(req).await.map(IntoResponse::into_response);
        }

        let body = req.take_body().into_vec().await?;
        if body.is_empty() {
            req.set_body(body);
        } else {
            let decoded = self
                .codec
                .decode(&body, signature(&req).as_deref(), is_gzip(&req))
                .map_err(|e| {
                    warn!(path = %req.uri().path(), "rejecting request body: {e:?}");
                    poem::Error::from_string(
                        e.current_context().to_string(),
                        StatusCode::BAD_REQUEST,
                    )
                })?;
            req.headers_mut().remove(CONTENT_ENCODING);
            req.set_body(decoded);
        }

        let resp = match self.inner.call(req).await {
            Ok(resp) => resp.into_response(),
            Err(e) => e.into_response(),
        };
        if !self.codec.is_signing() {
            return Ok(resp);
        }
        sign_response(&self.codec, resp).await
    }
}

async fn sign_response(codec: &CodecStack, mut resp: Response) -> PoemResult<Response> {
    let body = resp.take_body().into_vec().await?;
    if let Some(signature) = codec.sign(&body) {
        match HeaderValue::from_str(&signature) {
            Ok(value) => {
                resp.headers_mut().insert(hash_header_name(), value);
            }
            Err(e) => debug!("cannot set response signature header: {e}"),
        }
    }
    resp.set_body(body);
    Ok(resp)
}
