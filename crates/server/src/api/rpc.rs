//! `metrics.Metrics` RPC methods.
//!
//! Requests are codec-encoded JSON bodies. Every reply is HTTP 200 with the
//! outcome carried in [`RpcReply::code`].

use std::sync::Arc;

use metric_types::rpc::RpcCode;
use metric_types::rpc::RpcReply;
use metric_types::rpc::UpdateRequest;
use metric_types::rpc::UpdatesRequest;
use poem::handler;
use poem::web::Data;
use poem::web::Json;
use poem::Request;
use serde::de::DeserializeOwned;
use tracing::warn;
use utils::codec::CodecStack;

use super::errors::rpc_code_of;
use super::middleware::is_gzip;
use super::middleware::signature;
use crate::aggregator::Aggregator;

fn decode_request<T: DeserializeOwned>(
    req: &Request,
    body: &[u8],
    codec: &CodecStack,
) -> Result<T, RpcReply> {
    let decoded = codec
        .decode(body, signature(req).as_deref(), is_gzip(req))
        .map_err(|e| {
            warn!(method = %req.uri().path(), "rejecting rpc payload: {e:?}");
            RpcReply::error(RpcCode::Unauthenticated, e.current_context().to_string())
        })?;
    serde_json::from_slice(&decoded)
        .map_err(|e| RpcReply::error(RpcCode::InvalidArgument, format!("malformed request: {e}")))
}

fn failure(report: error_stack::Report<storage::StoreError>) -> RpcReply {
    let code = rpc_code_of(report.current_context());
    if code == RpcCode::Internal {
        warn!("rpc store operation failed: {report:?}");
        return RpcReply::error(code, "internal storage error");
    }
    RpcReply::error(code, report.current_context().to_string())
}

#[handler]
pub async fn update(
    req: &Request,
    body: Vec<u8>,
    Data(aggregator): Data<&Aggregator>,
    Data(codec): Data<&Arc<CodecStack>>,
) -> Json<RpcReply> {
    let request: UpdateRequest = match decode_request(req, &body, codec) {
        Ok(request) => request,
        Err(reply) => return Json(reply),
    };
    match aggregator.update(request.metric).await {
        Ok(merged) => Json(RpcReply::ok(vec![merged])),
        Err(report) => Json(failure(report)),
    }
}

#[handler]
pub async fn updates(
    req: &Request,
    body: Vec<u8>,
    Data(aggregator): Data<&Aggregator>,
    Data(codec): Data<&Arc<CodecStack>>,
) -> Json<RpcReply> {
    let request: UpdatesRequest = match decode_request(req, &body, codec) {
        Ok(request) => request,
        Err(reply) => return Json(reply),
    };
    match aggregator.update_batch(request.metrics).await {
        Ok(merged) => Json(RpcReply::ok(merged)),
        Err(report) => Json(failure(report)),
    }
}
