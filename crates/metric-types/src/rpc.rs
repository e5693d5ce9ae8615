//! Message shapes of the RPC binding.
//!
//! Requests travel through the same codec stack as the HTTP JSON API. Replies
//! always carry a status code instead of relying on HTTP status lines.

use serde::Deserialize;
use serde::Serialize;

use crate::wire::Metrics;

pub const UPDATE_METHOD: &str = "/rpc/metrics.Metrics/Update";
pub const UPDATES_METHOD: &str = "/rpc/metrics.Metrics/Updates";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub metric: Metrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatesRequest {
    pub metrics: Vec<Metrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcCode {
    Ok,
    InvalidArgument,
    NotFound,
    Unauthenticated,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    pub code: RpcCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub metrics: Vec<Metrics>,
}

impl RpcReply {
    pub fn ok(metrics: Vec<Metrics>) -> Self {
        Self {
            code: RpcCode::Ok,
            message: String::new(),
            metrics,
        }
    }

    pub fn error(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            metrics: Vec::new(),
        }
    }
}
