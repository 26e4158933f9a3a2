//! JSON-RPC 2.0 envelopes carried on the `json_rpc` topic.
//!
//! Requests carry `method`, positional `params` and a fresh `id`. Responses
//! echo the `id` and carry exactly one of `result` or `error`.
//!
//! Payloads are pruned before they are written: containers nested deeper than
//! [`MAX_PAYLOAD_DEPTH`] are replaced with `null`, so the peer's decoder never
//! trips over serde_json's recursion limit. A `serde_json::Value` owns its
//! children, so reference cycles cannot reach this layer.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::protocol::RequestId;

pub const JSONRPC_VERSION: &str = "2.0";

/// Deepest container nesting kept in params and results.
pub const MAX_PAYLOAD_DEPTH: usize = 64;

/// Error code for failures raised by a method (or a non-error value it threw).
pub const METHOD_FAILED: i64 = 1;

/// JSON-RPC code for a method missing from the worker's table.
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported protocol version {0:?}")]
    Version(String),

    #[error("response {0} carries both result and error")]
    Ambiguous(RequestId),

    #[error("response {0} carries neither result nor error")]
    Empty(RequestId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    pub id: RequestId,
}

/// Structured error delivered to the caller of a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl RemoteError {
    pub fn method_failed(message: impl Into<String>, data: Option<String>) -> Self {
        Self {
            code: METHOD_FAILED,
            message: message.into(),
            data,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("method not found: {method}"),
            data: None,
        }
    }

    pub fn is_method_not_found(&self) -> bool {
        self.code == METHOD_NOT_FOUND
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.code, self.message)?;
        if let Some(ref data) = self.data {
            write!(f, "\n{data}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

/// A non-error value raised by a method.
///
/// Encoded as `{code: 1, message: <value as JSON>}` without `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrownValue(pub Value);

impl std::fmt::Display for ThrownValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ThrownValue {}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(RemoteError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Outcome,
}

#[derive(Serialize)]
struct WireResponse<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a RemoteError>,
    id: &'a RequestId,
}

#[derive(Deserialize)]
struct RawResponse {
    jsonrpc: String,
    id: RequestId,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RemoteError>,
}

/// Distinguishes `"result": null` (a value) from a missing `result` key.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// Build a request with a fresh id. Returns the id and the serialized envelope.
pub fn encode_request(
    method: &str,
    params: Vec<Value>,
) -> Result<(RequestId, String), serde_json::Error> {
    let id = RequestId::new();
    let params = params
        .into_iter()
        .map(|p| prune(p, MAX_PAYLOAD_DEPTH - 1))
        .collect();
    let request = Request {
        jsonrpc: JSONRPC_VERSION.to_string(),
        method: method.to_string(),
        params,
        id: id.clone(),
    };
    let json = serde_json::to_string(&request)?;
    Ok((id, json))
}

pub fn decode_request(json: &str) -> Result<Request, ProtocolError> {
    let request: Request = serde_json::from_str(json)?;
    check_version(&request.jsonrpc)?;
    Ok(request)
}

pub fn encode_result(result: Value, id: &RequestId) -> Result<String, serde_json::Error> {
    let result = prune(result, MAX_PAYLOAD_DEPTH);
    serde_json::to_string(&WireResponse {
        jsonrpc: JSONRPC_VERSION,
        result: Some(&result),
        error: None,
        id,
    })
}

/// Capture a method failure as an error envelope.
///
/// The message is the error's display form; `data` carries the debug form,
/// which includes the cause chain (and a backtrace when one was captured).
pub fn encode_error(error: &anyhow::Error, id: &RequestId) -> Result<String, serde_json::Error> {
    let remote = match error.downcast_ref::<ThrownValue>() {
        Some(thrown) => RemoteError::method_failed(thrown.to_string(), None),
        None => RemoteError::method_failed(error.to_string(), Some(format!("{error:?}"))),
    };
    encode_remote_error(&remote, id)
}

pub fn encode_remote_error(error: &RemoteError, id: &RequestId) -> Result<String, serde_json::Error> {
    serde_json::to_string(&WireResponse {
        jsonrpc: JSONRPC_VERSION,
        result: None,
        error: Some(error),
        id,
    })
}

pub fn decode_response(json: &str) -> Result<Response, ProtocolError> {
    let raw: RawResponse = serde_json::from_str(json)?;
    check_version(&raw.jsonrpc)?;
    let outcome = match (raw.result, raw.error) {
        (Some(result), None) => Outcome::Result(result),
        (None, Some(error)) => Outcome::Error(error),
        (Some(_), Some(_)) => return Err(ProtocolError::Ambiguous(raw.id)),
        (None, None) => return Err(ProtocolError::Empty(raw.id)),
    };
    Ok(Response {
        id: raw.id,
        outcome,
    })
}

fn check_version(version: &str) -> Result<(), ProtocolError> {
    if version == JSONRPC_VERSION {
        Ok(())
    } else {
        Err(ProtocolError::Version(version.to_string()))
    }
}

/// Replace containers below `depth` remaining levels with `null`.
fn prune(value: Value, depth: usize) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) if depth == 0 => {
            tracing::debug!(
                max_depth = MAX_PAYLOAD_DEPTH,
                "Omitting payload nested past max depth"
            );
            Value::Null
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| prune(v, depth - 1)).collect())
        }
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, prune(v, depth - 1)))
                .collect(),
        ),
        scalar => scalar,
    }
}
