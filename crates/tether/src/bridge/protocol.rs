//! Wire protocol types shared by the coordinator and the worker.
//!
//! One channel per worker, two topics:
//! - **initialize**: handshake sent by the worker right after it connects (no payload)
//! - **json_rpc**: JSON-RPC request/response envelopes, multiplexed by `id`

use std::env::VarError;

use serde::{Deserialize, Serialize};

/// Environment variable carrying the channel id from the coordinator to the worker.
pub const CHANNEL_ID_ENV: &str = "TETHER_CHANNEL_ID";

/// Longest accepted channel id. Keeps socket names within `sun_path` limits.
pub const MAX_CHANNEL_ID_LEN: usize = 100;

const CHANNEL_ID_PREFIX: &str = "tether-ipc-";
const CHANNEL_ID_TAG: &str = "ipc";

/// Configuration errors. Raised before any I/O happens.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("channel id missing: TETHER_CHANNEL_ID is not set")]
    MissingChannelId,

    #[error("invalid channel id {id:?}: {reason}")]
    InvalidChannelId { id: String, reason: &'static str },
}

impl ConfigError {
    fn invalid(id: &str, reason: &'static str) -> Self {
        Self::InvalidChannelId {
            id: id.to_string(),
            reason,
        }
    }
}

/// Name of the channel connecting one coordinator to its worker.
///
/// Generated ids look like `tether-ipc-<uuid>`; anything accepted by
/// [`ChannelId::parse`] may be supplied by an embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

impl ChannelId {
    pub fn generate() -> Self {
        Self(format!(
            "{CHANNEL_ID_PREFIX}{}",
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// Validate a channel id supplied from outside.
    pub fn parse(id: &str) -> Result<Self, ConfigError> {
        if id.is_empty() {
            return Err(ConfigError::invalid(id, "empty"));
        }
        if id.len() > MAX_CHANNEL_ID_LEN {
            return Err(ConfigError::invalid(id, "longer than 100 bytes"));
        }
        if !id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        {
            return Err(ConfigError::invalid(
                id,
                "only ASCII letters, digits, '-', '_' and '.' are allowed",
            ));
        }
        if !id.contains(CHANNEL_ID_TAG) {
            return Err(ConfigError::invalid(id, "does not carry the \"ipc\" tag"));
        }
        Ok(Self(id.to_string()))
    }

    /// Read and validate the channel id handed to a worker by its coordinator.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CHANNEL_ID_ENV) {
            Ok(value) => Self::parse(&value),
            Err(VarError::NotPresent) => Err(ConfigError::MissingChannelId),
            Err(VarError::NotUnicode(raw)) => Err(ConfigError::InvalidChannelId {
                id: raw.to_string_lossy().into_owned(),
                reason: "not valid UTF-8",
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ChannelId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation id of a JSON-RPC request.
///
/// Generated as UUID v4; any string is accepted on decode so that a peer
/// with a different id scheme still round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message on the channel, tagged by topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum Frame {
    /// Handshake. The worker sends it once, immediately after connecting.
    Initialize,

    /// A serialized request or response envelope.
    JsonRpc { data: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid_and_unique() {
        let a = ChannelId::generate();
        let b = ChannelId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("tether-ipc-"));
        assert_eq!(ChannelId::parse(a.as_str()).unwrap(), a);
    }

    #[test]
    fn parse_accepts_foreign_ids_with_tag() {
        assert!(ChannelId::parse("jest-runner-ipc-server-12345").is_ok());
        assert!(ChannelId::parse("ipc").is_ok());
    }

    #[test]
    fn parse_rejects_untagged_id() {
        let err = ChannelId::parse("server-12345").unwrap_err();
        assert!(err.to_string().contains("\"ipc\" tag"), "{err}");
    }

    #[test]
    fn parse_rejects_empty_and_path_like_ids() {
        assert!(ChannelId::parse("").is_err());
        assert!(ChannelId::parse("../ipc").is_err());
        assert!(ChannelId::parse("ipc server").is_err());
    }

    #[test]
    fn parse_rejects_oversized_id() {
        let id = format!("ipc-{}", "x".repeat(MAX_CHANNEL_ID_LEN));
        assert!(matches!(
            ChannelId::parse(&id),
            Err(ConfigError::InvalidChannelId { .. })
        ));
    }

    #[test]
    fn channel_id_deserialize_validates() {
        let ok: Result<ChannelId, _> = serde_json::from_str("\"tether-ipc-abc\"");
        assert!(ok.is_ok());
        let bad: Result<ChannelId, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }

    #[test]
    fn initialize_frame_serializes() {
        insta::assert_json_snapshot!(Frame::Initialize, @r#"
        {
          "topic": "initialize"
        }
        "#);
    }

    #[test]
    fn json_rpc_frame_serializes() {
        let frame = Frame::JsonRpc {
            data: r#"{"jsonrpc":"2.0"}"#.to_string(),
        };
        insta::assert_json_snapshot!(frame, @r#"
        {
          "topic": "json_rpc",
          "data": "{\"jsonrpc\":\"2.0\"}"
        }
        "#);
    }

    #[test]
    fn request_ids_are_uuids() {
        let id = RequestId::new();
        assert!(uuid::Uuid::parse_str(id.as_str()).is_ok());
        assert_ne!(id, RequestId::new());
    }
}
