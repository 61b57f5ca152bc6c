//! Frame types for the instance control channel.
//!
//! An instance keeps one long-lived bidirectional channel open towards the
//! relay. Every message on that channel is a single [`Frame`], serialized as
//! a JSON object tagged by `type`. The relay never inspects the `payload` of
//! forwarded requests and responses; it only routes them by `request_id`.

use core::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Upper bound enforced on a single encoded frame.
///
/// Anything bigger is a protocol violation and must close the connection.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {size} bytes exceeds the {MAX_FRAME_SIZE}-byte limit")]
    TooBig { size: usize },
    #[error("malformed frame")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

/// A message exchanged on the instance control channel.
///
/// `hello`, `heartbeat`, `response`, `stream_chunk` and `stream_end` travel
/// from the instance to the relay; the remaining kinds travel the other way.
/// Direction is enforced by the state machine on each side, not by the codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum Frame {
    Hello(Hello),
    Welcome(Welcome),
    Heartbeat(Heartbeat),
    Ack,
    ForwardRequest(ForwardRequest),
    Response(Response),
    StreamChunk(StreamChunk),
    StreamEnd(StreamEnd),
    Cancel(Cancel),
    Error(ErrorFrame),
}

impl Frame {
    pub fn encode(&self) -> Result<String, CodecError> {
        let text = serde_json::to_string(self)?;

        if text.len() > MAX_FRAME_SIZE {
            return Err(CodecError::TooBig { size: text.len() });
        }

        Ok(text)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(CodecError::TooBig { size: text.len() });
        }

        let frame = serde_json::from_str(text)?;

        Ok(frame)
    }

    /// Short name used in logs and protocol error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::Welcome(_) => "welcome",
            Frame::Heartbeat(_) => "heartbeat",
            Frame::Ack => "ack",
            Frame::ForwardRequest(_) => "forward_request",
            Frame::Response(_) => "response",
            Frame::StreamChunk(_) => "stream_chunk",
            Frame::StreamEnd(_) => "stream_end",
            Frame::Cancel(_) => "cancel",
            Frame::Error(_) => "error",
        }
    }
}

/// First frame sent by the instance after the channel is established.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub instance_id: Uuid,
    /// Bearer token issued at registration time.
    pub token: String,
    pub supported_versions: Vec<String>,
}

/// Reply to a successful `hello`; the channel is active afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub negotiated_version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub server_time: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Latest direct-reach URLs advertised by the instance, if they changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_urls: Option<Vec<String>>,
}

/// A client request relayed to the instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub request_id: Uuid,
    pub payload: serde_json::Value,
}

/// The instance's reply to a `forward_request`.
///
/// Exactly one of `payload` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One chunk of a streamed reply, ordered by `seq` within a `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub request_id: Uuid,
    pub seq: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnd {
    pub request_id: Uuid,
}

/// Tells the instance a forwarded request is no longer awaited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancel {
    pub request_id: Uuid,
}

/// Typed error frame, sent before the offending side closes the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub message: String,
    /// Set when `code` is `version_incompatible`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_versions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthFailed,
    VersionIncompatible,
    Protocol,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::AuthFailed => write!(f, "auth_failed"),
            ErrorCode::VersionIncompatible => write!(f, "version_incompatible"),
            ErrorCode::Protocol => write!(f, "protocol"),
            ErrorCode::Internal => write!(f, "internal"),
        }
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = <&str>::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_wire_format_is_stable() {
        let frame = Frame::Hello(Hello {
            instance_id: Uuid::nil(),
            token: "t".to_owned(),
            supported_versions: vec!["1.0".to_owned()],
        });

        assert_eq!(
            frame.encode().unwrap(),
            r#"{"type":"hello","instance_id":"00000000-0000-0000-0000-000000000000","token":"t","supported_versions":["1.0"]}"#
        );
    }

    #[test]
    fn ack_is_a_bare_tag() {
        assert_eq!(Frame::Ack.encode().unwrap(), r#"{"type":"ack"}"#);
        assert_eq!(Frame::decode(r#"{"type":"ack"}"#).unwrap(), Frame::Ack);
    }

    #[test]
    fn response_error_variant_decodes() {
        let frame = Frame::decode(r#"{"type":"response","request_id":"6c0f30d3-d7c4-4787-8c5f-c4fa4b6db3f0","error":"boom"}"#)
            .unwrap();

        let Frame::Response(response) = frame else {
            panic!("wrong frame kind");
        };
        assert_eq!(response.payload, None);
        assert_eq!(response.error.as_deref(), Some("boom"));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = Frame::decode(r#"{"type":"subscribe"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Json { .. }));
    }

    #[test]
    fn stream_chunk_data_is_base64_on_the_wire() {
        let frame = Frame::StreamChunk(StreamChunk {
            request_id: Uuid::nil(),
            seq: 3,
            data: b"ok".to_vec(),
        });

        let text = frame.encode().unwrap();
        assert!(text.contains(r#""data":"b2s=""#), "got: {text}");
        assert_eq!(Frame::decode(&text).unwrap(), frame);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let frame = Frame::StreamChunk(StreamChunk {
            request_id: Uuid::nil(),
            seq: 0,
            data: vec![0xAA; MAX_FRAME_SIZE],
        });

        assert!(matches!(frame.encode().unwrap_err(), CodecError::TooBig { .. }));
    }
}
