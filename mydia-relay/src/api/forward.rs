use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use mydia_tunnel_proto::{Cancel, Frame, ForwardRequest};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::RelayState;
use crate::http::HttpError;
use crate::pending::TunnelReply;

#[derive(Deserialize)]
pub(crate) struct ForwardRequestBody {
    /// Client-chosen globally unique correlation id.
    pub(crate) request_id: Uuid,
    /// Opaque payload; the relay forwards it without looking inside.
    pub(crate) payload: serde_json::Value,
    /// Optional per-request ceiling, capped by the server's own.
    pub(crate) timeout_seconds: Option<u64>,
}

#[derive(Serialize)]
pub(crate) struct ForwardResponseBody {
    pub(crate) request_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
    /// Reassembled streamed reply, when the instance answered with chunks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) stream_b64: Option<String>,
}

/// Forwards one client request over the instance's live tunnel and blocks
/// for the matching response.
///
/// The waiter is registered *before* the frame is handed to the tunnel so a
/// fast instance cannot answer into the void. The three transient failures
/// stay distinct: `instance_offline` (no tunnel at all), `tunnel_disconnected`
/// (went away mid-flight), `timeout` (tunnel alive but silent).
pub(super) async fn forward_request(
    State(state): State<RelayState>,
    Path(instance_id): Path<Uuid>,
    Json(body): Json<ForwardRequestBody>,
) -> Result<Json<ForwardResponseBody>, HttpError> {
    let conf = state.conf_handle.get_conf();

    let Some(handle) = state.connections.lookup(instance_id) else {
        return Err(HttpError::instance_offline().msg("no live tunnel for this instance"));
    };

    let request_id = body.request_id;

    let Some(mut reply_rx) = state.pendings.register(instance_id, request_id) else {
        return Err(HttpError::validation().msg("request_id is already in flight"));
    };

    let frame = Frame::ForwardRequest(ForwardRequest {
        request_id,
        payload: body.payload,
    });

    if handle.frame_tx.send(frame).is_err() {
        // The tunnel task is tearing down; its fail_all may or may not have
        // seen our registration, so drop it ourselves.
        state.pendings.remove(request_id);
        return Err(HttpError::tunnel_disconnected().msg("tunnel is closing"));
    }

    let ceiling = conf.forward_ceiling;
    let timeout = body
        .timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(ceiling)
        .min(ceiling);
    let deadline = tokio::time::Instant::now() + timeout;

    let mut stream_buf: Vec<u8> = Vec::new();
    let mut next_seq: u64 = 0;

    loop {
        let reply = match tokio::time::timeout_at(deadline, reply_rx.recv()).await {
            Ok(reply) => reply,
            Err(_elapsed) => {
                state.pendings.remove(request_id);
                // Let the instance stop working on an answer nobody awaits.
                let _ = handle.frame_tx.send(Frame::Cancel(Cancel { request_id }));
                return Err(HttpError::timeout().msg("no response within the ceiling"));
            }
        };

        match reply {
            Some(TunnelReply::Response { payload, error }) => {
                return Ok(Json(ForwardResponseBody {
                    request_id,
                    payload,
                    error,
                    stream_b64: None,
                }));
            }
            Some(TunnelReply::StreamChunk { seq, data }) => {
                if seq != next_seq {
                    warn!(%request_id, seq, expected = next_seq, "Out-of-sequence stream chunk");
                }
                next_seq = seq.wrapping_add(1);
                stream_buf.extend_from_slice(&data);
            }
            Some(TunnelReply::StreamEnd) => {
                return Ok(Json(ForwardResponseBody {
                    request_id,
                    payload: None,
                    error: None,
                    stream_b64: Some(BASE64.encode(&stream_buf)),
                }));
            }
            Some(TunnelReply::TunnelDisconnected) => {
                return Err(HttpError::tunnel_disconnected().msg("instance disconnected mid-flight"));
            }
            None => {
                state.pendings.remove(request_id);
                return Err(HttpError::tunnel_disconnected().msg("waiter dropped"));
            }
        }
    }
}
