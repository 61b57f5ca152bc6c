use axum::Json;
use axum::extract::{Path, State};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::RelayState;
use crate::api::{DirectoryRecord, directory_record, storage_error};
use crate::extract::InstanceAuth;
use crate::http::HttpError;
use crate::storage::X25519_KEY_LEN;
use crate::token;

#[derive(Deserialize)]
pub(crate) struct RegisterRequest {
    pub(crate) instance_id: Uuid,
    /// Base64 of the instance's 32-byte X25519 static public key.
    pub(crate) public_key_b64: String,
    #[serde(default)]
    pub(crate) direct_urls: Vec<String>,
}

#[derive(Serialize)]
pub(crate) struct RegisterResponse {
    pub(crate) instance_id: Uuid,
    /// Bearer token for every authenticated call; shown exactly once.
    pub(crate) token: String,
}

/// Registers an instance (idempotent for a matching public key) and issues
/// a fresh bearer token.
pub(super) async fn register_instance(
    State(state): State<RelayState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, HttpError> {
    let public_key = BASE64
        .decode(body.public_key_b64.as_bytes())
        .map_err(|_| HttpError::validation().msg("public_key_b64 is not valid base64"))?;

    if public_key.len() != X25519_KEY_LEN {
        return Err(HttpError::validation().msg("public key must be exactly 32 bytes"));
    }

    let conf = state.conf_handle.get_conf();

    let bearer_token = token::generate_token();
    let token_digest = token::token_digest(&conf.token_secret, &bearer_token);

    let record = state
        .store
        .register_instance(body.instance_id, &public_key, &body.direct_urls, &token_digest)
        .await
        .map_err(storage_error)?;

    info!(instance_id = %record.instance_id, "Instance registered");

    Ok(Json(RegisterResponse {
        instance_id: record.instance_id,
        token: bearer_token,
    }))
}

#[derive(Deserialize, Default)]
pub(crate) struct HeartbeatRequest {
    #[serde(default)]
    pub(crate) direct_urls: Option<Vec<String>>,
}

#[derive(Serialize)]
pub(crate) struct HeartbeatResponse {
    pub(crate) status: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) last_seen_at: OffsetDateTime,
}

/// Refreshes the instance's presence over the HTTP surface.
///
/// Instances holding a live tunnel normally heartbeat there instead; this
/// route keeps presence alive across tunnel reconnections.
pub(super) async fn heartbeat(
    State(state): State<RelayState>,
    InstanceAuth(record): InstanceAuth,
    body: Option<Json<HeartbeatRequest>>,
) -> Result<Json<HeartbeatResponse>, HttpError> {
    let direct_urls = body.and_then(|Json(body)| body.direct_urls);

    let record = state
        .store
        .heartbeat(record.instance_id, direct_urls.as_deref())
        .await
        .map_err(storage_error)?;

    Ok(Json(HeartbeatResponse {
        status: "ok",
        last_seen_at: record.last_seen_at,
    }))
}

/// Directory record for a known instance; used by paired clients to find
/// their way back after a restart.
pub(super) async fn get_connect(
    State(state): State<RelayState>,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<DirectoryRecord>, HttpError> {
    let record = state.store.get_instance(instance_id).await.map_err(storage_error)?;

    Ok(Json(directory_record(&state, &record)))
}
