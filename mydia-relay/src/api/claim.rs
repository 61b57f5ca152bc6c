use std::net::SocketAddr;
use std::time::Duration;

use axum::Json;
use axum::extract::{ConnectInfo, Path, State};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::RelayState;
use crate::api::{directory_record, storage_error};
use crate::extract::InstanceAuth;
use crate::http::HttpError;

#[derive(Deserialize)]
pub(crate) struct CreateClaimRequest {
    /// Opaque end-user id inside the instance's own account system.
    pub(crate) user_id: String,
    pub(crate) ttl_seconds: Option<u64>,
}

#[derive(Serialize)]
pub(crate) struct CreateClaimResponse {
    pub(crate) claim_id: Uuid,
    pub(crate) code: String,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) expires_at: OffsetDateTime,
    /// Epoch-rotated name both sides use on the discovery substrate.
    /// Only the relay can derive it; the master pepper never leaves the
    /// process.
    pub(crate) rendezvous_namespace: String,
}

/// Mints a single-use pairing code for one of the instance's users.
pub(super) async fn create_claim(
    State(state): State<RelayState>,
    InstanceAuth(record): InstanceAuth,
    Json(body): Json<CreateClaimRequest>,
) -> Result<Json<CreateClaimResponse>, HttpError> {
    if body.user_id.is_empty() {
        return Err(HttpError::validation().msg("user_id must not be empty"));
    }

    let conf = state.conf_handle.get_conf();

    let ttl = match body.ttl_seconds {
        Some(0) => return Err(HttpError::validation().msg("ttl_seconds must be positive")),
        Some(seconds) => Duration::from_secs(seconds).min(conf.claim_ttl_max),
        None => conf.claim_ttl_default,
    };

    let claim = state
        .store
        .create_claim(record.instance_id, &body.user_id, ttl)
        .await
        .map_err(storage_error)?;

    info!(instance_id = %record.instance_id, claim_id = %claim.id, "Claim created");

    let rendezvous_namespace = state.namespace.derive(&claim.code);

    Ok(Json(CreateClaimResponse {
        claim_id: claim.id,
        code: claim.code,
        expires_at: claim.expires_at,
        rendezvous_namespace,
    }))
}

#[derive(Serialize)]
pub(crate) struct RedeemResponse {
    #[serde(flatten)]
    pub(crate) instance: crate::api::DirectoryRecord,
    pub(crate) user_id: String,
    /// Same namespace the owning instance received at claim creation.
    pub(crate) rendezvous_namespace: String,
}

/// Resolves a claim code to the owning instance's directory record.
///
/// This is a *read*: the claim stays redeemable until the instance confirms
/// the pairing with a consume. Unauthenticated, so it is the one route with
/// its own per-IP rate limit.
pub(super) async fn redeem_claim(
    State(state): State<RelayState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    Path(code): Path<String>,
) -> Result<Json<RedeemResponse>, HttpError> {
    if !state.redeem_limiter.check(peer_addr.ip()) {
        return Err(HttpError::rate_limited().msg("too many redeem attempts"));
    }

    if !(6..=12).contains(&code.trim().len()) {
        return Err(HttpError::validation().msg("claim code must be 6 to 12 characters"));
    }

    let claim = state.store.redeem_claim(&code).await.map_err(storage_error)?;

    let record = state
        .store
        .get_instance(claim.instance_id)
        .await
        .map_err(|error| HttpError::internal().err()(error))?;

    debug!(instance_id = %record.instance_id, claim_id = %claim.id, "Claim redeemed");

    Ok(Json(RedeemResponse {
        instance: directory_record(&state, &record),
        user_id: claim.user_id,
        rendezvous_namespace: state.namespace.derive(&claim.code),
    }))
}

#[derive(Deserialize)]
pub(crate) struct ConsumeClaimRequest {
    pub(crate) claim_id: Uuid,
    /// Device identifier assigned by the instance during pairing.
    pub(crate) device_id: String,
}

#[derive(Serialize)]
pub(crate) struct ConsumeClaimResponse {
    pub(crate) status: &'static str,
}

/// Terminal step of the pairing dance; succeeds at most once per claim.
pub(super) async fn consume_claim(
    State(state): State<RelayState>,
    InstanceAuth(record): InstanceAuth,
    Json(body): Json<ConsumeClaimRequest>,
) -> Result<Json<ConsumeClaimResponse>, HttpError> {
    if body.device_id.is_empty() {
        return Err(HttpError::validation().msg("device_id must not be empty"));
    }

    state
        .store
        .consume_claim(record.instance_id, body.claim_id, &body.device_id)
        .await
        .map_err(storage_error)?;

    info!(instance_id = %record.instance_id, claim_id = %body.claim_id, "Claim consumed");

    Ok(Json(ConsumeClaimResponse { status: "consumed" }))
}
