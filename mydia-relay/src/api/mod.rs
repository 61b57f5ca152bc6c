pub mod claim;
pub mod forward;
pub mod health;
pub mod instances;
pub mod tunnel;

use axum::routing::{get, post, put};
use serde::Serialize;
use time::OffsetDateTime;

use crate::RelayState;
use crate::http::HttpError;
use crate::storage::{InstanceRecord, StorageError};

pub fn make_router<S>(state: RelayState) -> axum::Router<S> {
    axum::Router::new()
        .route("/relay/health", get(health::get_health))
        .route("/relay/instances", post(instances::register_instance))
        .route("/relay/instances/{id}/heartbeat", put(instances::heartbeat))
        .route("/relay/instances/{id}/connect", get(instances::get_connect))
        .route("/relay/instances/{id}/claim", post(claim::create_claim))
        .route("/relay/instances/{id}/claim/consume", post(claim::consume_claim))
        .route("/relay/instances/{id}/forward", post(forward::forward_request))
        .route("/relay/claim/{code}", post(claim::redeem_claim))
        .route("/relay/tunnel", get(tunnel::handler))
        .with_state(state)
}

/// Maps storage outcomes onto the API's error codes.
#[track_caller]
pub(crate) fn storage_error(error: StorageError) -> HttpError {
    match error {
        StorageError::InvalidPublicKey => HttpError::validation().err()(error),
        StorageError::Conflict => HttpError::conflict().err()(error),
        StorageError::NotFound => HttpError::not_found().err()(error),
        StorageError::Expired => HttpError::expired().err()(error),
        StorageError::AlreadyConsumed => HttpError::already_consumed().err()(error),
        StorageError::NotOwner => HttpError::unauthorized().err()(error),
        error @ (StorageError::CodeSpaceExhausted | StorageError::Database { .. } | StorageError::BadRecord { .. }) => {
            HttpError::internal().err()(error)
        }
    }
}

/// The instance record as delivered to pairing clients.
#[derive(Debug, Serialize)]
pub(crate) struct DirectoryRecord {
    pub(crate) instance_id: uuid::Uuid,
    pub(crate) public_key_b64: String,
    pub(crate) direct_urls: Vec<String>,
    pub(crate) online: bool,
}

/// An instance is online only while a tunnel is registered *and* its
/// presence is fresh; either one alone is not enough.
pub(crate) fn effective_online(state: &RelayState, record: &InstanceRecord) -> bool {
    let conf = state.conf_handle.get_conf();
    let fresh = OffsetDateTime::now_utc() - record.last_seen_at <= conf.stale_after;

    state.connections.is_online(record.instance_id) && fresh
}

pub(crate) fn directory_record(state: &RelayState, record: &InstanceRecord) -> DirectoryRecord {
    use base64::Engine as _;

    DirectoryRecord {
        instance_id: record.instance_id,
        public_key_b64: base64::engine::general_purpose::STANDARD.encode(&record.public_key),
        direct_urls: record.direct_urls.clone(),
        online: effective_online(state, record),
    }
}
