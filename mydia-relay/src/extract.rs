use axum::RequestPartsExt as _;
use axum::extract::{FromRequestParts, Path};
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use uuid::Uuid;

use crate::RelayState;
use crate::http::HttpError;
use crate::storage::{InstanceRecord, StorageError};
use crate::token;

/// Authenticates the `Authorization: Bearer` token against the instance
/// named by the `{id}` path segment.
///
/// The rejection never reveals whether the instance is unknown or the token
/// is wrong.
pub struct InstanceAuth(pub InstanceRecord);

impl FromRequestParts<RelayState> for InstanceAuth {
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &RelayState) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| HttpError::unauthorized().msg("missing or malformed authorization header"))?;

        let Path(instance_id) = parts
            .extract::<Path<Uuid>>()
            .await
            .map_err(|_| HttpError::validation().msg("instance id is not a valid UUID"))?;

        let record = match state.store.get_instance(instance_id).await {
            Ok(record) => Some(record),
            Err(StorageError::NotFound) => None,
            Err(error) => return Err(HttpError::internal().err()(error)),
        };

        let conf = state.conf_handle.get_conf();

        let authenticated = record
            .as_ref()
            .is_some_and(|record| token::verify_token(&conf.token_secret, bearer.token(), &record.token_digest));

        match (authenticated, record) {
            (true, Some(record)) => Ok(Self(record)),
            _ => Err(HttpError::unauthorized().msg("invalid instance token")),
        }
    }
}
