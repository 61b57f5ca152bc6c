use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::RelayState;

#[derive(Serialize)]
pub(crate) struct Health {
    /// This relay's hostname.
    hostname: String,
    /// Relay service version.
    version: &'static str,
    /// Number of instances with a live control channel.
    connected_instances: usize,
    /// Number of forwarded requests currently awaiting a response.
    pending_requests: usize,
}

/// Liveness endpoint; unauthenticated on purpose.
pub(super) async fn get_health(
    State(RelayState {
        conf_handle,
        connections,
        pendings,
        ..
    }): State<RelayState>,
) -> Json<Health> {
    let conf = conf_handle.get_conf();

    Json(Health {
        hostname: conf.hostname.clone(),
        version: env!("CARGO_PKG_VERSION"),
        connected_instances: connections.count(),
        pending_requests: pendings.count(),
    })
}
