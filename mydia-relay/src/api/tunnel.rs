use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::Response;
use tracing::Instrument as _;

use crate::RelayState;
use crate::tunnel::InstanceTunnel;

/// Upgrade point for the instance control channel.
///
/// Authentication happens after the upgrade, inside the `hello` exchange,
/// so a misconfigured instance still receives a typed error frame.
pub(super) async fn handler(
    State(state): State<RelayState>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |ws| {
        async move {
            let result = InstanceTunnel::builder()
                .ws(ws)
                .state(state)
                .peer_addr(peer_addr)
                .build()
                .run()
                .await;

            if let Err(error) = result {
                warn!(client = %peer_addr, error = format!("{error:#}"), "Tunnel failure");
            }
        }
        .instrument(info_span!("tunnel", client = %peer_addr))
    })
}
