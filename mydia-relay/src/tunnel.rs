//! Server side of an instance's long-lived control channel.
//!
//! One task per connection. The channel speaks [`mydia_tunnel_proto::Frame`]s
//! over a WebSocket: the instance opens with `hello`, gets a `welcome` back,
//! then the channel stays idle except for heartbeats until a client forward
//! needs it. Any malformed or out-of-place frame is fatal; the instance is
//! expected to reconnect with backoff.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use mydia_tunnel_proto::{ErrorCode, ErrorFrame, Frame, Welcome};
use time::OffsetDateTime;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::RelayState;
use crate::pending::TunnelReply;
use crate::registry::ConnectionHandle;
use crate::storage::StorageError;
use crate::{token, version};

/// How long a fresh connection may sit silent before `hello` arrives.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Why the active loop ended; drives the teardown path.
enum CloseReason {
    /// Socket closed or errored, or a protocol violation occurred.
    Gone,
    /// Idle past the heartbeat deadline.
    IdleTimeout,
    /// A newer registration for the same instance took over.
    Displaced,
    /// Service shutdown.
    Shutdown,
}

#[derive(TypedBuilder)]
pub struct InstanceTunnel {
    ws: WebSocket,
    state: RelayState,
    peer_addr: SocketAddr,
}

impl InstanceTunnel {
    #[instrument("tunnel", skip_all, fields(client = %self.peer_addr))]
    pub async fn run(self) -> anyhow::Result<()> {
        let Self { ws, state, peer_addr: _ } = self;
        let conf = state.conf_handle.get_conf();

        let (mut ws_tx, mut ws_rx) = ws.split();

        // ----- awaiting_hello ----- //

        let hello = match tokio::time::timeout(HELLO_TIMEOUT, recv_frame(&mut ws_rx)).await {
            Ok(Ok(Some(Frame::Hello(hello)))) => hello,
            Ok(Ok(Some(frame))) => {
                send_error(&mut ws_tx, ErrorCode::Protocol, "expected hello", None).await;
                anyhow::bail!("expected hello, got {}", frame.kind());
            }
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(error)) => {
                send_error(&mut ws_tx, ErrorCode::Protocol, "malformed frame", None).await;
                return Err(error.context("awaiting hello"));
            }
            Err(_elapsed) => {
                send_error(&mut ws_tx, ErrorCode::Protocol, "hello timed out", None).await;
                anyhow::bail!("no hello within {HELLO_TIMEOUT:?}");
            }
        };

        let instance_id = hello.instance_id;

        // Token check; a single opaque failure whether the instance is
        // unknown or the token is wrong.
        let authenticated = match state.store.get_instance(instance_id).await {
            Ok(record) => token::verify_token(&conf.token_secret, &hello.token, &record.token_digest),
            Err(StorageError::NotFound) => false,
            Err(error) => {
                send_error(&mut ws_tx, ErrorCode::Internal, "internal error", None).await;
                return Err(anyhow::Error::new(error).context("instance lookup"));
            }
        };

        if !authenticated {
            warn!(%instance_id, "Tunnel authentication failed");
            send_error(&mut ws_tx, ErrorCode::AuthFailed, "authentication failed", None).await;
            return Ok(());
        }

        let negotiated_version = match version::negotiate(&hello.supported_versions) {
            Ok(negotiated_version) => negotiated_version,
            Err(_) => {
                info!(
                    %instance_id,
                    remote_versions = ?hello.supported_versions,
                    "Tunnel version negotiation failed",
                );
                send_error(
                    &mut ws_tx,
                    ErrorCode::VersionIncompatible,
                    "no compatible protocol version",
                    Some(version::SUPPORTED_VERSIONS.iter().map(|&v| v.to_owned()).collect()),
                )
                .await;
                return Ok(());
            }
        };

        send_frame(
            &mut ws_tx,
            &Frame::Welcome(Welcome {
                negotiated_version: negotiated_version.clone(),
                server_time: OffsetDateTime::now_utc(),
            }),
        )
        .await
        .context("sending welcome")?;

        // ----- active ----- //

        let (handle, mut frame_rx) = ConnectionHandle::new(negotiated_version);
        let connection_id = handle.connection_id;
        let notify_close = handle.notify_close.clone();

        if let Some(displaced) = state.connections.register(instance_id, handle) {
            let failed_count = state.pendings.fail_all(instance_id);
            debug!(%instance_id, failed_count, "Displaced a previous tunnel");
            displaced.notify_close.notify_waiters();
        }

        if let Err(error) = state.store.set_online(instance_id, true).await {
            warn!(%instance_id, error = format!("{error:#}"), "Couldn't mark instance online");
        }

        info!(%instance_id, %connection_id, "Instance tunnel active");

        let idle = tokio::time::sleep(conf.tunnel_idle_timeout);
        tokio::pin!(idle);

        let displaced = notify_close.notified();
        tokio::pin!(displaced);

        let mut shutdown_signal = state.shutdown_signal.clone();

        let reason = loop {
            tokio::select! {
                message = ws_rx.next() => {
                    // Any frame counts as liveness.
                    idle.as_mut().reset(tokio::time::Instant::now() + conf.tunnel_idle_timeout);

                    match decode_message(message) {
                        Ok(Decoded::Frame(frame)) => {
                            if let Err(error) = handle_frame(&state, &mut ws_tx, instance_id, frame).await {
                                warn!(%instance_id, error = format!("{error:#}"), "Fatal frame on tunnel");
                                break CloseReason::Gone;
                            }
                        }
                        Ok(Decoded::Ignored) => {}
                        Ok(Decoded::Closed) => break CloseReason::Gone,
                        Err(error) => {
                            debug!(%instance_id, error = format!("{error:#}"), "Protocol violation");
                            send_error(&mut ws_tx, ErrorCode::Protocol, "protocol violation", None).await;
                            break CloseReason::Gone;
                        }
                    }
                }
                outbound = frame_rx.recv() => {
                    match outbound {
                        Some(frame) => {
                            if let Err(error) = send_frame(&mut ws_tx, &frame).await {
                                debug!(%instance_id, error = format!("{error:#}"), "Couldn't write to tunnel");
                                break CloseReason::Gone;
                            }
                        }
                        // All senders gone would mean the registry entry was
                        // dropped; treat like a displacement.
                        None => break CloseReason::Displaced,
                    }
                }
                () = &mut idle => break CloseReason::IdleTimeout,
                () = &mut displaced => break CloseReason::Displaced,
                _ = shutdown_signal.wait() => break CloseReason::Shutdown,
            }
        };

        // ----- closing ----- //

        match reason {
            CloseReason::Displaced => {
                // The replacement already failed our pending requests and
                // owns the registry entry now.
                debug!(%instance_id, "Tunnel displaced by a newer registration");
            }
            reason => {
                if matches!(reason, CloseReason::IdleTimeout) {
                    info!(%instance_id, "Tunnel idle past the heartbeat deadline");
                }

                // Fail waiters first so they observe tunnel_disconnected,
                // not a timeout, then drop presence if we are still current.
                let failed_count = state.pendings.fail_all(instance_id);
                if failed_count > 0 {
                    debug!(%instance_id, failed_count, "Failed in-flight requests");
                }

                if state.connections.unregister(instance_id, connection_id) {
                    if let Err(error) = state.store.mark_offline(instance_id).await {
                        warn!(%instance_id, error = format!("{error:#}"), "Couldn't mark instance offline");
                    }
                }
            }
        }

        let _ = ws_tx.send(Message::Close(None)).await;

        info!(%instance_id, "Instance tunnel closed");

        Ok(())
    }
}

/// One inbound frame while active; `Err` is fatal to the connection.
async fn handle_frame(
    state: &RelayState,
    ws_tx: &mut WsSink,
    instance_id: Uuid,
    frame: Frame,
) -> anyhow::Result<()> {
    match frame {
        Frame::Heartbeat(heartbeat) => {
            state
                .store
                .heartbeat(instance_id, heartbeat.direct_urls.as_deref())
                .await
                .context("heartbeat")?;

            send_frame(ws_tx, &Frame::Ack).await.context("sending ack")?;
        }
        Frame::Response(response) => {
            let delivered = state.pendings.resolve(
                response.request_id,
                TunnelReply::Response {
                    payload: response.payload,
                    error: response.error,
                },
            );

            if !delivered {
                trace!(request_id = %response.request_id, "Late or duplicate response dropped");
            }
        }
        Frame::StreamChunk(chunk) => {
            state.pendings.resolve(
                chunk.request_id,
                TunnelReply::StreamChunk {
                    seq: chunk.seq,
                    data: chunk.data,
                },
            );
        }
        Frame::StreamEnd(end) => {
            state.pendings.resolve(end.request_id, TunnelReply::StreamEnd);
        }
        Frame::Error(error) => {
            warn!(%instance_id, code = %error.code, message = %error.message, "Error frame from instance");
            anyhow::bail!("instance reported a fatal error");
        }
        frame => {
            send_error(ws_tx, ErrorCode::Protocol, "unexpected frame", None).await;
            anyhow::bail!("unexpected {} frame on an active tunnel", frame.kind());
        }
    }

    Ok(())
}

/// Outcome of reading one WebSocket message.
enum Decoded {
    Frame(Frame),
    /// Ping/pong keepalive; nothing to process.
    Ignored,
    Closed,
}

/// Reads the next frame; `None` on normal closure.
async fn recv_frame(ws_rx: &mut WsStream) -> anyhow::Result<Option<Frame>> {
    loop {
        match decode_message(ws_rx.next().await)? {
            Decoded::Frame(frame) => return Ok(Some(frame)),
            Decoded::Ignored => continue,
            Decoded::Closed => return Ok(None),
        }
    }
}

fn decode_message(message: Option<Result<Message, axum::Error>>) -> anyhow::Result<Decoded> {
    match message {
        Some(Ok(Message::Text(text))) => {
            let frame = Frame::decode(text.as_str()).context("malformed frame")?;
            Ok(Decoded::Frame(frame))
        }
        Some(Ok(Message::Binary(_))) => anyhow::bail!("unexpected binary message"),
        Some(Ok(Message::Ping(_) | Message::Pong(_))) => Ok(Decoded::Ignored),
        Some(Ok(Message::Close(_))) => Ok(Decoded::Closed),
        Some(Err(error)) => Err(anyhow::Error::new(error).context("websocket receive")),
        None => Ok(Decoded::Closed),
    }
}

async fn send_frame(ws_tx: &mut WsSink, frame: &Frame) -> anyhow::Result<()> {
    let text = frame.encode().context("frame encoding")?;

    ws_tx.send(Message::Text(text.into())).await.context("websocket send")?;

    Ok(())
}

/// Best effort: the peer may already be gone.
async fn send_error(ws_tx: &mut WsSink, code: ErrorCode, message: &str, supported_versions: Option<Vec<String>>) {
    let frame = Frame::Error(ErrorFrame {
        code,
        message: message.to_owned(),
        supported_versions,
    });

    if let Ok(text) = frame.encode() {
        let _ = ws_tx.send(Message::Text(text.into())).await;
    }

    let _ = ws_tx.send(Message::Close(None)).await;
}
