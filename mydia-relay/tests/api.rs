#![allow(unused_crate_dependencies)]
#![allow(clippy::unwrap_used)]

//! Integration tests for the relay HTTP surface.
//!
//! ## Scope
//!
//! These tests drive the axum router in-process with an in-memory database:
//! - `POST /relay/instances` (register, idempotency, conflicts)
//! - `PUT  /relay/instances/:id/heartbeat` (bearer auth)
//! - `POST /relay/instances/:id/claim` → `POST /relay/claim/:code` →
//!   `POST /relay/instances/:id/claim/consume` (the pairing path)
//! - `POST /relay/instances/:id/forward` (round trip, offline, disconnect)
//!
//! The tunnel protocol itself is not exercised here (it needs a WebSocket
//! peer); forwards talk to a hand-registered connection handle instead.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{self, Request, StatusCode};
use http_body_util::BodyExt as _;
use mydia_relay::RelayState;
use mydia_relay::config::ConfHandle;
use mydia_relay::namespace::NamespaceDeriver;
use mydia_relay::pending::{PendingRequests, TunnelReply};
use mydia_relay::ratelimit::RedeemRateLimiter;
use mydia_relay::registry::{ConnectionHandle, ConnectionRegistry};
use mydia_relay::storage::RelayStore;
use mydia_relay::task::ShutdownHandle;
use mydia_tunnel_proto::Frame;
use serde_json::{Value, json};
use tower::ServiceExt as _;
use uuid::Uuid;

const CONFIG: &str = r#"{
    "Listeners": [{ "InternalUrl": "http://*:10256", "ExternalUrl": "http://*:10256" }],
    "MasterPepper": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=",
    "TokenSecret": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="
}"#;

/// 32 zero bytes, base64.
const PUBLIC_KEY_B64: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

struct TestApp {
    app: Router,
    state: RelayState,
    _shutdown_handle: ShutdownHandle,
}

async fn test_app() -> TestApp {
    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

    let conf_handle = ConfHandle::mock(CONFIG).unwrap();
    let conf = conf_handle.get_conf();

    let state = RelayState {
        conf_handle,
        store: RelayStore::in_memory().await.unwrap(),
        connections: ConnectionRegistry::new(),
        pendings: PendingRequests::new(),
        redeem_limiter: RedeemRateLimiter::new(1000),
        namespace: Arc::new(NamespaceDeriver::new(conf.master_pepper.clone())),
        shutdown_signal,
    };

    let app = mydia_relay::api::make_router(state.clone())
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

    TestApp {
        app,
        state,
        _shutdown_handle: shutdown_handle,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };

    (status, body)
}

fn post_json(uri: &str, bearer: Option<&str>, body: Value) -> Request<Body> {
    request_json(http::Method::POST, uri, bearer, body)
}

fn request_json(method: http::Method, uri: &str, bearer: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json");

    if let Some(token) = bearer {
        builder = builder.header(http::header::AUTHORIZATION, format!("Bearer {token}"));
    }

    builder.body(Body::from(body.to_string())).unwrap()
}

async fn register_instance(app: &Router, instance_id: Uuid) -> String {
    let (status, body) = send(
        app,
        post_json(
            "/relay/instances",
            None,
            json!({
                "instance_id": instance_id,
                "public_key_b64": PUBLIC_KEY_B64,
                "direct_urls": ["https://host:4443"],
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "register failed: {body}");
    assert_eq!(body["instance_id"], json!(instance_id));

    body["token"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn register_then_heartbeat() {
    let TestApp { app, .. } = test_app().await;
    let instance_id = Uuid::new_v4();

    let token = register_instance(&app, instance_id).await;

    let (status, body) = send(
        &app,
        request_json(
            http::Method::PUT,
            &format!("/relay/instances/{instance_id}/heartbeat"),
            Some(&token),
            json!({}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
}

#[tokio::test]
async fn register_twice_returns_fresh_tokens() {
    let TestApp { app, .. } = test_app().await;
    let instance_id = Uuid::new_v4();

    let first_token = register_instance(&app, instance_id).await;
    let second_token = register_instance(&app, instance_id).await;

    assert_ne!(first_token, second_token);

    // Only the newest token authenticates.
    let (status, _) = send(
        &app,
        request_json(
            http::Method::PUT,
            &format!("/relay/instances/{instance_id}/heartbeat"),
            Some(&first_token),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        request_json(
            http::Method::PUT,
            &format!("/relay/instances/{instance_id}/heartbeat"),
            Some(&second_token),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn register_with_another_key_is_a_conflict() {
    let TestApp { app, .. } = test_app().await;
    let instance_id = Uuid::new_v4();

    register_instance(&app, instance_id).await;

    let (status, body) = send(
        &app,
        post_json(
            "/relay/instances",
            None,
            json!({
                "instance_id": instance_id,
                // 32 bytes of 0x01 instead of zeros.
                "public_key_b64": "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=",
                "direct_urls": [],
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], json!("conflict"));
}

#[tokio::test]
async fn register_rejects_a_short_public_key() {
    let TestApp { app, .. } = test_app().await;

    let (status, body) = send(
        &app,
        post_json(
            "/relay/instances",
            None,
            json!({
                "instance_id": Uuid::new_v4(),
                "public_key_b64": "c2hvcnQ=",
                "direct_urls": [],
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], json!("validation"));
}

#[tokio::test]
async fn heartbeat_requires_the_bearer_token() {
    let TestApp { app, .. } = test_app().await;
    let instance_id = Uuid::new_v4();

    register_instance(&app, instance_id).await;

    let (status, body) = send(
        &app,
        request_json(
            http::Method::PUT,
            &format!("/relay/instances/{instance_id}/heartbeat"),
            Some("not-the-token"),
            json!({}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_code"], json!("unauthorized"));
}

#[tokio::test]
async fn pairing_path_create_redeem_consume() {
    let TestApp { app, .. } = test_app().await;
    let instance_id = Uuid::new_v4();

    let token = register_instance(&app, instance_id).await;

    // Instance mints a claim for user u1.
    let (status, created) = send(
        &app,
        post_json(
            &format!("/relay/instances/{instance_id}/claim"),
            Some(&token),
            json!({"user_id": "u1", "ttl_seconds": 300}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "create claim failed: {created}");
    let code = created["code"].as_str().unwrap().to_owned();
    let claim_id = created["claim_id"].as_str().unwrap().to_owned();
    assert!(created["rendezvous_namespace"]
        .as_str()
        .unwrap()
        .starts_with("mydia-claim:"));

    // Client redeems the code (case-insensitively) — an idempotent read.
    for attempt in 0..2 {
        let (status, redeemed) = send(
            &app,
            post_json(&format!("/relay/claim/{}", code.to_ascii_lowercase()), None, json!({})),
        )
        .await;

        assert_eq!(status, StatusCode::OK, "redeem attempt {attempt} failed");
        assert_eq!(redeemed["instance_id"], json!(instance_id));
        assert_eq!(redeemed["user_id"], json!("u1"));
        assert_eq!(redeemed["public_key_b64"], json!(PUBLIC_KEY_B64));
        assert_eq!(redeemed["direct_urls"], json!(["https://host:4443"]));
        // No live tunnel in this test.
        assert_eq!(redeemed["online"], json!(false));
    }

    // The instance finalizes the pairing.
    let (status, consumed) = send(
        &app,
        post_json(
            &format!("/relay/instances/{instance_id}/claim/consume"),
            Some(&token),
            json!({"claim_id": claim_id, "device_id": "d1"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(consumed["status"], json!("consumed"));

    // Consume is terminal.
    let (status, body) = send(
        &app,
        post_json(
            &format!("/relay/instances/{instance_id}/claim/consume"),
            Some(&token),
            json!({"claim_id": claim_id, "device_id": "d1"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], json!("already_consumed"));

    // And so is the code.
    let (status, body) = send(&app, post_json(&format!("/relay/claim/{code}"), None, json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error_code"], json!("already_consumed"));
}

#[tokio::test]
async fn unknown_claim_code_is_not_found() {
    let TestApp { app, .. } = test_app().await;

    let (status, body) = send(&app, post_json("/relay/claim/ZZZZZZZZ", None, json!({}))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], json!("not_found"));
}

#[tokio::test]
async fn forward_without_a_tunnel_is_instance_offline() {
    let TestApp { app, .. } = test_app().await;
    let instance_id = Uuid::new_v4();

    register_instance(&app, instance_id).await;

    let (status, body) = send(
        &app,
        post_json(
            &format!("/relay/instances/{instance_id}/forward"),
            None,
            json!({"request_id": Uuid::new_v4(), "payload": {"method": "GET", "path": "/health"}}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error_code"], json!("instance_offline"));
}

#[tokio::test]
async fn forward_round_trip_through_a_live_handle() {
    let TestApp { app, state, .. } = test_app().await;
    let instance_id = Uuid::new_v4();

    register_instance(&app, instance_id).await;

    // Stand in for the tunnel task: answer every forwarded request.
    let (handle, mut frame_rx) = ConnectionHandle::new("1.0".to_owned());
    assert!(state.connections.register(instance_id, handle).is_none());

    let pendings = state.pendings.clone();
    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if let Frame::ForwardRequest(request) = frame {
                pendings.resolve(
                    request.request_id,
                    TunnelReply::Response {
                        payload: Some(json!({"status": 200, "body": "ok"})),
                        error: None,
                    },
                );
            }
        }
    });

    let request_id = Uuid::new_v4();
    let (status, body) = send(
        &app,
        post_json(
            &format!("/relay/instances/{instance_id}/forward"),
            None,
            json!({"request_id": request_id, "payload": {"method": "GET", "path": "/health"}}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "forward failed: {body}");
    assert_eq!(body["request_id"], json!(request_id));
    assert_eq!(body["payload"], json!({"status": 200, "body": "ok"}));
}

#[tokio::test]
async fn disconnect_mid_flight_is_tunnel_disconnected_not_timeout() {
    let TestApp { app, state, .. } = test_app().await;
    let instance_id = Uuid::new_v4();

    register_instance(&app, instance_id).await;

    let (handle, mut frame_rx) = ConnectionHandle::new("1.0".to_owned());
    state.connections.register(instance_id, handle);

    // Stand in for a tunnel that dies between forward and response.
    let pendings = state.pendings.clone();
    tokio::spawn(async move {
        if frame_rx.recv().await.is_some() {
            pendings.fail_all(instance_id);
        }
    });

    let started = tokio::time::Instant::now();
    let (status, body) = send(
        &app,
        post_json(
            &format!("/relay/instances/{instance_id}/forward"),
            None,
            json!({"request_id": Uuid::new_v4(), "payload": {"method": "GET", "path": "/health"}}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error_code"], json!("tunnel_disconnected"));
    // Promptly, not after the 30-second ceiling.
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
}

#[tokio::test]
async fn duplicate_request_id_is_refused_while_in_flight() {
    let TestApp { app, state, .. } = test_app().await;
    let instance_id = Uuid::new_v4();

    register_instance(&app, instance_id).await;

    let (handle, _frame_rx) = ConnectionHandle::new("1.0".to_owned());
    state.connections.register(instance_id, handle);

    let request_id = Uuid::new_v4();
    let _reply_rx = state.pendings.register(instance_id, request_id).unwrap();

    let (status, body) = send(
        &app,
        post_json(
            &format!("/relay/instances/{instance_id}/forward"),
            None,
            json!({"request_id": request_id, "payload": {}}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], json!("validation"));
}

#[tokio::test]
async fn health_reports_connection_counts() {
    let TestApp { app, state, .. } = test_app().await;

    let (handle, _frame_rx) = ConnectionHandle::new("1.0".to_owned());
    state.connections.register(Uuid::new_v4(), handle);

    let (status, body) = send(
        &app,
        Request::builder()
            .method(http::Method::GET)
            .uri("/relay/health")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connected_instances"], json!(1));
    assert_eq!(body["version"], json!(env!("CARGO_PKG_VERSION")));
}

#[tokio::test]
async fn connect_returns_the_directory_record() {
    let TestApp { app, state, .. } = test_app().await;
    let instance_id = Uuid::new_v4();

    register_instance(&app, instance_id).await;

    // Presence is fresh (we just registered) but there is no tunnel yet.
    let (status, body) = send(
        &app,
        Request::builder()
            .method(http::Method::GET)
            .uri(format!("/relay/instances/{instance_id}/connect"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["online"], json!(false));

    // With a live handle, online flips: registry entry AND fresh presence.
    let (handle, _frame_rx) = ConnectionHandle::new("1.0".to_owned());
    state.connections.register(instance_id, handle);

    let (status, body) = send(
        &app,
        Request::builder()
            .method(http::Method::GET)
            .uri(format!("/relay/instances/{instance_id}/connect"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["online"], json!(true));

    let (status, body) = send(
        &app,
        Request::builder()
            .method(http::Method::GET)
            .uri(format!("/relay/instances/{}/connect", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], json!("not_found"));
}
