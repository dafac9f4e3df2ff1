//! Relay API tests
//!
//! Routes are exercised in-process with `oneshot`, then over a loopback
//! listener with the client transports.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tower::ServiceExt;

use studyroom_relay::{build_router, AppState, RelayConfig};
use studyroom_webrtc::media::SyntheticMediaDevices;
use studyroom_webrtc::signaling::{
    HttpRelayTransport, PushFrame, PushRelayTransport, SignalKind,
};
use studyroom_webrtc::{
    RoomId, SessionConfig, SessionOrchestrator, SignalingMode, SignalingTransport,
};

fn router() -> Router {
    router_with(RelayConfig::default())
}

fn router_with(config: RelayConfig) -> Router {
    build_router(AppState::new(Arc::new(config)))
}

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn join(router: &Router, session: &str, user: &str) -> (StatusCode, Value) {
    call(
        router,
        "POST",
        "/webrtc/join-session",
        Some(json!({"sessionId": session, "userId": user, "userName": user})),
    )
    .await
}

async fn next_frame<S>(ws: &mut S) -> PushFrame
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str::<PushFrame>(&text).unwrap();
        }
    }
}

async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

// ============================================================================
// In-process routes
// ============================================================================

#[tokio::test]
async fn test_health() {
    let router = router();
    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"OK");
}

#[tokio::test]
async fn test_join_returns_other_participants() {
    let router = router();

    let (status, body) = join(&router, "room-1", "alice").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["participants"], json!([]));

    let (status, body) = join(&router, "room-1", "bob").await;
    assert_eq!(status, StatusCode::OK);
    let participants = body["participants"].as_array().unwrap();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0]["userId"], "alice");
    assert!(participants[0]["joinedAt"].is_string());

    let (_, stats) = call(&router, "GET", "/stats", None).await;
    assert_eq!(stats["rooms"], 1);
}

#[tokio::test]
async fn test_missing_fields_rejected() {
    let router = router();

    let (status, body) = call(
        &router,
        "POST",
        "/webrtc/join-session",
        Some(json!({"sessionId": "room-1", "userId": "alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "Missing required fields"}));

    join(&router, "room-1", "alice").await;
    let (status, body) = call(
        &router,
        "POST",
        "/webrtc/offer",
        Some(json!({"sessionId": "room-1", "fromUserId": "alice", "toUserId": "bob"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing required fields");

    // The payload must sit under the key for its kind
    let (status, _) = call(
        &router,
        "POST",
        "/webrtc/answer",
        Some(json!({
            "sessionId": "room-1", "fromUserId": "alice", "toUserId": "bob",
            "offer": {"type": "offer", "sdp": "v=0"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&router, "POST", "/webrtc/leave-session", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_publish_requires_room_and_membership() {
    let router = router();
    let offer = json!({
        "sessionId": "room-1", "fromUserId": "alice", "toUserId": "bob",
        "offer": {"type": "offer", "sdp": "v=0"}
    });

    let (status, _) = call(&router, "POST", "/webrtc/offer", Some(offer.clone())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    join(&router, "room-1", "bob").await;
    let (status, _) = call(&router, "POST", "/webrtc/offer", Some(offer)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_room_full() {
    let router = router();
    join(&router, "room-1", "alice").await;
    join(&router, "room-1", "bob").await;

    let (status, body) = join(&router, "room-1", "carol").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().starts_with("Room full: "));

    // Re-joining is not a new participant
    let (status, _) = join(&router, "room-1", "alice").await;
    assert_eq!(status, StatusCode::OK);

    let mut config = RelayConfig::default();
    config.limits.max_rooms = 1;
    let router = router_with(config);
    join(&router, "room-1", "alice").await;
    let (status, _) = join(&router, "room-2", "bob").await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_offer_consumed_once() {
    let router = router();
    join(&router, "room-1", "alice").await;
    join(&router, "room-1", "bob").await;

    let offer = json!({"type": "offer", "sdp": "v=0 first"});
    let (status, body) = call(
        &router,
        "POST",
        "/webrtc/offer",
        Some(json!({"sessionId": "room-1", "fromUserId": "bob", "toUserId": "alice", "offer": offer})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let seq = body["seq"].as_u64().unwrap();

    let (status, body) = call(&router, "GET", "/webrtc/offer/room-1/bob/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["offer"], offer);
    assert_eq!(body["seq"].as_u64(), Some(seq));

    let (_, body) = call(&router, "GET", "/webrtc/offer/room-1/bob/alice", None).await;
    assert!(body["offer"].is_null());
    assert!(body["seq"].is_null());

    // Unknown rooms read as empty rather than erroring
    let (status, body) = call(&router, "GET", "/webrtc/answer/nowhere/bob/alice", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["answer"].is_null());
}

#[tokio::test]
async fn test_candidates_drain_in_order() {
    let router = router();
    join(&router, "room-1", "alice").await;
    join(&router, "room-1", "bob").await;

    let mut last_seq = 0;
    for i in 0..3 {
        let (status, body) = call(
            &router,
            "POST",
            "/webrtc/ice-candidate",
            Some(json!({
                "sessionId": "room-1", "fromUserId": "alice", "toUserId": "bob",
                "candidate": {"candidate": format!("candidate:{}", i), "sdpMLineIndex": 0}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        last_seq = body["seq"].as_u64().unwrap();
    }

    let (_, body) = call(&router, "GET", "/webrtc/ice-candidates/room-1/alice/bob", None).await;
    let candidates = body["candidates"].as_array().unwrap();
    let lines: Vec<&str> = candidates
        .iter()
        .map(|c| c["candidate"].as_str().unwrap())
        .collect();
    assert_eq!(lines, vec!["candidate:0", "candidate:1", "candidate:2"]);
    assert_eq!(body["seq"].as_u64(), Some(last_seq));

    let (_, body) = call(&router, "GET", "/webrtc/ice-candidates/room-1/alice/bob", None).await;
    assert_eq!(body["candidates"], json!([]));
}

#[tokio::test]
async fn test_leave_purges_and_discards_room() {
    let router = router();
    join(&router, "room-1", "alice").await;
    join(&router, "room-1", "bob").await;
    call(
        &router,
        "POST",
        "/webrtc/offer",
        Some(json!({
            "sessionId": "room-1", "fromUserId": "bob", "toUserId": "alice",
            "offer": {"type": "offer", "sdp": "v=0"}
        })),
    )
    .await;

    let leave = |user: &str| json!({"sessionId": "room-1", "userId": user});
    let (status, body) = call(&router, "POST", "/webrtc/leave-session", Some(leave("bob"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, body) = call(&router, "GET", "/webrtc/offer/room-1/bob/alice", None).await;
    assert!(body["offer"].is_null());

    call(&router, "POST", "/webrtc/leave-session", Some(leave("alice"))).await;
    let (_, stats) = call(&router, "GET", "/stats", None).await;
    assert_eq!(stats["rooms"], 0);

    // Leaving twice still succeeds
    let (status, _) = call(&router, "POST", "/webrtc/leave-session", Some(leave("alice"))).await;
    assert_eq!(status, StatusCode::OK);
}

// ============================================================================
// Loopback listener
// ============================================================================

#[tokio::test]
async fn test_subscribe_rejects_non_members() {
    let base = serve(router()).await;
    let ws_base = base.replacen("http", "ws", 1);

    let err = connect_async(format!("{}/webrtc/subscribe/room-1/alice", ws_base))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn test_subscribe_flushes_stored_then_pushes() {
    let base = serve(router()).await;
    let http = HttpRelayTransport::new(&base).unwrap();
    let room = RoomId::derive("room-1").unwrap();

    http.join(&room, "alice", "Alice").await.unwrap();
    http.join(&room, "bob", "Bob").await.unwrap();
    let stored = http
        .publish(&room, SignalKind::Offer, "bob", "alice", json!({"type": "offer", "sdp": "v=0"}))
        .await
        .unwrap();

    let ws_url = format!("{}/webrtc/subscribe/room-1/alice", base.replacen("http", "ws", 1));
    let (mut ws, _) = connect_async(ws_url).await.unwrap();

    assert!(matches!(next_frame(&mut ws).await, PushFrame::Subscribed { .. }));
    match next_frame(&mut ws).await {
        PushFrame::Signal(envelope) => {
            assert_eq!(envelope.seq, stored);
            assert_eq!(envelope.kind, SignalKind::Offer);
        }
        other => panic!("unexpected frame: {:?}", other),
    }

    let live = http
        .publish(&room, SignalKind::IceCandidate, "bob", "alice", json!({"candidate": "candidate:1"}))
        .await
        .unwrap();
    match next_frame(&mut ws).await {
        PushFrame::Signal(envelope) => {
            assert_eq!(envelope.seq, live);
            assert_eq!(envelope.kind, SignalKind::IceCandidate);
        }
        other => panic!("unexpected frame: {:?}", other),
    }

    // Pushed signals are not stored a second time
    let fetched = http
        .fetch(&room, SignalKind::IceCandidate, "bob", "alice")
        .await
        .unwrap();
    assert!(fetched.is_empty());
}

#[tokio::test]
async fn test_http_transport_round_trip() {
    let base = serve(router()).await;
    let alice = HttpRelayTransport::new(&base).unwrap();
    let bob = HttpRelayTransport::new(&base).unwrap();
    let room = RoomId::derive("room-1").unwrap();

    assert!(alice.join(&room, "alice", "Alice").await.unwrap().is_empty());
    let others = bob.join(&room, "bob", "Bob").await.unwrap();
    assert_eq!(others[0].user_id, "alice");

    let seq = bob
        .publish(&room, SignalKind::Offer, "bob", "alice", json!({"type": "offer", "sdp": "v=0"}))
        .await
        .unwrap();
    let offers = alice.fetch(&room, SignalKind::Offer, "bob", "alice").await.unwrap();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].seq, seq);
    assert!(alice
        .fetch(&room, SignalKind::Offer, "bob", "alice")
        .await
        .unwrap()
        .is_empty());

    bob.leave(&room, "bob").await.unwrap();
    let err = bob
        .publish(&room, SignalKind::Answer, "bob", "alice", json!({"type": "answer", "sdp": "v=0"}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("403"));
}

#[tokio::test]
async fn test_push_transport_wakes_on_signal() {
    let base = serve(router()).await;
    let alice = PushRelayTransport::new(&base, Duration::from_millis(100)).unwrap();
    let bob = HttpRelayTransport::new(&base).unwrap();
    let room = RoomId::derive("room-1").unwrap();

    alice.join(&room, "alice", "Alice").await.unwrap();
    bob.join(&room, "bob", "Bob").await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !alice.is_live() {
        assert!(tokio::time::Instant::now() < deadline, "subscription never went live");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let seq = bob
        .publish(&room, SignalKind::Answer, "bob", "alice", json!({"type": "answer", "sdp": "v=0"}))
        .await
        .unwrap();

    // Each wake-up is followed by a fetch, the way the session driver does it
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let answers = loop {
        alice.wait_for_signal(Duration::from_secs(10)).await;
        let answers = alice.fetch(&room, SignalKind::Answer, "bob", "alice").await.unwrap();
        if !answers.is_empty() {
            break answers;
        }
        assert!(tokio::time::Instant::now() < deadline, "answer never pushed");
    };
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].seq, seq);

    alice.leave(&room, "alice").await.unwrap();
    assert!(!alice.is_live());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sessions_connect_through_relay() {
    let base = serve(router()).await;

    let peer = || {
        let config = SessionConfig::lan(&base)
            .with_signaling_mode(SignalingMode::Push)
            .with_auto_start_media(true);
        let transport = Arc::new(PushRelayTransport::new(&base, Duration::from_millis(100)).unwrap());
        SessionOrchestrator::new(config, transport, Arc::new(SyntheticMediaDevices::new()))
    };
    let alice = peer();
    let bob = peer();

    alice.enable("study-1", "alice", "Alice").await.unwrap();
    let mut rx = alice.subscribe();
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| s.role.is_some()))
        .await
        .unwrap()
        .unwrap();
    bob.enable("study-1", "bob", "Bob").await.unwrap();

    for session in [&alice, &bob] {
        let mut rx = session.subscribe();
        tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(bob.snapshot().partner_id.as_deref(), Some("alice"));

    alice.disable().await;
    bob.disable().await;
}
