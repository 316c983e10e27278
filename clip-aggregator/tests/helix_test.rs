mod common;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{TimeZone, Utc};
use clip_aggregator::helix::{ClipsRequest, UserLookup};
use clip_aggregator::{AggregatorError, Credential, HelixApi, HelixClient, HelixConfig};
use common::init_tracing;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Default)]
struct Upstream {
    clip_calls: AtomicUsize,
    /// Answer this many clip requests with 503 before succeeding.
    busy_for: usize,
}

async fn token() -> impl IntoResponse {
    Json(json!({ "access_token": "abc", "expires_in": 3600, "token_type": "bearer" }))
}

async fn users(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    match params.get("login").map(String::as_str) {
        Some("alpha") => (
            StatusCode::OK,
            Json(json!({ "data": [{ "id": "1001", "login": "alpha", "display_name": "Alpha" }] })),
        ),
        Some("nobody") => (StatusCode::OK, Json(json!({ "data": [] }))),
        _ => (StatusCode::BAD_REQUEST, Json(json!({ "error": "Bad Request" }))),
    }
}

async fn clips(
    State(upstream): State<Arc<Upstream>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let n = upstream.clip_calls.fetch_add(1, Ordering::SeqCst);
    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer abc") {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Unauthorized" })));
    }
    if n < upstream.busy_for {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "busy" })));
    }
    let cursor = if params.contains_key("after") { "" } else { "next-page" };
    (
        StatusCode::OK,
        Json(json!({
            "data": [{
                "id": "clip-1",
                "url": "https://clips.example/clip-1",
                "embed_url": "https://clips.example/embed?clip=clip-1",
                "broadcaster_id": params.get("broadcaster_id"),
                "broadcaster_name": "Alpha",
                "creator_name": "someone",
                "title": format!("first={} started_at={}", params["first"], params["started_at"]),
                "view_count": 77,
                "created_at": "2024-01-10T12:00:00Z",
                "thumbnail_url": "https://clips.example/clip-1.jpg",
                "duration": 29.5,
                "game_id": "509658"
            }],
            "pagination": { "cursor": cursor }
        })),
    )
}

async fn start(upstream: Arc<Upstream>) -> HelixClient {
    let app = Router::new()
        .route("/oauth2/token", post(token))
        .route("/helix/users", get(users))
        .route("/helix/clips", get(clips))
        .with_state(upstream);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    info!("Mock upstream on {}", addr);
    client_for(addr)
}

fn client_for(addr: SocketAddr) -> HelixClient {
    HelixClient::new(HelixConfig {
        api_base_url: format!("http://{}/helix", addr),
        token_url: format!("http://{}/oauth2/token", addr),
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        max_retries: 2,
        retry_delay_millis: 10,
        ..HelixConfig::default()
    })
    .unwrap()
}

fn credential(token: &str) -> Credential {
    Credential {
        token: token.to_string(),
        client_id: "client".to_string(),
    }
}

fn clips_request(after: Option<&str>) -> ClipsRequest {
    ClipsRequest {
        broadcaster_id: "1001".to_string(),
        started_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ended_at: Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap(),
        first: 100,
        after: after.map(str::to_string),
    }
}

#[tokio::test]
async fn test_token_exchange() {
    init_tracing();
    let client = start(Arc::new(Upstream::default())).await;

    let grant = client.request_token().await.unwrap();

    assert_eq!(grant.access_token, "abc");
    assert_eq!(grant.expires_in, 3600);
    assert_eq!(client.client_id(), "client");
}

#[tokio::test]
async fn test_user_lookup() {
    init_tracing();
    let client = start(Arc::new(Upstream::default())).await;
    let credential = credential("abc");

    let found = client
        .get_users(&credential, &UserLookup::Login("alpha".to_string()))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "1001");

    let missing = client
        .get_users(&credential, &UserLookup::Login("nobody".to_string()))
        .await
        .unwrap();
    assert!(missing.is_empty());

    let rejected = client
        .get_users(&credential, &UserLookup::Login("no such login".to_string()))
        .await
        .unwrap();
    assert!(rejected.is_empty(), "a 400 reads as not found");
}

#[tokio::test]
async fn test_clip_listing_maps_fields_and_cursor() {
    init_tracing();
    let client = start(Arc::new(Upstream::default())).await;

    let page = client.get_clips(&credential("abc"), &clips_request(None)).await.unwrap();
    assert_eq!(page.next_cursor().as_deref(), Some("next-page"));

    let clip: clip_aggregator::Clip = page.data.into_iter().next().unwrap().into();
    assert_eq!(clip.channel_id, "1001");
    assert_eq!(clip.category_id, "509658");
    assert_eq!(clip.view_count, 77);
    assert_eq!(clip.vod_offset, None);
    assert_eq!(clip.title, "first=100 started_at=2024-01-01T00:00:00Z");

    let last = client
        .get_clips(&credential("abc"), &clips_request(Some("next-page")))
        .await
        .unwrap();
    assert_eq!(last.next_cursor(), None, "empty cursor means no more pages");
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    init_tracing();
    let upstream = Arc::new(Upstream {
        busy_for: 2,
        ..Upstream::default()
    });
    let client = start(upstream.clone()).await;

    let page = client.get_clips(&credential("abc"), &clips_request(None)).await.unwrap();

    assert_eq!(page.data.len(), 1);
    assert_eq!(upstream.clip_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retries_are_bounded() {
    init_tracing();
    let upstream = Arc::new(Upstream {
        busy_for: 10,
        ..Upstream::default()
    });
    let client = start(upstream.clone()).await;

    let err = client.get_clips(&credential("abc"), &clips_request(None)).await.unwrap_err();

    assert!(matches!(err, AggregatorError::Upstream { status: Some(503), .. }), "got {:?}", err);
    assert_eq!(upstream.clip_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_unauthorized_is_not_retried() {
    init_tracing();
    let upstream = Arc::new(Upstream::default());
    let client = start(upstream.clone()).await;

    let err = client.get_clips(&credential("stale"), &clips_request(None)).await.unwrap_err();

    assert!(matches!(err, AggregatorError::Auth(_)), "got {:?}", err);
    assert_eq!(upstream.clip_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dropped_connection_is_not_retried() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
        }
    });
    let client = client_for(addr);

    let err = client.get_clips(&credential("abc"), &clips_request(None)).await.unwrap_err();

    assert!(matches!(err, AggregatorError::Http(_)), "got {:?}", err);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}
