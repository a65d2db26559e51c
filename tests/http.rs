use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use accordlink::rest::{ReqwestTransport, RequestExecutor, RestConfig, Route};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct MockApi {
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<HeaderMap>>>,
}

async fn create_message(
    State(api): State<MockApi>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    api.hits.fetch_add(1, Ordering::SeqCst);
    api.seen.lock().unwrap().push(headers);
    (
        StatusCode::OK,
        [
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "4"),
            ("x-ratelimit-reset-after", "1.000"),
            ("x-ratelimit-bucket", "41f9cd5d"),
        ],
        Json(json!({ "id": "1", "content": body["content"] })),
    )
}

async fn limited_once(State(api): State<MockApi>) -> impl IntoResponse {
    if api.hits.fetch_add(1, Ordering::SeqCst) == 0 {
        (
            StatusCode::TOO_MANY_REQUESTS,
            [("x-ratelimit-scope", "user"), ("retry-after", "1")],
            Json(json!({ "message": "You are being rate limited.", "retry_after": 0.05, "global": false })),
        )
            .into_response()
    } else {
        Json(json!({ "id": "175928847299117063" })).into_response()
    }
}

async fn spawn_api(api: MockApi) -> String {
    let app = Router::new()
        .route("/channels/{channel_id}/messages", post(create_message))
        .route("/users/@me", get(limited_once))
        .with_state(api);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://127.0.0.1:{}", addr.port())
}

#[tokio::test]
async fn test_reqwest_transport_sends_credentials_and_reason() {
    let api = MockApi::default();
    let base = spawn_api(api.clone()).await;
    let transport = ReqwestTransport::new(base).with_auth_token("secret");
    let exec = RequestExecutor::new(transport, RestConfig::default());

    let resp = exec
        .execute_with_reason(
            Route::post("/channels/175928847299117063/messages"),
            Some(json!({ "content": "hello" })),
            Some("cleanup run"),
        )
        .await
        .unwrap();
    assert!(resp.is_success());
    let body: Value = resp.json().unwrap();
    assert_eq!(body["content"], "hello");
    assert_eq!(resp.headers["x-ratelimit-bucket"], "41f9cd5d");

    let seen = api.seen.lock().unwrap();
    assert_eq!(seen[0]["authorization"], "Bot secret");
    assert_eq!(seen[0]["x-audit-log-reason"], "cleanup%20run");
    assert!(seen[0]["user-agent"]
        .to_str()
        .unwrap()
        .starts_with("DiscordBot"));
}

#[tokio::test]
async fn test_reqwest_transport_recovers_from_429() {
    let api = MockApi::default();
    let base = spawn_api(api.clone()).await;
    let exec = RequestExecutor::new(ReqwestTransport::new(base), RestConfig::default());

    let user: Value = tokio::time::timeout(
        Duration::from_secs(5),
        exec.execute_json(Route::get("/users/@me"), None),
    )
    .await
    .expect("request hung")
    .unwrap();
    assert_eq!(user["id"], "175928847299117063");
    assert_eq!(api.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_reqwest_transport_surfaces_not_found() {
    let api = MockApi::default();
    let base = spawn_api(api).await;
    let exec = RequestExecutor::new(ReqwestTransport::new(base), RestConfig::default());

    let err = exec
        .execute(Route::get("/guilds/175928847299117063"), None)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(404));
}
