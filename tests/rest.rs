mod common;

use std::sync::Arc;
use std::time::Duration;

use accordlink::error::RestError;
use accordlink::rest::{RequestExecutor, RestConfig, RestDiagnostic, Route};
use chrono::{TimeZone, Utc};
use common::{MockReply, MockTransport};
use futures_util::future::join_all;
use serde_json::json;
use tokio::time::Instant;

const CHANNEL: &str = "175928847299117063";
const OTHER_CHANNEL: &str = "175928847299117064";

fn messages(channel: &str, n: usize) -> Route {
    Route::get(format!("/channels/{channel}/messages?n={n}"))
}

#[tokio::test(start_paused = true)]
async fn test_same_route_dispatches_in_order_one_at_a_time() {
    let transport = MockTransport::always(MockReply::ok().latency(Duration::from_millis(50)));
    let exec = RequestExecutor::new(transport.clone(), RestConfig::default());

    let results = join_all((0..8).map(|n| exec.execute(messages(CHANNEL, n), None))).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let expected: Vec<String> = (0..8)
        .map(|n| format!("/channels/{CHANNEL}/messages?n={n}"))
        .collect();
    assert_eq!(transport.paths(), expected);
    assert_eq!(transport.max_in_flight(), 1);
    assert_eq!(exec.bucket_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_different_routes_run_in_parallel() {
    let transport = MockTransport::always(MockReply::ok().latency(Duration::from_secs(1)));
    let exec = RequestExecutor::new(transport.clone(), RestConfig::default());
    let start = Instant::now();

    let (a, b) = tokio::join!(
        exec.execute(messages(CHANNEL, 0), None),
        exec.execute(messages(OTHER_CHANNEL, 0), None),
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(start.elapsed(), Duration::from_secs(1));
    assert_eq!(transport.max_in_flight(), 2);
    assert_eq!(exec.bucket_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sixth_call_waits_for_server_reset() {
    let start = Instant::now();
    let window_end = start + Duration::from_secs(10);
    let transport = MockTransport::new(move |_, i| {
        let reset_after = window_end.saturating_duration_since(Instant::now());
        match i {
            // learn the bucket: limit 5, all 5 left
            0 => MockReply::ok().quota(5, 5, reset_after),
            1..=5 => MockReply::ok().quota(5, 5 - i as u32, reset_after),
            _ => MockReply::ok().quota(5, 4, Duration::from_secs(10)),
        }
    });
    let exec = RequestExecutor::new(transport.clone(), RestConfig::default());
    exec.execute(messages(CHANNEL, 0), None).await.unwrap();

    let results = join_all((1..=6).map(|n| exec.execute(messages(CHANNEL, n), None))).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let calls = transport.calls();
    assert_eq!(calls.len(), 7);
    for call in &calls[1..=5] {
        assert_eq!(call.started, start, "{} should dispatch immediately", call.path);
    }
    assert!(calls[6].started >= window_end);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_bucket_always_waits_for_reset() {
    let reset_after = Duration::from_secs(2);
    let transport = MockTransport::always(MockReply::ok().quota(1, 0, reset_after));
    let exec = RequestExecutor::new(transport.clone(), RestConfig::default());

    join_all((0..5).map(|n| exec.execute(messages(CHANNEL, n), None))).await;

    let calls = transport.calls();
    assert_eq!(calls.len(), 5);
    for pair in calls.windows(2) {
        assert!(pair[1].started - pair[0].started >= reset_after);
    }
}

#[tokio::test(start_paused = true)]
async fn test_epoch_reset_is_corrected_for_clock_skew() {
    // the server clock runs five seconds ahead and only sends absolute resets
    let transport = MockTransport::always_with(|| {
        let server_secs = (Utc::now() + chrono::Duration::seconds(5)).timestamp();
        let date = Utc.timestamp_opt(server_secs, 0).unwrap();
        MockReply::ok()
            .header("date", date.to_rfc2822())
            .header("x-ratelimit-limit", 1)
            .header("x-ratelimit-remaining", 0)
            .header("x-ratelimit-reset", server_secs + 2)
    });
    let exec = RequestExecutor::new(transport.clone(), RestConfig::default());

    exec.execute(messages(CHANNEL, 0), None).await.unwrap();
    assert!((4000..=5000).contains(&exec.clock_offset_ms()));
    exec.execute(messages(CHANNEL, 1), None).await.unwrap();

    // two server seconds, not seven local ones and not zero
    let calls = transport.calls();
    let gap = calls[1].started - calls[0].started;
    assert!(
        gap >= Duration::from_secs(2) && gap <= Duration::from_millis(2001),
        "second call waited {gap:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_global_rate_limit_stalls_every_route() {
    let blocked = format!("/channels/{CHANNEL}/messages?n=0");
    let transport = MockTransport::new(move |req, i| {
        if i == 0 && req.path == blocked {
            MockReply::status(429)
                .header("x-ratelimit-global", "true")
                .header("retry-after", "3")
                .body(r#"{"message":"You are being rate limited.","retry_after":3.0,"global":true}"#)
        } else {
            MockReply::ok()
        }
    });
    let (exec, mut diagnostics) =
        RequestExecutor::with_diagnostics(transport.clone(), RestConfig::default());
    let exec = Arc::new(exec);
    let start = Instant::now();

    let first = tokio::spawn({
        let exec = exec.clone();
        async move { exec.execute(messages(CHANNEL, 0), None).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(exec.global_gate().is_tripped());

    let other = exec.execute(messages(OTHER_CHANNEL, 0), None).await;
    assert!(other.is_ok());
    assert!(first.await.unwrap().is_ok());

    let calls = transport.calls();
    assert_eq!(calls.len(), 3);
    for call in &calls[1..] {
        assert!(call.started >= start + Duration::from_secs(3));
    }
    assert_eq!(
        diagnostics.recv().await,
        Some(RestDiagnostic::RateLimited {
            bucket: exec.bucket_key(&messages(CHANNEL, 0)),
            retry_after: Duration::from_secs(3),
            global: true,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_route_429_is_retried_after_retry_after() {
    let transport = MockTransport::new(|_, i| {
        if i == 0 {
            MockReply::status(429)
                .header("x-ratelimit-scope", "user")
                .body(r#"{"message":"slow down","retry_after":1.5,"global":false}"#)
        } else {
            MockReply::ok().body(r#"{"id":"1"}"#)
        }
    });
    let exec = RequestExecutor::new(transport.clone(), RestConfig::default());

    let resp = exec.execute(messages(CHANNEL, 0), None).await.unwrap();
    assert_eq!(resp.body, r#"{"id":"1"}"#);
    assert!(!exec.global_gate().is_tripped());

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].started - calls[0].started, Duration::from_millis(1500));
}

#[tokio::test(start_paused = true)]
async fn test_server_errors_exhaust_retry_budget() {
    let transport = MockTransport::always(MockReply::status(502).body("bad gateway"));
    let exec = RequestExecutor::new(transport.clone(), RestConfig::default());

    let err = exec.execute(messages(CHANNEL, 0), None).await.unwrap_err();
    assert_eq!(
        err,
        RestError::RetriesExhausted {
            attempts: 4,
            last: "server returned 502".to_string()
        }
    );

    // linear backoff: 500ms, 1000ms, 1500ms
    let calls = transport.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[3].started - calls[0].started, Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_is_retried() {
    let transport = MockTransport::always(MockReply::ok());
    transport.fail_next("connection reset");
    let exec = RequestExecutor::new(transport.clone(), RestConfig::default());

    assert!(exec.execute(messages(CHANNEL, 0), None).await.is_ok());
    assert_eq!(transport.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_client_errors_are_not_retried() {
    let transport = MockTransport::new(|req, _| {
        if req.path.ends_with("missing") {
            MockReply::status(404).body(r#"{"message":"Unknown Channel","code":10003}"#)
        } else {
            MockReply::status(401).body(r#"{"message":"401: Unauthorized","code":0}"#)
        }
    });
    let exec = RequestExecutor::new(transport.clone(), RestConfig::default());

    let err = exec
        .execute(Route::get("/channels/missing"), None)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert_eq!(err.code(), "http_error");

    let err = exec.execute(Route::get("/users/@me"), None).await.unwrap_err();
    assert!(matches!(err, RestError::Unauthorized(_)));
    assert_eq!(transport.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_call_never_reaches_network() {
    let transport = MockTransport::always(MockReply::ok());
    let exec = RequestExecutor::new(transport.clone(), RestConfig::default());

    let err = exec
        .execute(Route::get("channels/1"), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_request");
    let err = exec
        .execute(Route::post(format!("/channels/{CHANNEL}/messages")), Some(json!(42)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_request");

    assert!(transport.calls().is_empty());
    assert_eq!(exec.bucket_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_does_not_block_successors() {
    let transport = MockTransport::new(|_, i| {
        if i == 0 {
            MockReply::ok().latency(Duration::from_secs(30))
        } else {
            MockReply::ok()
        }
    });
    let config = RestConfig {
        request_timeout: Duration::from_secs(1),
        ..RestConfig::default()
    };
    let exec = RequestExecutor::new(transport.clone(), config);
    let start = Instant::now();

    let (slow, fast) = tokio::join!(
        exec.execute(messages(CHANNEL, 0), None),
        exec.execute(messages(CHANNEL, 1), None),
    );
    assert_eq!(slow.unwrap_err(), RestError::Timeout);
    assert!(fast.is_ok());
    assert_eq!(transport.calls()[1].started, start + Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_call_is_never_dispatched() {
    let transport = MockTransport::always(MockReply::ok().latency(Duration::from_secs(1)));
    let exec = Arc::new(RequestExecutor::new(transport.clone(), RestConfig::default()));

    let first = tokio::spawn({
        let exec = exec.clone();
        async move { exec.execute(messages(CHANNEL, 0), None).await }
    });
    tokio::task::yield_now().await;

    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), exec.execute(messages(CHANNEL, 1), None))
            .await;
    assert!(abandoned.is_err());

    exec.execute(messages(CHANNEL, 2), None).await.unwrap();
    first.await.unwrap().unwrap();

    assert_eq!(
        transport.paths(),
        vec![
            format!("/channels/{CHANNEL}/messages?n=0"),
            format!("/channels/{CHANNEL}/messages?n=2"),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_audit_log_reason_is_forwarded() {
    let transport = MockTransport::always(MockReply::status(204));
    let exec = RequestExecutor::new(transport.clone(), RestConfig::default());

    exec.execute_with_reason(
        Route::delete(format!("/guilds/{CHANNEL}/bans/{OTHER_CHANNEL}")),
        None,
        Some("spam"),
    )
    .await
    .unwrap();
    let calls = transport.calls();
    assert_eq!(calls[0].method, "DELETE");
    assert_eq!(calls[0].reason.as_deref(), Some("spam"));
}

#[tokio::test(start_paused = true)]
async fn test_gateway_bot_discovery() {
    let transport = MockTransport::always(MockReply::ok().body(
        r#"{
            "url": "wss://gateway.test",
            "shards": 4,
            "session_start_limit": {
                "total": 1000,
                "remaining": 998,
                "reset_after": 14400000,
                "max_concurrency": 2
            }
        }"#,
    ));
    let exec = RequestExecutor::new(transport.clone(), RestConfig::default());

    let info = exec.gateway_bot().await.unwrap();
    assert_eq!(info.url, "wss://gateway.test");
    assert_eq!(info.shards, 4);
    assert_eq!(info.session_start_limit.max_concurrency, 2);
    assert_eq!(transport.paths(), vec!["/gateway/bot".to_string()]);
}
