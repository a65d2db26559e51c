#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use accordlink::error::GatewayError;
use accordlink::gateway::{
    Connector, GatewayConfig, SocketCommand, SocketEvent, SocketHandle,
};
use accordlink::rest::{HttpTransport, RestRequest, RestResponse, TransportError};
use futures_util::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Gateway config with deterministic timing: no jitter anywhere.
pub fn gateway_config(shard_count: u32) -> GatewayConfig {
    let mut config = GatewayConfig::new("Bot-token", "wss://gateway.test", shard_count);
    config.heartbeat_jitter = 0.0;
    config.backoff_jitter = 0.0;
    config
}

/// Connector whose sockets are driven by the test acting as the server.
#[derive(Clone)]
pub struct MockConnector {
    accepted: mpsc::UnboundedSender<ServerSocket>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSocket>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { accepted }), rx)
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: String) -> BoxFuture<'static, Result<SocketHandle, GatewayError>> {
        let (handle, commands, events) = SocketHandle::pair();
        let server = ServerSocket {
            url,
            opened_at: Instant::now(),
            commands,
            events,
        };
        let sent = self.accepted.send(server);
        Box::pin(async move {
            sent.map_err(|_| GatewayError::Transport("test server gone".to_string()))?;
            Ok(handle)
        })
    }
}

/// Server side of one mocked gateway socket.
pub struct ServerSocket {
    pub url: String,
    pub opened_at: Instant,
    commands: mpsc::UnboundedReceiver<SocketCommand>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl ServerSocket {
    pub fn send(&self, payload: Value) {
        let _ = self.events.send(SocketEvent::Text(payload.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.events.send(SocketEvent::Text(text.to_string()));
    }

    pub fn send_hello(&self, interval_ms: u64) {
        self.send(json!({ "op": 10, "d": { "heartbeat_interval": interval_ms } }));
    }

    pub fn send_ack(&self) {
        self.send(json!({ "op": 11 }));
    }

    pub fn send_dispatch(&self, seq: u64, event: &str, data: Value) {
        self.send(json!({ "op": 0, "s": seq, "t": event, "d": data }));
    }

    pub fn send_ready(&self, seq: u64, session_id: &str) {
        self.send_dispatch(
            seq,
            "READY",
            json!({
                "session_id": session_id,
                "resume_gateway_url": "wss://resume.test",
                "user": { "id": "175928847299117063" }
            }),
        );
    }

    pub fn close(&self, code: u16) {
        let _ = self.events.send(SocketEvent::Closed {
            code: Some(code),
            reason: String::new(),
        });
    }

    /// Next thing the client did on this socket.
    pub async fn next_command(&mut self) -> SocketCommand {
        self.commands
            .recv()
            .await
            .expect("client dropped the socket")
    }

    /// Next text frame, decoded. Panics if the client closes instead.
    pub async fn next_frame(&mut self) -> Value {
        match self.next_command().await {
            SocketCommand::Text(text) => serde_json::from_str(&text).expect("client sent bad json"),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    /// Hello, identify, ready: leaves the shard in the ready state.
    pub async fn handshake(&mut self, interval_ms: u64, session_id: &str) -> Value {
        self.send_hello(interval_ms);
        let identify = self.next_frame().await;
        assert_eq!(identify["op"], 2, "expected identify, got {identify}");
        self.send_ready(1, session_id);
        identify
    }
}

/// One call as the mocked REST server saw it.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
    pub reason: Option<String>,
    pub started: Instant,
}

/// What the mocked REST server answers.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: String,
    pub latency: Duration,
}

impl MockReply {
    pub fn ok() -> Self {
        Self::status(200).body("{}")
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
            latency: Duration::ZERO,
        }
    }

    pub fn header(mut self, name: &'static str, value: impl ToString) -> Self {
        self.headers.push((name, value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// `limit`/`remaining`/`reset-after` quota headers.
    pub fn quota(self, limit: u32, remaining: u32, reset_after: Duration) -> Self {
        self.header("x-ratelimit-limit", limit)
            .header("x-ratelimit-remaining", remaining)
            .header("x-ratelimit-reset-after", format!("{:.3}", reset_after.as_secs_f64()))
            .header("x-ratelimit-bucket", "abcd1234")
    }
}

type Responder = dyn Fn(&RestRequest, usize) -> MockReply + Send + Sync;

/// Scripted REST transport recording every dispatch.
#[derive(Clone)]
pub struct MockTransport {
    responder: Arc<Responder>,
    log: Arc<Mutex<Vec<Dispatched>>>,
    in_flight: Arc<Mutex<(usize, usize)>>,
    failures: Arc<Mutex<VecDeque<String>>>,
}

impl MockTransport {
    /// `responder` gets the request and its zero-based call index.
    pub fn new(responder: impl Fn(&RestRequest, usize) -> MockReply + Send + Sync + 'static) -> Self {
        Self {
            responder: Arc::new(responder),
            log: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(Mutex::new((0, 0))),
            failures: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn always(reply: MockReply) -> Self {
        Self::new(move |_, _| reply.clone())
    }

    /// Build every reply at dispatch time, for replies that depend on the clock.
    pub fn always_with(reply: impl Fn() -> MockReply + Send + Sync + 'static) -> Self {
        Self::new(move |_, _| reply())
    }

    /// Make the next call fail at the transport level.
    pub fn fail_next(&self, error: &str) {
        self.failures.lock().unwrap().push_back(error.to_string());
    }

    pub fn calls(&self) -> Vec<Dispatched> {
        self.log.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.path).collect()
    }

    /// Highest number of calls that were in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().1
    }
}

impl HttpTransport for MockTransport {
    fn send(&self, request: RestRequest) -> BoxFuture<'static, Result<RestResponse, TransportError>> {
        let index = {
            let mut log = self.log.lock().unwrap();
            log.push(Dispatched {
                method: request.method.to_string(),
                path: request.path.clone(),
                body: request.body.clone(),
                reason: request.reason.clone(),
                started: Instant::now(),
            });
            log.len() - 1
        };
        let failure = self.failures.lock().unwrap().pop_front();
        let reply = (self.responder)(&request, index);
        let in_flight = self.in_flight.clone();
        {
            let mut counts = in_flight.lock().unwrap();
            counts.0 += 1;
            counts.1 = counts.1.max(counts.0);
        }

        Box::pin(async move {
            tokio::time::sleep(reply.latency).await;
            in_flight.lock().unwrap().0 -= 1;
            if let Some(error) = failure {
                return Err(TransportError(error));
            }
            let mut headers = HeaderMap::new();
            for (name, value) in reply.headers {
                headers.insert(
                    HeaderName::from_static(name),
                    HeaderValue::from_str(&value).unwrap(),
                );
            }
            Ok(RestResponse {
                status: reply.status,
                headers,
                body: reply.body,
            })
        })
    }
}
