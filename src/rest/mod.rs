//! Rate-limited REST execution.
//!
//! Every call is mapped to a bucket key by the [`RouteTable`]. Each key gets
//! one drain task that owns the key's [`SequentialBucket`] and runs calls
//! strictly one at a time in arrival order. All drain tasks consult the
//! shared [`GlobalGate`] before dispatching.

pub mod clock;
pub mod headers;
pub mod route;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::RestError;
use crate::ratelimit::{BucketUpdate, GlobalGate, SequentialBucket};
use clock::ClockSkew;
use headers::{RateLimitHeaders, RateLimited};
pub use route::{Route, RouteTable};
pub use transport::{HttpTransport, ReqwestTransport, RestRequest, RestResponse, TransportError};

#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Retries for transient failures (5xx, transport errors). 429s are not
    /// counted against this.
    pub max_retries: u32,
    /// Linear backoff step between transient retries.
    pub retry_delay: Duration,
    /// Per-call limit on a single HTTP exchange.
    pub request_timeout: Duration,
    pub routes: RouteTable,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(15),
            routes: RouteTable::default(),
        }
    }
}

/// Optional observability stream for conditions the executor recovers from
/// on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum RestDiagnostic {
    RateLimited {
        bucket: String,
        retry_after: Duration,
        global: bool,
    },
    Retrying {
        bucket: String,
        attempt: u32,
        reason: String,
    },
}

/// `GET /gateway/bot` response.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBotInfo {
    pub url: String,
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds until `remaining` resets.
    pub reset_after: u64,
    pub max_concurrency: u32,
}

struct QueuedCall {
    request: RestRequest,
    reply: oneshot::Sender<Result<RestResponse, RestError>>,
}

struct Shared {
    transport: Arc<dyn HttpTransport>,
    global: GlobalGate,
    clock: ClockSkew,
    config: RestConfig,
    diagnostics: Option<mpsc::UnboundedSender<RestDiagnostic>>,
}

pub struct RequestExecutor {
    shared: Arc<Shared>,
    buckets: DashMap<String, mpsc::UnboundedSender<QueuedCall>>,
}

impl RequestExecutor {
    pub fn new(transport: impl HttpTransport, config: RestConfig) -> Self {
        Self::build(Arc::new(transport), config, None)
    }

    /// Like [`RequestExecutor::new`], also returning a stream of recovered
    /// rate-limit and retry conditions.
    pub fn with_diagnostics(
        transport: impl HttpTransport,
        config: RestConfig,
    ) -> (Self, mpsc::UnboundedReceiver<RestDiagnostic>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::build(Arc::new(transport), config, Some(tx)), rx)
    }

    fn build(
        transport: Arc<dyn HttpTransport>,
        config: RestConfig,
        diagnostics: Option<mpsc::UnboundedSender<RestDiagnostic>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                global: GlobalGate::new(),
                clock: ClockSkew::new(),
                config,
                diagnostics,
            }),
            buckets: DashMap::new(),
        }
    }

    pub async fn execute(
        &self,
        route: Route,
        body: Option<serde_json::Value>,
    ) -> Result<RestResponse, RestError> {
        self.execute_with_reason(route, body, None).await
    }

    /// Execute a call carrying an audit-log reason.
    pub async fn execute_with_reason(
        &self,
        route: Route,
        body: Option<serde_json::Value>,
        reason: Option<&str>,
    ) -> Result<RestResponse, RestError> {
        validate(&route, body.as_ref())?;
        let key = self.bucket_key(&route);
        let (reply, rx) = oneshot::channel();
        let call = QueuedCall {
            request: RestRequest {
                method: route.method,
                path: route.path,
                body,
                reason: reason.map(str::to_string),
            },
            reply,
        };

        let sender = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| spawn_drain(key.clone(), Arc::clone(&self.shared)))
            .clone();
        if let Err(mpsc::error::SendError(call)) = sender.send(call) {
            // the drain task died; replace it
            tracing::warn!(bucket = %key, "respawning route drain task");
            let sender = spawn_drain(key.clone(), Arc::clone(&self.shared));
            self.buckets.insert(key, sender.clone());
            sender.send(call).map_err(|_| RestError::Closed)?;
        }

        rx.await.map_err(|_| RestError::Closed)?
    }

    /// Execute and decode a JSON response body.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        route: Route,
        body: Option<serde_json::Value>,
    ) -> Result<T, RestError> {
        self.execute(route, body).await?.json()
    }

    pub async fn gateway_bot(&self) -> Result<GatewayBotInfo, RestError> {
        self.execute_json(Route::get("/gateway/bot"), None).await
    }

    pub fn bucket_key(&self, route: &Route) -> String {
        let now_ms = Utc::now().timestamp_millis() + self.shared.clock.offset_ms();
        self.shared
            .config
            .routes
            .bucket_key(route, now_ms.max(0) as u64)
    }

    /// Number of distinct buckets touched so far.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn global_gate(&self) -> &GlobalGate {
        &self.shared.global
    }

    pub fn clock_offset_ms(&self) -> i64 {
        self.shared.clock.offset_ms()
    }
}

fn validate(route: &Route, body: Option<&serde_json::Value>) -> Result<(), RestError> {
    if !route.path.starts_with('/') {
        return Err(RestError::InvalidRequest(format!(
            "path must start with '/': {:?}",
            route.path
        )));
    }
    if route.path.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(RestError::InvalidRequest(format!(
            "path contains whitespace: {:?}",
            route.path
        )));
    }
    if let Some(body) = body {
        if route.method == Method::GET || route.method == Method::HEAD {
            return Err(RestError::InvalidRequest(format!(
                "{} requests cannot carry a body",
                route.method
            )));
        }
        if !body.is_object() && !body.is_array() {
            return Err(RestError::InvalidRequest(
                "body must be a JSON object or array".to_string(),
            ));
        }
    }
    Ok(())
}

fn spawn_drain(key: String, shared: Arc<Shared>) -> mpsc::UnboundedSender<QueuedCall> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(drain(key, rx, shared));
    tx
}

/// One route's drain loop: pulls calls in arrival order and finishes each
/// (including all of its retries) before looking at the next.
async fn drain(key: String, mut rx: mpsc::UnboundedReceiver<QueuedCall>, shared: Arc<Shared>) {
    let mut route = RouteState {
        bucket: SequentialBucket::new(key),
        reset_epoch: None,
    };
    while let Some(call) = rx.recv().await {
        shared.process(&mut route, call).await;
    }
    tracing::trace!(bucket = %route.bucket.key(), "route drain loop finished");
}

struct RouteState {
    bucket: SequentialBucket,
    /// Server-clock reset, kept when the response gave no relative reset so
    /// the deadline can be recomputed against the latest skew estimate.
    reset_epoch: Option<EpochReset>,
}

/// An absolute reset plus the local instant and wall time it arrived at.
#[derive(Clone, Copy)]
struct EpochReset {
    epoch_secs: f64,
    received: Instant,
    local: DateTime<Utc>,
}

enum Outcome {
    Done(Result<RestResponse, RestError>),
    Retry,
}

impl Shared {
    async fn process(&self, route: &mut RouteState, call: QueuedCall) {
        let mut failures = 0u32;
        loop {
            if call.reply.is_closed() {
                tracing::debug!(bucket = %route.bucket.key(), "caller went away, dropping call");
                return;
            }
            self.wait_for_slot(route).await;
            route.bucket.acquire();

            tracing::debug!(
                bucket = %route.bucket.key(),
                method = %call.request.method,
                path = %call.request.path,
                "dispatching request"
            );
            let sent = tokio::time::timeout(
                self.config.request_timeout,
                self.transport.send(call.request.clone()),
            )
            .await;

            let outcome = match sent {
                Err(_) => {
                    tracing::warn!(bucket = %route.bucket.key(), "request timed out");
                    Outcome::Done(Err(RestError::Timeout))
                }
                Ok(Err(e)) => self.transient(route, &mut failures, e.to_string()).await,
                Ok(Ok(response)) => self.handle_response(route, &mut failures, response).await,
            };

            match outcome {
                Outcome::Done(result) => {
                    let _ = call.reply.send(result);
                    return;
                }
                Outcome::Retry => continue,
            }
        }
    }

    /// Suspend until both the route quota and the global gate allow a call.
    async fn wait_for_slot(&self, route: &mut RouteState) {
        loop {
            let now = Instant::now();
            let override_reset = route
                .reset_epoch
                .map(|r| self.clock.deadline(r.epoch_secs, r.received, r.local));
            if let Some(wait) = route.bucket.check(now, override_reset) {
                tracing::debug!(
                    bucket = %route.bucket.key(),
                    wait_ms = wait.as_millis() as u64,
                    "route exhausted, waiting for reset"
                );
                tokio::time::sleep(wait).await;
                continue;
            }
            if self.global.is_tripped() {
                self.global.wait().await;
                // the route may have been exhausted meanwhile
                continue;
            }
            return;
        }
    }

    async fn handle_response(
        &self,
        route: &mut RouteState,
        failures: &mut u32,
        response: RestResponse,
    ) -> Outcome {
        let now = Instant::now();
        let local = Utc::now();
        let headers = RateLimitHeaders::parse(&response.headers);
        if let Some(date) = headers.date {
            self.clock.record(date, local);
        }
        route.bucket.update(self.bucket_update(&headers, now, local));
        if headers.reset_after.is_some() {
            route.reset_epoch = None;
        } else if let Some(epoch_secs) = headers.reset {
            route.reset_epoch = Some(EpochReset {
                epoch_secs,
                received: now,
                local,
            });
        }

        match response.status {
            429 => {
                let limited = RateLimited::from_response(&headers, &response.body);
                if limited.global {
                    self.global.trip(limited.retry_after);
                } else {
                    tracing::warn!(
                        bucket = %route.bucket.key(),
                        scope = headers.scope.as_deref().unwrap_or("user"),
                        retry_after_ms = limited.retry_after.as_millis() as u64,
                        "route rate limited, bucket state was out of sync"
                    );
                    route.bucket.exhaust(now + limited.retry_after);
                    route.reset_epoch = None;
                }
                self.diagnose(RestDiagnostic::RateLimited {
                    bucket: route.bucket.key().to_string(),
                    retry_after: limited.retry_after,
                    global: limited.global,
                });
                Outcome::Retry
            }
            status if status >= 500 => {
                self.transient(route, failures, format!("server returned {status}"))
                    .await
            }
            401 => Outcome::Done(Err(RestError::Unauthorized(response.body))),
            status if status >= 400 => Outcome::Done(Err(RestError::Http {
                status,
                body: response.body,
            })),
            _ => Outcome::Done(Ok(response)),
        }
    }

    async fn transient(&self, route: &RouteState, failures: &mut u32, reason: String) -> Outcome {
        *failures += 1;
        if *failures > self.config.max_retries {
            tracing::error!(
                bucket = %route.bucket.key(),
                attempts = *failures,
                "giving up on request: {reason}"
            );
            return Outcome::Done(Err(RestError::RetriesExhausted {
                attempts: *failures,
                last: reason,
            }));
        }
        let delay = self.config.retry_delay * *failures;
        tracing::warn!(
            bucket = %route.bucket.key(),
            attempt = *failures,
            delay_ms = delay.as_millis() as u64,
            "transient failure, retrying: {reason}"
        );
        self.diagnose(RestDiagnostic::Retrying {
            bucket: route.bucket.key().to_string(),
            attempt: *failures,
            reason,
        });
        tokio::time::sleep(delay).await;
        Outcome::Retry
    }

    fn bucket_update(
        &self,
        headers: &RateLimitHeaders,
        now: Instant,
        local: DateTime<Utc>,
    ) -> BucketUpdate {
        let reset_at = match (headers.reset_after, headers.reset) {
            (Some(after), _) => Some(now + after),
            (None, Some(epoch)) => Some(self.clock.deadline(epoch, now, local)),
            (None, None) => None,
        };
        BucketUpdate {
            limit: headers.limit,
            remaining: headers.remaining,
            reset_at,
            reset_after: headers.reset_after,
            bucket_id: headers.bucket.clone(),
        }
    }

    fn diagnose(&self, event: RestDiagnostic) {
        if let Some(ref tx) = self.diagnostics {
            let _ = tx.send(event);
        }
    }
}
