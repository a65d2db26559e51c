use futures_util::future::BoxFuture;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;

use crate::error::RestError;

pub const USER_AGENT: &str = concat!(
    "DiscordBot (https://github.com/DaccordProject/accordlink, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// A fully resolved outbound call, as handed to the transport.
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl RestResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RestError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Why a call produced no response at all.
#[derive(Debug, Clone)]
pub struct TransportError(pub String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError(e.to_string())
    }
}

/// The HTTP exchange itself. The executor owns everything around it:
/// queueing, quota, retries.
pub trait HttpTransport: Send + Sync + 'static {
    fn send(&self, request: RestRequest) -> BoxFuture<'static, Result<RestResponse, TransportError>>;
}

/// Production transport backed by `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: None,
        }
    }

    /// Bot credential sent as `Authorization: Bot <token>`.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref token) = self.auth_token {
            builder.header("Authorization", format!("Bot {token}"))
        } else {
            builder
        }
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: RestRequest) -> BoxFuture<'static, Result<RestResponse, TransportError>> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .request(request.method, &url)
            .header("User-Agent", USER_AGENT);
        builder = self.apply_auth(builder);
        if let Some(reason) = request.reason {
            // the header must be URI-encoded; fall back to omitting it
            if let Ok(value) = HeaderValue::from_str(&encode_reason(&reason)) {
                builder = builder.header("X-Audit-Log-Reason", value);
            }
        }
        if let Some(body) = request.body {
            builder = builder.json(&body);
        }

        Box::pin(async move {
            let resp = builder.send().await?;
            let status = resp.status().as_u16();
            let headers = resp.headers().clone();
            let body = resp.text().await?;
            Ok(RestResponse {
                status,
                headers,
                body,
            })
        })
    }
}

fn encode_reason(reason: &str) -> String {
    let mut out = String::with_capacity(reason.len());
    for byte in reason.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
