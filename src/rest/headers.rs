use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::Deserialize;

pub const LIMIT: &str = "x-ratelimit-limit";
pub const REMAINING: &str = "x-ratelimit-remaining";
pub const RESET: &str = "x-ratelimit-reset";
pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const BUCKET: &str = "x-ratelimit-bucket";
pub const GLOBAL: &str = "x-ratelimit-global";
pub const SCOPE: &str = "x-ratelimit-scope";
pub const RETRY_AFTER: &str = "retry-after";
pub const DATE: &str = "date";

/// Rate-limit metadata carried by every response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Absolute reset, in seconds since the Unix epoch (server clock).
    pub reset: Option<f64>,
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
    pub global: bool,
    pub scope: Option<String>,
    pub retry_after: Option<Duration>,
    pub date: Option<DateTime<Utc>>,
}

impl RateLimitHeaders {
    pub fn parse(headers: &HeaderMap) -> Self {
        Self {
            limit: parse_num(headers, LIMIT),
            remaining: parse_num(headers, REMAINING),
            reset: parse_num(headers, RESET),
            reset_after: parse_num::<f64>(headers, RESET_AFTER).and_then(secs),
            bucket: header_str(headers, BUCKET).map(str::to_string),
            global: header_str(headers, GLOBAL)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            scope: header_str(headers, SCOPE).map(str::to_string),
            retry_after: parse_num::<f64>(headers, RETRY_AFTER).and_then(secs),
            date: header_str(headers, DATE)
                .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                .map(|d| d.with_timezone(&Utc)),
        }
    }

    /// Whether any quota information was present at all.
    pub fn is_empty(&self) -> bool {
        self.limit.is_none()
            && self.remaining.is_none()
            && self.reset.is_none()
            && self.reset_after.is_none()
    }
}

/// JSON body of a 429 response.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitedBody {
    #[serde(default)]
    pub message: String,
    pub retry_after: f64,
    #[serde(default)]
    pub global: bool,
}

/// The suspension a 429 demands, merged from its headers and body.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimited {
    pub retry_after: Duration,
    pub global: bool,
}

impl RateLimited {
    /// Body values take precedence: they carry sub-second precision.
    pub fn from_response(headers: &RateLimitHeaders, body: &str) -> Self {
        let parsed = serde_json::from_str::<RateLimitedBody>(body).ok();
        let retry_after = parsed
            .as_ref()
            .and_then(|b| secs(b.retry_after))
            .or(headers.retry_after)
            .or(headers.reset_after)
            .unwrap_or(Duration::from_secs(1));
        let global = headers.global || parsed.map(|b| b.global).unwrap_or(false);
        Self {
            retry_after,
            global,
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn parse_num<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}

fn secs(value: f64) -> Option<Duration> {
    (value.is_finite() && value >= 0.0).then(|| Duration::from_secs_f64(value))
}
