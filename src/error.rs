use std::fmt;

/// Failures surfaced to callers of the REST pipeline.
///
/// Rate-limit responses never show up here: they are waited out and retried
/// inside the route's drain loop.
#[derive(Debug, Clone, PartialEq)]
pub enum RestError {
    /// The call was rejected before touching the network.
    InvalidRequest(String),
    /// The credential was refused (HTTP 401).
    Unauthorized(String),
    /// A non-retryable client error (4xx other than 401/429).
    Http { status: u16, body: String },
    /// Transient failures outlived the retry budget.
    RetriesExhausted { attempts: u32, last: String },
    /// The per-call timeout elapsed before a response arrived.
    Timeout,
    /// The executor was dropped while the call was queued.
    Closed,
    /// The response body could not be decoded into the requested type.
    Decode(String),
}

impl RestError {
    pub fn code(&self) -> &'static str {
        match self {
            RestError::InvalidRequest(_) => "invalid_request",
            RestError::Unauthorized(_) => "unauthorized",
            RestError::Http { .. } => "http_error",
            RestError::RetriesExhausted { .. } => "retries_exhausted",
            RestError::Timeout => "timeout",
            RestError::Closed => "closed",
            RestError::Decode(_) => "decode_error",
        }
    }

    /// HTTP status attached to the failure, if the server produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            RestError::Unauthorized(_) => Some(401),
            RestError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl fmt::Display for RestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            RestError::Unauthorized(body) => write!(f, "unauthorized: {body}"),
            RestError::Http { status, body } => write!(f, "server returned {status}: {body}"),
            RestError::RetriesExhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            RestError::Timeout => write!(f, "request timed out"),
            RestError::Closed => write!(f, "request executor closed"),
            RestError::Decode(e) => write!(f, "failed to decode response: {e}"),
        }
    }
}

impl std::error::Error for RestError {}

impl From<serde_json::Error> for RestError {
    fn from(e: serde_json::Error) -> Self {
        RestError::Decode(e.to_string())
    }
}

/// Failures surfaced by the gateway side.
///
/// Transport drops and rate limits are recovered internally and only show
/// up as lifecycle events; what remains here is what a caller must act on.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Identify was refused: the credential is invalid.
    AuthenticationFailed,
    /// The server closed with a code that forbids reconnecting.
    Fatal { code: u16, reason: String },
    /// A control call carried a payload the server would reject.
    InvalidRequest(String),
    /// The frame was dropped before it reached the socket.
    Cancelled,
    /// The shard task has stopped.
    Closed,
    /// The socket could not be opened.
    Transport(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::AuthenticationFailed => "authentication_failed",
            GatewayError::Fatal { .. } => "fatal_close",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Cancelled => "cancelled",
            GatewayError::Closed => "closed",
            GatewayError::Transport(_) => "transport_error",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::AuthenticationFailed => write!(f, "authentication failed"),
            GatewayError::Fatal { code, reason } => {
                write!(f, "gateway closed with fatal code {code}: {reason}")
            }
            GatewayError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            GatewayError::Cancelled => write!(f, "frame cancelled before send"),
            GatewayError::Closed => write!(f, "shard stopped"),
            GatewayError::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::Transport(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { var: &'static str, value: String },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Missing(_) => "missing_config",
            ConfigError::Invalid { .. } => "invalid_config",
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(var) => write!(f, "{var} is required"),
            ConfigError::Invalid { var, value } => write!(f, "{var} has invalid value {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rest_error_status() {
        assert_eq!(RestError::Unauthorized("no".into()).status(), Some(401));
        assert_eq!(
            RestError::Http {
                status: 404,
                body: String::new()
            }
            .status(),
            Some(404)
        );
        assert_eq!(RestError::Timeout.status(), None);
    }

    #[test]
    fn test_config_error_message() {
        let e = ConfigError::Missing("ACCORD_TOKEN");
        assert_eq!(e.to_string(), "ACCORD_TOKEN is required");
        assert_eq!(e.code(), "missing_config");
        let e = ConfigError::Invalid {
            var: "ACCORD_SHARDS",
            value: "x".into(),
        };
        assert_eq!(e.code(), "invalid_config");
    }
}
