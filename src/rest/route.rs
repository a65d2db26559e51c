use std::fmt;

use reqwest::Method;

use crate::snowflake;

const TWO_WEEKS_MS: u64 = 14 * 24 * 60 * 60 * 1000;
const FRESH_MESSAGE_MS: u64 = 10 * 1000;
/// Webhook tokens are long opaque strings; ids never get this long.
const MIN_WEBHOOK_TOKEN_LEN: usize = 64;

/// One REST call target: a method plus a concrete path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub method: Method,
    pub path: String,
}

impl Route {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// Path classification table: which resource names are major parameters.
///
/// Ids following a major resource stay in the bucket key; every other id is
/// folded into `:id`. The server does not publish this mapping, so it is
/// data rather than code and can be adjusted from observed traffic.
#[derive(Debug, Clone)]
pub struct RouteTable {
    major: Vec<String>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(["channels", "guilds", "webhooks"])
    }
}

impl RouteTable {
    pub fn new<I, S>(major: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            major: major.into_iter().map(Into::into).collect(),
        }
    }

    fn is_major(&self, resource: &str) -> bool {
        self.major.iter().any(|m| m == resource)
    }

    /// Bucket key for a route, evaluated at `now_ms` (Unix milliseconds).
    pub fn bucket_key(&self, route: &Route, now_ms: u64) -> String {
        let path = route.path.split(['?', '#']).next().unwrap_or("");
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let mut key = String::with_capacity(path.len());
        let mut prev: Option<&str> = None;
        let mut after_reactions = 0u8;
        for (i, segment) in segments.iter().enumerate() {
            key.push('/');
            let folded = if after_reactions > 0 {
                after_reactions -= 1;
                if after_reactions == 1 {
                    ":emoji"
                } else {
                    ":user"
                }
            } else if snowflake::is_snowflake(segment) {
                match prev {
                    Some(resource) if self.is_major(resource) => segment,
                    _ => ":id",
                }
            } else if i == 2
                && segments[0] == "webhooks"
                && segment.len() >= MIN_WEBHOOK_TOKEN_LEN
            {
                ":token"
            } else {
                segment
            };
            if *segment == "reactions" {
                after_reactions = 2;
            }
            key.push_str(folded);
            prev = Some(segment);
        }
        if key.is_empty() {
            key.push('/');
        }

        let mut method = route.method.as_str().to_string();
        if route.method == Method::DELETE && key.ends_with("/messages/:id") {
            if let Some(created) = segments.last().and_then(|id| snowflake::timestamp_of(id)) {
                let age = now_ms.saturating_sub(created);
                if age >= TWO_WEEKS_MS {
                    method.push_str("_OLD");
                } else if age <= FRESH_MESSAGE_MS {
                    method.push_str("_NEW");
                }
            }
        }
        format!("{method} {key}")
    }
}
