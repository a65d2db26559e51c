use std::ops::RangeInclusive;
use std::time::Duration;

use crate::error::ConfigError;
use crate::gateway::{intents, GatewayConfig, ReconnectPolicy};
use crate::rest::RestConfig;

pub const DEFAULT_API_URL: &str = "https://discord.com/api/v10";
pub const DEFAULT_INTENTS: &str = "guilds,guild_messages";

#[derive(Debug, Clone)]
pub struct Config {
    pub token: String,
    pub api_url: String,
    /// Gateway endpoint; discovered through the REST API when unset.
    pub gateway_url: Option<String>,
    pub shard_count: Option<u32>,
    /// Shards this process runs. Defaults to all of them.
    pub shards: Option<RangeInclusive<u32>>,
    pub max_concurrency: Option<u32>,
    pub intents: u64,
    pub reconnect: ReconnectPolicy,
    pub request_timeout: Duration,
    pub max_retries: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = std::env::var("ACCORD_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::Missing("ACCORD_TOKEN"))?;

        let intents_list =
            std::env::var("ACCORD_INTENTS").unwrap_or_else(|_| DEFAULT_INTENTS.to_string());
        let intents = intents::parse(&intents_list).map_err(|name| ConfigError::Invalid {
            var: "ACCORD_INTENTS",
            value: name,
        })?;

        let reconnect = match std::env::var("ACCORD_RECONNECT") {
            Ok(v) => v.parse().map_err(|_| ConfigError::Invalid {
                var: "ACCORD_RECONNECT",
                value: v,
            })?,
            Err(_) => ReconnectPolicy::Auto,
        };

        let shards = match std::env::var("ACCORD_SHARDS") {
            Ok(v) => Some(parse_shard_range(&v).ok_or(ConfigError::Invalid {
                var: "ACCORD_SHARDS",
                value: v,
            })?),
            Err(_) => None,
        };

        Ok(Self {
            token,
            api_url: std::env::var("ACCORD_API_URL")
                .unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
            gateway_url: std::env::var("ACCORD_GATEWAY_URL").ok(),
            shard_count: parse_var("ACCORD_SHARD_COUNT")?,
            shards,
            max_concurrency: parse_var("ACCORD_MAX_CONCURRENCY")?,
            intents,
            reconnect,
            request_timeout: Duration::from_millis(
                parse_var("ACCORD_REQUEST_TIMEOUT_MS")?.unwrap_or(15_000),
            ),
            max_retries: parse_var("ACCORD_MAX_RETRIES")?.unwrap_or(3),
        })
    }

    pub fn rest_config(&self) -> RestConfig {
        RestConfig {
            max_retries: self.max_retries,
            request_timeout: self.request_timeout,
            ..RestConfig::default()
        }
    }

    /// Gateway settings once the endpoint and sharding are known.
    pub fn gateway_config(&self, url: &str, shard_count: u32, max_concurrency: u32) -> GatewayConfig {
        let mut config = GatewayConfig::new(&self.token, url, shard_count);
        config.intents = self.intents;
        config.reconnect = self.reconnect;
        config.max_concurrency = max_concurrency.max(1);
        config
    }

    /// Shard ids this process should spawn, clamped to `shard_count`.
    pub fn shard_range(&self, shard_count: u32) -> RangeInclusive<u32> {
        let last = shard_count.max(1) - 1;
        match self.shards {
            Some(ref range) => *range.start()..=(*range.end()).min(last),
            None => 0..=last,
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: v }),
        Err(_) => Ok(None),
    }
}

/// `first..=last`, `first..last` or a single id.
pub fn parse_shard_range(s: &str) -> Option<RangeInclusive<u32>> {
    let s = s.trim();
    let range = if let Some((a, b)) = s.split_once("..=") {
        a.trim().parse().ok()?..=b.trim().parse().ok()?
    } else if let Some((a, b)) = s.split_once("..") {
        let end: u32 = b.trim().parse().ok()?;
        a.trim().parse().ok()?..=end.checked_sub(1)?
    } else {
        let id = s.parse().ok()?;
        id..=id
    };
    (range.start() <= range.end()).then_some(range)
}
