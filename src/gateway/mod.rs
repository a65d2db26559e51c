//! Realtime gateway: per-shard protocol state machines and the supervisor
//! that admits their connects.

pub mod backoff;
pub mod events;
pub mod heartbeat;
pub mod intents;
pub mod session;
pub mod shard;
pub mod socket;
pub mod supervisor;

use std::time::Duration;

pub use backoff::{Backoff, ReconnectPolicy};
pub use events::{PresenceUpdateData, RequestGuildMembersData, VoiceStateUpdateData};
pub use shard::{DisconnectReason, ShardHandle, ShardState, ShardStatus};
pub use socket::{Connector, SocketCommand, SocketEvent, SocketHandle, WsConnector};
pub use supervisor::ConnectionSupervisor;

pub const API_VERSION: u8 = 10;

/// Everything delivered upward from the gateway, on a single stream.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// A validated dispatch, in sequence order for its shard.
    Dispatch {
        shard_id: u32,
        event: String,
        sequence: u64,
        data: serde_json::Value,
    },
    /// The socket opened; the handshake has not happened yet.
    Connected { shard_id: u32 },
    Ready { shard_id: u32, session_id: String },
    Resumed { shard_id: u32 },
    Disconnected {
        shard_id: u32,
        reason: DisconnectReason,
    },
    Reconnecting {
        shard_id: u32,
        delay: Duration,
        attempt: u32,
    },
}

impl GatewayEvent {
    pub fn shard_id(&self) -> u32 {
        match self {
            GatewayEvent::Dispatch { shard_id, .. }
            | GatewayEvent::Connected { shard_id }
            | GatewayEvent::Ready { shard_id, .. }
            | GatewayEvent::Resumed { shard_id }
            | GatewayEvent::Disconnected { shard_id, .. }
            | GatewayEvent::Reconnecting { shard_id, .. } => *shard_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub token: String,
    /// Gateway endpoint, without query string.
    pub url: String,
    pub shard_count: u32,
    /// Capability bitmask sent with identify.
    pub intents: u64,
    pub large_threshold: u32,
    /// Presence announced in the identify frame.
    pub presence: Option<PresenceUpdateData>,
    /// Size of the server's identify concurrency grouping.
    pub max_concurrency: u32,
    /// Minimum spacing between two connects in the same concurrency bucket.
    pub identify_spacing: Duration,
    /// Minimum spacing between any two connects.
    pub min_connect_delay: Duration,
    /// Limit for opening the socket, and separately for receiving hello.
    pub connect_timeout: Duration,
    pub heartbeat_jitter: f64,
    pub reconnect: ReconnectPolicy,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: f64,
    /// Consecutive failed reconnects before a shard gives up. `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Consecutive resumes that fail to reach ready before identifying instead.
    pub max_resume_attempts: u32,
    pub send_limit: u32,
    pub send_window: Duration,
    /// Part of `send_limit` kept for heartbeats and handshake frames.
    pub send_reserved: u32,
    pub presence_limit: u32,
    pub presence_window: Duration,
}

impl GatewayConfig {
    pub fn new(token: impl Into<String>, url: impl Into<String>, shard_count: u32) -> Self {
        Self {
            token: token.into(),
            url: url.into(),
            shard_count: shard_count.max(1),
            intents: intents::GUILDS | intents::GUILD_MESSAGES,
            large_threshold: 250,
            presence: None,
            max_concurrency: 1,
            identify_spacing: Duration::from_secs(5),
            min_connect_delay: Duration::ZERO,
            connect_timeout: Duration::from_secs(30),
            heartbeat_jitter: heartbeat::DEFAULT_HEARTBEAT_JITTER,
            reconnect: ReconnectPolicy::Auto,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            backoff_jitter: 0.2,
            max_reconnect_attempts: None,
            max_resume_attempts: 10,
            send_limit: 120,
            send_window: Duration::from_secs(60),
            send_reserved: 5,
            presence_limit: 5,
            presence_window: Duration::from_secs(20),
        }
    }

    /// Full socket URL for `base`, with version and encoding appended.
    pub fn connect_url(&self, base: &str) -> String {
        if base.contains('?') {
            return base.to_string();
        }
        format!(
            "{}/?v={API_VERSION}&encoding=json",
            base.trim_end_matches('/')
        )
    }

    /// Shard that receives events for a guild.
    pub fn shard_for_guild(&self, guild_id: &str) -> Option<u32> {
        let id: u64 = guild_id.parse().ok()?;
        Some(((id >> 22) % u64::from(self.shard_count)) as u32)
    }
}
