use serde::{Deserialize, Serialize};

/// Opcodes for gateway messages.
pub mod opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const PRESENCE_UPDATE: u8 = 3;
    pub const VOICE_STATE_UPDATE: u8 = 4;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const REQUEST_GUILD_MEMBERS: u8 = 8;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Close codes.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const UNKNOWN_ERROR: u16 = 4000;
    pub const UNKNOWN_OPCODE: u16 = 4001;
    pub const DECODE_ERROR: u16 = 4002;
    pub const NOT_AUTHENTICATED: u16 = 4003;
    pub const AUTH_FAILED: u16 = 4004;
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    pub const INVALID_SEQ: u16 = 4007;
    pub const RATE_LIMITED: u16 = 4008;
    pub const SESSION_TIMED_OUT: u16 = 4009;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;
    pub const INVALID_VERSION: u16 = 4012;
    pub const INVALID_INTENT: u16 = 4013;
    pub const DISALLOWED_INTENT: u16 = 4014;

    /// Codes after which reconnecting cannot succeed.
    pub fn is_fatal(code: u16) -> bool {
        matches!(
            code,
            AUTH_FAILED
                | INVALID_SHARD
                | SHARDING_REQUIRED
                | INVALID_VERSION
                | INVALID_INTENT
                | DISALLOWED_INTENT
        )
    }

    /// Whether the session survives a close with this code.
    pub fn is_resumable(code: u16) -> bool {
        !is_fatal(code)
            && !matches!(
                code,
                NORMAL | NOT_AUTHENTICATED | INVALID_SEQ | SESSION_TIMED_OUT
            )
    }

    pub fn describe(code: u16) -> &'static str {
        match code {
            NORMAL => "normal closure",
            GOING_AWAY => "going away",
            UNKNOWN_ERROR => "unknown error",
            UNKNOWN_OPCODE => "unknown opcode",
            DECODE_ERROR => "decode error",
            NOT_AUTHENTICATED => "not authenticated",
            AUTH_FAILED => "authentication failed",
            ALREADY_AUTHENTICATED => "already authenticated",
            INVALID_SEQ => "invalid sequence",
            RATE_LIMITED => "rate limited",
            SESSION_TIMED_OUT => "session timed out",
            INVALID_SHARD => "invalid shard",
            SHARDING_REQUIRED => "sharding required",
            INVALID_VERSION => "invalid API version",
            INVALID_INTENT => "invalid intents",
            DISALLOWED_INTENT => "disallowed intents",
            _ => "unrecognized close code",
        }
    }
}

/// Gateway message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(rename = "d", default)]
    pub data: serde_json::Value,
}

impl GatewayMessage {
    pub fn new(op: u8, data: impl Serialize) -> Self {
        Self {
            op,
            seq: None,
            event_type: None,
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// HELLO payload data.
#[derive(Debug, Deserialize)]
pub struct HelloData {
    pub heartbeat_interval: u64,
    #[serde(default, rename = "_trace")]
    pub trace: Option<Vec<String>>,
}

/// READY dispatch fields the connection itself needs.
#[derive(Debug, Deserialize)]
pub struct ReadyData {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "accordlink".to_string(),
            device: "accordlink".to_string(),
        }
    }
}

/// IDENTIFY payload data.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyData {
    pub token: String,
    pub properties: IdentifyProperties,
    pub compress: bool,
    pub large_threshold: u32,
    pub shard: [u32; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceUpdateData>,
    pub intents: u64,
}

/// RESUME payload data.
#[derive(Debug, Clone, Serialize)]
pub struct ResumeData {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// PRESENCE_UPDATE (opcode 3) payload data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdateData {
    /// Unix milliseconds since the client went idle.
    pub since: Option<u64>,
    pub activities: Vec<serde_json::Value>,
    pub status: String,
    pub afk: bool,
}

impl PresenceUpdateData {
    pub const STATUSES: [&'static str; 5] = ["online", "dnd", "idle", "invisible", "offline"];

    pub fn online() -> Self {
        Self {
            since: None,
            activities: Vec::new(),
            status: "online".to_string(),
            afk: false,
        }
    }
}

/// VOICE_STATE_UPDATE (opcode 4) payload data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceStateUpdateData {
    pub guild_id: String,
    /// `None` leaves voice.
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// REQUEST_GUILD_MEMBERS (opcode 8) payload data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestGuildMembersData {
    pub guild_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub limit: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub presences: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}
