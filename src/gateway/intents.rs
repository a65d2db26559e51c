pub const GUILDS: u64 = 1 << 0;
pub const GUILD_MEMBERS: u64 = 1 << 1;
pub const GUILD_MODERATION: u64 = 1 << 2;
pub const GUILD_EXPRESSIONS: u64 = 1 << 3;
pub const GUILD_INTEGRATIONS: u64 = 1 << 4;
pub const GUILD_WEBHOOKS: u64 = 1 << 5;
pub const GUILD_INVITES: u64 = 1 << 6;
pub const GUILD_VOICE_STATES: u64 = 1 << 7;
pub const GUILD_PRESENCES: u64 = 1 << 8;
pub const GUILD_MESSAGES: u64 = 1 << 9;
pub const GUILD_MESSAGE_REACTIONS: u64 = 1 << 10;
pub const GUILD_MESSAGE_TYPING: u64 = 1 << 11;
pub const DIRECT_MESSAGES: u64 = 1 << 12;
pub const DIRECT_MESSAGE_REACTIONS: u64 = 1 << 13;
pub const DIRECT_MESSAGE_TYPING: u64 = 1 << 14;
pub const MESSAGE_CONTENT: u64 = 1 << 15;
pub const GUILD_SCHEDULED_EVENTS: u64 = 1 << 16;

/// All valid intent names.
pub const ALL_INTENTS: &[(&str, u64)] = &[
    ("guilds", GUILDS),
    ("guild_moderation", GUILD_MODERATION),
    ("guild_expressions", GUILD_EXPRESSIONS),
    ("guild_integrations", GUILD_INTEGRATIONS),
    ("guild_webhooks", GUILD_WEBHOOKS),
    ("guild_invites", GUILD_INVITES),
    ("guild_voice_states", GUILD_VOICE_STATES),
    ("guild_messages", GUILD_MESSAGES),
    ("guild_message_reactions", GUILD_MESSAGE_REACTIONS),
    ("guild_message_typing", GUILD_MESSAGE_TYPING),
    ("direct_messages", DIRECT_MESSAGES),
    ("direct_message_reactions", DIRECT_MESSAGE_REACTIONS),
    ("direct_message_typing", DIRECT_MESSAGE_TYPING),
    ("guild_scheduled_events", GUILD_SCHEDULED_EVENTS),
    // Privileged
    ("guild_members", GUILD_MEMBERS),
    ("guild_presences", GUILD_PRESENCES),
    ("message_content", MESSAGE_CONTENT),
];

pub const PRIVILEGED_INTENTS: u64 = GUILD_MEMBERS | GUILD_PRESENCES | MESSAGE_CONTENT;

pub fn bit_for(name: &str) -> Option<u64> {
    ALL_INTENTS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, bit)| *bit)
}

/// Parse a comma separated list of intent names into a bitmask. `all` and
/// `unprivileged` are accepted as shorthands.
pub fn parse(list: &str) -> Result<u64, String> {
    let mut mask = 0;
    for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        mask |= match name.to_ascii_lowercase().as_str() {
            "all" => ALL_INTENTS.iter().fold(0, |acc, (_, bit)| acc | bit),
            "unprivileged" => {
                ALL_INTENTS.iter().fold(0, |acc, (_, bit)| acc | bit) & !PRIVILEGED_INTENTS
            }
            _ => bit_for(name).ok_or_else(|| name.to_string())?,
        };
    }
    Ok(mask)
}

/// Check if a mask declares the given intent.
pub fn has_intent(mask: u64, intent: u64) -> bool {
    mask & intent == intent
}

/// Names of the intents in a mask, in table order.
pub fn names(mask: u64) -> Vec<&'static str> {
    ALL_INTENTS
        .iter()
        .filter(|(_, bit)| mask & bit != 0)
        .map(|(name, _)| *name)
        .collect()
}
