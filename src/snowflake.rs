// Platform epoch: 2015-01-01T00:00:00Z
const EPOCH: u64 = 1_420_070_400_000;

/// Shortest id the platform hands out; anything shorter is a plain number.
const MIN_SNOWFLAKE_LEN: usize = 15;

/// Whether a path segment looks like an entity id.
pub fn is_snowflake(segment: &str) -> bool {
    segment.len() >= MIN_SNOWFLAKE_LEN
        && segment.len() <= 20
        && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Creation time of an id, in milliseconds since the Unix epoch.
pub fn timestamp_of(id: &str) -> Option<u64> {
    let num: u64 = id.parse().ok()?;
    Some((num >> 22) + EPOCH)
}

/// Build an id whose embedded timestamp is `unix_ms`.
pub fn from_timestamp(unix_ms: u64) -> String {
    (unix_ms.saturating_sub(EPOCH) << 22).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_extraction() {
        // 175928847299117063 was created 2016-04-30T11:18:25.796Z
        assert_eq!(timestamp_of("175928847299117063"), Some(1_462_015_105_796));
    }

    #[test]
    fn test_from_timestamp_round_trips() {
        let ts = 1_700_000_000_123;
        assert_eq!(timestamp_of(&from_timestamp(ts)), Some(ts));
    }

    #[test]
    fn test_is_snowflake() {
        assert!(is_snowflake("175928847299117063"));
        assert!(!is_snowflake("42"));
        assert!(!is_snowflake("messages"));
        assert!(!is_snowflake("17592884729911706x"));
    }

    #[test]
    fn test_invalid_id() {
        assert_eq!(timestamp_of("abc"), None);
    }
}
