use alloy::primitives::{hex::ToHexExt, Address, Bytes, FixedBytes};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inclusive window of wall-clock time used by queries and analytics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window of `length` ending at `end`.
    pub fn trailing(end: DateTime<Utc>, length: chrono::Duration) -> Self {
        Self {
            start: end - length,
            end,
        }
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        *ts >= self.start && *ts <= self.end
    }
}

pub trait ToHexString {
    fn to_hex_string(&self) -> String;
}

impl ToHexString for &[u8] {
    fn to_hex_string(&self) -> String {
        to_hex_string_internal(self)
    }
}

impl ToHexString for Address {
    fn to_hex_string(&self) -> String {
        to_hex_string_internal(self.as_slice())
    }
}

impl<const N: usize> ToHexString for FixedBytes<N> {
    fn to_hex_string(&self) -> String {
        to_hex_string_internal(self.as_slice())
    }
}

impl ToHexString for Bytes {
    fn to_hex_string(&self) -> String {
        to_hex_string_internal(&self.0)
    }
}

fn to_hex_string_internal(bytes: &[u8]) -> String {
    bytes.encode_hex_with_prefix()
}

/// Converts a chain timestamp to UTC. Values that look like milliseconds are
/// accepted as well as plain unix seconds.
pub fn unix_to_utc(timestamp: u64) -> DateTime<Utc> {
    let timestamp_ms = if timestamp < 1_000_000_000_000 {
        timestamp.saturating_mul(1000)
    } else {
        timestamp
    };

    let secs = (timestamp_ms / 1000) as i64;
    let nanos = ((timestamp_ms % 1000) * 1_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn seconds_and_millis_agree() {
        assert_eq!(unix_to_utc(1_700_000_000), unix_to_utc(1_700_000_000_000));
        assert_eq!(
            unix_to_utc(1_700_000_000),
            Utc.timestamp_opt(1_700_000_000, 0).unwrap()
        );
    }

    #[test]
    fn range_is_inclusive() {
        let start = unix_to_utc(100);
        let end = unix_to_utc(200);
        let range = TimeRange::new(start, end);
        assert!(range.contains(&start));
        assert!(range.contains(&end));
        assert!(!range.contains(&unix_to_utc(201)));
    }

    #[test]
    fn hex_is_prefixed_lowercase() {
        let addr = Address::repeat_byte(0xab);
        assert_eq!(
            addr.to_hex_string(),
            "0xabababababababababababababababababababab"
        );
    }
}
