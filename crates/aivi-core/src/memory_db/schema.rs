//! Column encodings shared by the SQLite repositories

use crate::error::DataIntegrityError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub total_knowledge_entries: i64,
    pub total_users: i64,
    pub total_sessions: i64,
    pub total_messages: i64,
    pub database_size_bytes: i64,
}

/// RFC 3339 with nanoseconds so timestamps survive a round trip unchanged.
pub fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn decode_timestamp(owner: &str, column: &str, raw: &str) -> Result<DateTime<Utc>, DataIntegrityError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| integrity(owner, format!("{}: invalid timestamp '{}': {}", column, raw, e)))
}

pub fn decode_json<T: serde::de::DeserializeOwned>(
    owner: &str,
    column: &str,
    raw: &str,
) -> Result<T, DataIntegrityError> {
    serde_json::from_str(raw).map_err(|e| integrity(owner, format!("{}: {}", column, e)))
}

pub fn integrity(owner: &str, detail: impl Into<String>) -> DataIntegrityError {
    DataIntegrityError {
        owner: owner.to_string(),
        detail: detail.into(),
    }
}

/// Keywords are stored as a comma-separated list.
pub fn encode_keywords(keywords: &[String]) -> String {
    keywords.join(",")
}

pub fn decode_keywords(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_round_trip_keeps_nanoseconds() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let encoded = encode_timestamp(&ts);
        assert_eq!(decode_timestamp("u", "ts", &encoded).unwrap(), ts);
    }

    #[test]
    fn test_decode_timestamp_reports_owner() {
        let err = decode_timestamp("alice", "last_active", "yesterday").unwrap_err();
        assert_eq!(err.owner, "alice");
        assert!(err.detail.contains("last_active"));
    }

    #[test]
    fn test_keyword_encoding() {
        let keywords = vec!["force".to_string(), "gravity".to_string()];
        assert_eq!(decode_keywords(&encode_keywords(&keywords)), keywords);
        assert!(decode_keywords("").is_empty());
    }
}
