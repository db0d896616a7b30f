use chrono::{DateTime, SecondsFormat, Utc};
use std::time::Duration;

pub fn get_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(timestamp: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Time passed since the given RFC 3339 timestamp, zero if it lies in the future.
pub fn elapsed_since(timestamp: &str) -> Option<Duration> {
    let start = parse_timestamp(timestamp)?;
    Some((Utc::now() - start).to_std().unwrap_or_default())
}
