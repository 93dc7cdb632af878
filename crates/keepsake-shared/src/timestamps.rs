//! Canonical RFC-3339 rendering for persisted timestamps.
//!
//! The store compares timestamps as text, so every persisted `DateTime`
//! field and every store-assigned timestamp uses one fixed fractional
//! precision. Variable precision (0/3/6/9 digits) would break
//! lexicographic ordering between instants inside the same second.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serializer};

/// Microsecond-precision RFC-3339, always six fractional digits.
pub fn canonical(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&canonical(dt))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(serde::de::Error::custom)
}
