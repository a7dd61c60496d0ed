//! Duration (de)serialization helpers shared across config and report types.
//!
//! Durations round-trip as either a human-readable string (`"200ms"`, `"2s"`)
//! or a raw millisecond integer, so `docsd.toml` stays hand-editable while
//! persisted state files stay compact.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Deserialize a [`Duration`] from either a humantime string or a `u64` of milliseconds.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a [`Duration`] as milliseconds so it round-trips with [`deserialize_duration`].
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Like [`deserialize_duration`] but for an `Option<Duration>` field.
pub fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    match value {
        None => Ok(None),
        Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => humantime::parse_duration(&s)
            .map(Some)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        Some(serde_json::Value::Number(n)) => {
            let ms = n
                .as_u64()
                .ok_or_else(|| serde::de::Error::custom("duration milliseconds must be a non-negative integer"))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Some(other) => Err(serde::de::Error::custom(format!(
            "invalid duration value: {other}"
        ))),
    }
}

/// Like [`serialize_duration`] but for an `Option<Duration>` field.
pub fn serialize_duration_opt<S>(
    duration: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match duration {
        Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}
