//! Versioned datastore values.
//!
//! The datastore process reports timestamps either as integer epoch
//! milliseconds or as ISO-8601 strings. Both are normalized into a UTC
//! [`DateTime`] here so nothing downstream has to care which one arrived.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{BridgeError, Result};

/// A keyed value with its datastore version, as observed by the bridge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// Datastore key.
    pub key: String,
    /// Opaque payload.
    pub value: Value,
    /// Monotonic version assigned by the datastore.
    pub version: u64,
    /// When the datastore observed this version.
    pub timestamp: DateTime<Utc>,
}

/// Acknowledgement of a write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    /// Datastore key.
    pub key: String,
    /// Whether the datastore applied the write.
    pub success: bool,
    /// Version after the write.
    pub version: u64,
}

/// `data` body of a read response or notification.
#[derive(Debug, Deserialize)]
struct RawVersioned {
    #[serde(default)]
    value: Value,
    version: u64,
    #[serde(default)]
    timestamp: Value,
}

/// `data` body of a write response.
#[derive(Debug, Deserialize)]
struct RawWriteAck {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    version: u64,
}

impl VersionedValue {
    /// Build from the `data` field of a read response.
    pub fn from_data(key: impl Into<String>, data: Value) -> Result<Self> {
        let raw: RawVersioned = serde_json::from_value(data)?;
        Ok(Self {
            key: key.into(),
            value: raw.value,
            version: raw.version,
            timestamp: normalize_timestamp(&raw.timestamp)?,
        })
    }
}

impl WriteAck {
    /// Build from the `data` field of a write response.
    pub fn from_data(key: impl Into<String>, data: Value) -> Result<Self> {
        let raw: RawWriteAck = serde_json::from_value(data)?;
        Ok(Self {
            key: key.into(),
            success: raw.success,
            version: raw.version,
        })
    }
}

/// Normalize a wire timestamp into UTC.
///
/// Integers are epoch milliseconds. Strings are ISO-8601: RFC 3339 with an
/// offset, a date-time without one, or a bare date (midnight). Forms
/// without an offset are taken as UTC. A bare integer string is epoch
/// milliseconds.
pub fn normalize_timestamp(raw: &Value) -> Result<DateTime<Utc>> {
    match raw {
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| BridgeError::Protocol(format!("invalid timestamp: {n}")))?;
            from_millis(millis)
        }
        Value::String(s) => parse_iso(s.trim())
            .map(Ok)
            .or_else(|| s.trim().parse::<i64>().ok().map(from_millis))
            .unwrap_or_else(|| Err(BridgeError::Protocol(format!("invalid timestamp: {s}")))),
        other => Err(BridgeError::Protocol(format!("invalid timestamp: {other}"))),
    }
}

fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| BridgeError::Protocol(format!("timestamp out of range: {millis}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn epoch_millis_normalized() {
        let ts = normalize_timestamp(&json!(1_700_000_000_123_i64)).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn iso_string_normalized() {
        let ts = normalize_timestamp(&json!("2024-03-01T12:00:00.500Z")).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_709_294_400_500);
    }

    #[test]
    fn offset_string_converted_to_utc() {
        let ts = normalize_timestamp(&json!("2024-03-01T21:00:00+09:00")).unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn offsetless_datetime_taken_as_utc() {
        let ts = normalize_timestamp(&json!("2024-01-01T00:00:00.123")).unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-01-01T00:00:00.123+00:00");
        let ts = normalize_timestamp(&json!("2024-01-01T00:00:00")).unwrap();
        assert_eq!(ts.timestamp(), 1_704_067_200);
    }

    #[test]
    fn bare_date_is_midnight_utc() {
        let ts = normalize_timestamp(&json!("2024-01-01")).unwrap();
        assert_eq!(ts.timestamp(), 1_704_067_200);
    }

    #[test]
    fn versioned_accepts_offsetless_timestamp() {
        let v = VersionedValue::from_data(
            "k",
            json!({"value": 1, "version": 2, "timestamp": "2024-01-01T00:00:00.123"}),
        )
        .unwrap();
        assert_eq!(v.timestamp.timestamp_millis(), 1_704_067_200_123);
    }

    proptest! {
        #[test]
        fn millis_and_iso_forms_agree(millis in 0_i64..4_102_444_800_000) {
            let from_number = normalize_timestamp(&json!(millis)).unwrap();
            let iso = from_number.format("%Y-%m-%dT%H:%M:%S%.3f").to_string();
            let from_string = normalize_timestamp(&json!(iso)).unwrap();
            prop_assert_eq!(from_number, from_string);
            let from_rfc3339 = normalize_timestamp(&json!(from_number.to_rfc3339())).unwrap();
            prop_assert_eq!(from_number, from_rfc3339);
        }
    }

    #[test]
    fn numeric_string_treated_as_millis() {
        let ts = normalize_timestamp(&json!("1000")).unwrap();
        assert_eq!(ts.timestamp_millis(), 1000);
    }

    #[test]
    fn both_forms_agree() {
        let a = normalize_timestamp(&json!(1_709_294_400_500_i64)).unwrap();
        let b = normalize_timestamp(&json!("2024-03-01T12:00:00.500Z")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn garbage_is_protocol_error() {
        assert_matches!(
            normalize_timestamp(&json!("yesterday")),
            Err(BridgeError::Protocol(_))
        );
        assert_matches!(normalize_timestamp(&json!(null)), Err(BridgeError::Protocol(_)));
        assert_matches!(normalize_timestamp(&json!([1])), Err(BridgeError::Protocol(_)));
    }

    #[test]
    fn versioned_from_read_data() {
        let v = VersionedValue::from_data(
            "robot_mode",
            json!({"value": "AUTO", "version": 7, "timestamp": 1_000}),
        )
        .unwrap();
        assert_eq!(v.key, "robot_mode");
        assert_eq!(v.value, json!("AUTO"));
        assert_eq!(v.version, 7);
        assert_eq!(v.timestamp.timestamp_millis(), 1_000);
    }

    #[test]
    fn versioned_requires_version() {
        let err = VersionedValue::from_data("k", json!({"value": 1, "timestamp": 0})).unwrap_err();
        assert_matches!(err, BridgeError::Protocol(_));
    }

    #[test]
    fn versioned_serializes_rfc3339() {
        let v = VersionedValue::from_data("k", json!({"value": 1, "version": 1, "timestamp": 0}))
            .unwrap();
        let out = serde_json::to_value(&v).unwrap();
        assert_eq!(out["timestamp"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn write_ack_from_data() {
        let ack = WriteAck::from_data("k", json!({"success": true, "version": 3})).unwrap();
        assert_eq!(
            ack,
            WriteAck {
                key: "k".into(),
                success: true,
                version: 3
            }
        );
    }
}
