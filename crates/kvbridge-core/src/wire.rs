//! Frames exchanged with the datastore process.
//!
//! Each frame is one JSON object followed by a single `\n`:
//!
//! - request: `{request_id, command, key?, keys?, value?}`
//! - response: `{request_id, data?, error?}`
//! - notification: `{type: "notification", data: {key, value, version, timestamp}}`
//!
//! Notifications carry no `request_id`; they are told apart by the `type`
//! discriminant, never by id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{BridgeError, Result};
use crate::ids::RequestId;
use crate::value::VersionedValue;

/// Frame delimiter.
pub const FRAME_DELIMITER: u8 = b'\n';

/// Discriminant value marking a notification frame.
pub const NOTIFICATION_TYPE: &str = "notification";

/// Datastore command verbs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    /// Read one key.
    Read,
    /// Write one key.
    Write,
    /// Start notifications for a key set.
    Subscribe,
    /// Stop notifications for a key set.
    Unsubscribe,
}

impl Command {
    /// Wire name, also used as a metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// A request body before the correlator assigns its id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IpcCommand {
    /// Verb.
    pub command: Command,
    /// Single key for read/write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Key set for subscribe/unsubscribe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    /// Payload for write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl IpcCommand {
    /// `read` for one key.
    pub fn read(key: impl Into<String>) -> Self {
        Self {
            command: Command::Read,
            key: Some(key.into()),
            keys: None,
            value: None,
        }
    }

    /// `write` of `value` to one key.
    pub fn write(key: impl Into<String>, value: Value) -> Self {
        Self {
            command: Command::Write,
            key: Some(key.into()),
            keys: None,
            value: Some(value),
        }
    }

    /// `subscribe` for a key set.
    pub fn subscribe(keys: Vec<String>) -> Self {
        Self {
            command: Command::Subscribe,
            key: None,
            keys: Some(keys),
            value: None,
        }
    }

    /// `unsubscribe` for a key set.
    pub fn unsubscribe(keys: Vec<String>) -> Self {
        Self {
            command: Command::Unsubscribe,
            key: None,
            keys: Some(keys),
            value: None,
        }
    }
}

/// A request frame on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IpcRequest {
    /// Correlation id.
    pub request_id: RequestId,
    /// Command body.
    #[serde(flatten)]
    pub body: IpcCommand,
}

/// A response frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    /// Correlation id echoed from the request.
    pub request_id: RequestId,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure message; presence marks the command as failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl IpcResponse {
    /// Successful response.
    pub fn ok(request_id: RequestId, data: Value) -> Self {
        Self {
            request_id,
            data: Some(data),
            error: None,
        }
    }

    /// Failed response.
    pub fn err(request_id: RequestId, message: impl Into<String>) -> Self {
        Self {
            request_id,
            data: None,
            error: Some(Value::String(message.into())),
        }
    }

    /// Collapse into the caller-facing result.
    ///
    /// A non-null `error` rejects with [`BridgeError::Remote`]; otherwise
    /// the `data` field (or `null`) resolves.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(Value::Null) | None => Ok(self.data.unwrap_or(Value::Null)),
            Some(Value::String(msg)) => Err(BridgeError::Remote(msg)),
            Some(other) => Err(BridgeError::Remote(other.to_string())),
        }
    }
}

/// The `data` body of a notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Key that changed.
    pub key: String,
    /// New value.
    #[serde(default)]
    pub value: Value,
    /// New version.
    pub version: u64,
    /// Raw timestamp as sent (epoch millis or ISO string).
    #[serde(default)]
    pub timestamp: Value,
}

impl Notification {
    /// Normalize into a [`VersionedValue`].
    pub fn to_versioned(&self) -> Result<VersionedValue> {
        Ok(VersionedValue {
            key: self.key.clone(),
            value: self.value.clone(),
            version: self.version,
            timestamp: crate::value::normalize_timestamp(&self.timestamp)?,
        })
    }
}

#[derive(Serialize)]
struct NotificationFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a Notification,
}

/// A decoded inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// Answer to a pending request.
    Response(IpcResponse),
    /// Unsolicited change notification.
    Notification(Notification),
    /// Valid JSON that is neither.
    Unrecognized(Value),
}

impl InboundFrame {
    /// Classify a parsed JSON frame.
    pub fn classify(frame: Value) -> Result<Self> {
        if frame.get("type").and_then(Value::as_str) == Some(NOTIFICATION_TYPE) {
            let data = frame
                .get("data")
                .cloned()
                .ok_or_else(|| BridgeError::Protocol("notification without data".into()))?;
            return Ok(Self::Notification(serde_json::from_value(data)?));
        }
        if frame.get("request_id").is_some() {
            return Ok(Self::Response(serde_json::from_value(frame)?));
        }
        Ok(Self::Unrecognized(frame))
    }

    /// Parse and classify one line of bytes (delimiter excluded).
    pub fn parse(line: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(line)?;
        Self::classify(value)
    }
}

/// Serialize a frame with its trailing delimiter.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(FRAME_DELIMITER);
    Ok(bytes)
}

/// Serialize a notification as the datastore process would send it.
pub fn encode_notification(notification: &Notification) -> Result<Vec<u8>> {
    encode_frame(&NotificationFrame {
        kind: NOTIFICATION_TYPE,
        data: notification,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn read_request_shape() {
        let req = IpcRequest {
            request_id: 1,
            body: IpcCommand::read("robot_mode"),
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"request_id": 1, "command": "read", "key": "robot_mode"})
        );
    }

    #[test]
    fn write_request_keeps_null_value() {
        let req = IpcRequest {
            request_id: 2,
            body: IpcCommand::write("k", Value::Null),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["command"], "write");
        assert!(v.as_object().unwrap().contains_key("value"));
    }

    #[test]
    fn subscribe_request_shape() {
        let req = IpcRequest {
            request_id: 3,
            body: IpcCommand::subscribe(vec!["a".into(), "b".into()]),
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"request_id": 3, "command": "subscribe", "keys": ["a", "b"]})
        );
    }

    #[test]
    fn encoded_frame_ends_with_single_newline() {
        let bytes = encode_frame(&json!({"a": 1})).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn response_with_error_rejects() {
        let resp: IpcResponse =
            serde_json::from_value(json!({"request_id": 4, "error": "Key 'x' not found"})).unwrap();
        assert_eq!(
            resp.into_result(),
            Err(BridgeError::Remote("Key 'x' not found".into()))
        );
    }

    #[test]
    fn response_with_null_error_resolves() {
        let resp: IpcResponse =
            serde_json::from_value(json!({"request_id": 4, "data": {"v": 1}, "error": null}))
                .unwrap();
        assert_eq!(resp.into_result(), Ok(json!({"v": 1})));
    }

    #[test]
    fn response_without_data_resolves_null() {
        let resp = IpcResponse {
            request_id: 5,
            data: None,
            error: None,
        };
        assert_eq!(resp.into_result(), Ok(Value::Null));
    }

    #[test]
    fn structured_error_is_stringified() {
        let resp: IpcResponse =
            serde_json::from_value(json!({"request_id": 6, "error": {"code": 7}})).unwrap();
        assert_matches!(resp.into_result(), Err(BridgeError::Remote(msg)) if msg.contains("7"));
    }

    #[test]
    fn classify_notification_by_type() {
        let frame = InboundFrame::parse(
            br#"{"type":"notification","data":{"key":"k","value":1,"version":2,"timestamp":3}}"#,
        )
        .unwrap();
        assert_matches!(frame, InboundFrame::Notification(n) if n.key == "k" && n.version == 2);
    }

    #[test]
    fn notification_with_request_id_still_notification() {
        let frame = InboundFrame::classify(json!({
            "type": "notification",
            "request_id": 9,
            "data": {"key": "k", "version": 1, "timestamp": 0}
        }))
        .unwrap();
        assert_matches!(frame, InboundFrame::Notification(_));
    }

    #[test]
    fn classify_response_by_id() {
        let frame = InboundFrame::parse(br#"{"request_id":7,"data":{"success":true}}"#).unwrap();
        assert_matches!(frame, InboundFrame::Response(r) if r.request_id == 7);
    }

    #[test]
    fn classify_unrecognized() {
        let frame = InboundFrame::parse(br#"{"hello":"world"}"#).unwrap();
        assert_matches!(frame, InboundFrame::Unrecognized(_));
    }

    #[test]
    fn malformed_json_is_protocol_error() {
        assert_matches!(InboundFrame::parse(b"{not json"), Err(BridgeError::Protocol(_)));
    }

    #[test]
    fn notification_missing_data_is_protocol_error() {
        assert_matches!(
            InboundFrame::classify(json!({"type": "notification"})),
            Err(BridgeError::Protocol(_))
        );
    }

    #[test]
    fn notification_encodes_with_discriminant() {
        let n = Notification {
            key: "k".into(),
            value: json!(true),
            version: 1,
            timestamp: json!(0),
        };
        let bytes = encode_notification(&n).unwrap();
        let parsed: Value = serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(parsed["type"], "notification");
        assert_eq!(parsed["data"]["key"], "k");
    }

    #[test]
    fn notification_to_versioned() {
        let n = Notification {
            key: "k".into(),
            value: json!([1, 2, 3]),
            version: 9,
            timestamp: json!("2024-01-01T00:00:00Z"),
        };
        let v = n.to_versioned().unwrap();
        assert_eq!(v.version, 9);
        assert_eq!(v.value, json!([1, 2, 3]));
    }
}
