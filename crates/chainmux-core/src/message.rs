//! Wire types: outbound subscribe/unsubscribe messages and inbound frames.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MuxError;

/// Direction of an outbound subscription message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Subscribe,
    Unsubscribe,
}

/// Outbound wire message:
/// `{ "type": "subscribe" | "unsubscribe", "event", "filters", "changed"? }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub event: String,
    pub filters: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed: Option<String>,
}

impl OutboundMessage {
    /// Serialize to the text payload sent over the socket.
    pub fn to_json(&self) -> Result<String, MuxError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A validated inbound event frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundFrame {
    pub event: String,
    pub data: Map<String, Value>,
    /// Routing tags attached by the broker (e.g. `contract`).
    #[serde(default)]
    pub tags: Map<String, Value>,
    /// Fields whose change triggered this frame.
    #[serde(default)]
    pub changed: Vec<String>,
}

/// Result of classifying one text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A marketplace event to dispatch to handlers.
    Event(InboundFrame),
    /// Broker acknowledgement or connection notice: a frame with a `type`
    /// but no `event`, e.g. `{"type":"connection","status":"ready"}`.
    /// Never dispatched.
    Control { kind: String, status: Option<String> },
}

impl Inbound {
    /// Validate and parse a text frame.
    pub fn parse(text: &str) -> Result<Self, MuxError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| MuxError::malformed(format!("not JSON: {e}")))?;
        let Value::Object(obj) = value else {
            return Err(MuxError::malformed("frame is not a JSON object"));
        };

        if obj.contains_key("event") {
            return parse_event(obj).map(Self::Event);
        }

        match obj.get("type").and_then(Value::as_str) {
            Some(kind) => Ok(Self::Control {
                kind: kind.to_string(),
                status: obj.get("status").and_then(Value::as_str).map(String::from),
            }),
            None => Err(MuxError::malformed("missing `event`")),
        }
    }
}

fn parse_event(obj: Map<String, Value>) -> Result<InboundFrame, MuxError> {
    match obj.get("event") {
        Some(Value::String(e)) if !e.is_empty() => {}
        Some(Value::String(_)) => return Err(MuxError::malformed("empty `event`")),
        _ => return Err(MuxError::malformed("`event` is not a string")),
    }
    match obj.get("data") {
        Some(Value::Object(_)) => {}
        Some(_) => return Err(MuxError::malformed("`data` is not an object")),
        None => return Err(MuxError::malformed("missing `data`")),
    }
    serde_json::from_value(Value::Object(obj)).map_err(|e| MuxError::malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_wire_shape() {
        let msg = OutboundMessage {
            kind: MessageKind::Subscribe,
            event: "token.updated".into(),
            filters: BTreeMap::from([("contract".to_string(), Value::from("0xabc"))]),
            changed: None,
        };
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"type":"subscribe","event":"token.updated","filters":{"contract":"0xabc"}}"#
        );
    }

    #[test]
    fn parses_event_frame() {
        let text = r#"{
            "type": "event",
            "event": "token.updated",
            "tags": { "contract": "0xabc" },
            "changed": ["market.floorAskNormalized.price.gross.amount"],
            "data": { "token": { "contract": "0xabc", "tokenId": "7" } }
        }"#;
        let Inbound::Event(frame) = Inbound::parse(text).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(frame.event, "token.updated");
        assert_eq!(frame.data["token"]["tokenId"], "7");
        assert_eq!(frame.changed.len(), 1);
    }

    #[test]
    fn parses_control_frame() {
        let ready = Inbound::parse(r#"{"type":"connection","status":"ready","data":{"id":"x"}}"#)
            .unwrap();
        assert!(matches!(ready, Inbound::Control { ref kind, .. } if kind == "connection"));

        let ack = Inbound::parse(r#"{"type":"subscribe","status":"success"}"#).unwrap();
        assert_eq!(
            ack,
            Inbound::Control {
                kind: "subscribe".into(),
                status: Some("success".into())
            }
        );
    }

    #[test]
    fn rejects_missing_fields() {
        for text in [
            r#"{"event":"token.updated"}"#,
            r#"{"data":{}}"#,
            r#"{"type":"event","event":"token.updated","data":null}"#,
            r#"{"event":"","data":{}}"#,
            r#"{"event":42,"data":{}}"#,
            r#"{"event":"token.updated","data":[1,2]}"#,
            r#"{"status":"ok"}"#,
            r#"[1,2,3]"#,
            "not json at all",
        ] {
            assert!(
                matches!(Inbound::parse(text), Err(MuxError::MalformedFrame { .. })),
                "accepted malformed frame: {text}"
            );
        }
    }
}
