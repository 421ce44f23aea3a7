//! Subscription specs and their canonical keys.
//!
//! A [`SubscriptionSpec`] is "what a component wants to hear about": an event
//! name, a filter set and an optional watched field. Its [`SubscriptionKey`]
//! is derived deterministically, so two components asking for the same thing
//! share one server-side subscription no matter how they built their filters.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{InboundFrame, MessageKind, OutboundMessage};

/// Canonical identifier of one subscription within a chain.
///
/// Rendered as `event[:filter=value]*[:changed=field]`, filters in key order,
/// e.g. `token.updated:contract=0xabc:changed=price`.
///
/// The rendering is injective. `\`, `:`, `=` and `#` inside any component
/// are backslash-escaped, non-string filter values are written as `#` plus
/// their JSON, and a filter literally named `changed` is written `\changed`
/// so it cannot be read as the watched field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SubscriptionKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubscriptionKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied description of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub event: String,
    /// Filter set; a sorted map so insertion order never leaks into the key.
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed: Option<String>,
}

impl SubscriptionSpec {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            filters: BTreeMap::new(),
            changed: None,
        }
    }

    /// Add a filter. A later value for the same name replaces the earlier one.
    pub fn filter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(name.into(), value.into());
        self
    }

    /// Only notify when this field changed.
    pub fn changed(mut self, field: impl Into<String>) -> Self {
        self.changed = Some(field.into());
        self
    }

    /// Derive the canonical key.
    pub fn key(&self) -> SubscriptionKey {
        let mut key = String::new();
        push_escaped(&mut key, &self.event);
        for (name, value) in &self.filters {
            key.push(':');
            if name == WATCHED {
                key.push('\\');
            }
            push_escaped(&mut key, name);
            key.push('=');
            match value {
                Value::String(s) => push_escaped(&mut key, s),
                other => {
                    key.push('#');
                    push_escaped(&mut key, &other.to_string());
                }
            }
        }
        if let Some(changed) = &self.changed {
            key.push(':');
            key.push_str(WATCHED);
            key.push('=');
            push_escaped(&mut key, changed);
        }
        SubscriptionKey(key)
    }

    pub fn subscribe_message(&self) -> OutboundMessage {
        self.message(MessageKind::Subscribe)
    }

    pub fn unsubscribe_message(&self) -> OutboundMessage {
        self.message(MessageKind::Unsubscribe)
    }

    fn message(&self, kind: MessageKind) -> OutboundMessage {
        OutboundMessage {
            kind,
            event: self.event.clone(),
            filters: self.filters.clone(),
            changed: self.changed.clone(),
        }
    }

    /// Returns `true` if an inbound frame belongs to this subscription.
    ///
    /// The event name must match exactly. Each filter must be satisfied by
    /// the frame's `tags`, or failing that by the first field of the same
    /// name found anywhere in `data`. String values compare ASCII
    /// case-insensitively; an array filter value matches any of its elements.
    /// The watched field is not checked: the broker already applied it.
    pub fn matches(&self, frame: &InboundFrame) -> bool {
        if frame.event != self.event {
            return false;
        }
        self.filters.iter().all(|(name, expected)| {
            let found = frame
                .tags
                .get(name)
                .or_else(|| find_field(&frame.data, name));
            match found {
                Some(actual) => filter_accepts(expected, actual),
                None => false,
            }
        })
    }
}

const WATCHED: &str = "changed";

fn push_escaped(out: &mut String, s: &str) {
    for c in s.chars() {
        if matches!(c, '\\' | ':' | '=' | '#') {
            out.push('\\');
        }
        out.push(c);
    }
}

fn find_field<'a>(map: &'a serde_json::Map<String, Value>, name: &str) -> Option<&'a Value> {
    if let Some(v) = map.get(name) {
        return Some(v);
    }
    map.values().find_map(|v| match v {
        Value::Object(inner) => find_field(inner, name),
        _ => None,
    })
}

fn filter_accepts(expected: &Value, actual: &Value) -> bool {
    match expected {
        Value::Array(options) => options.iter().any(|o| value_eq(o, actual)),
        single => value_eq(single, actual),
    }
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(v: Value) -> InboundFrame {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn key_matches_documented_format() {
        let spec = SubscriptionSpec::new("token.updated")
            .filter("contract", "0xabc")
            .changed("price");
        assert_eq!(spec.key().as_str(), "token.updated:contract=0xabc:changed=price");
    }

    #[test]
    fn key_ignores_filter_construction_order() {
        let a = SubscriptionSpec::new("ask.created")
            .filter("contract", "0xabc")
            .filter("maker", "0xdef");
        let b = SubscriptionSpec::new("ask.created")
            .filter("maker", "0xdef")
            .filter("contract", "0xabc");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn key_distinguishes_watched_field() {
        let base = SubscriptionSpec::new("token.updated").filter("contract", "0xabc");
        let id = base.clone().changed("market.floorAskNormalized.id");
        let price = base.clone().changed("market.floorAskNormalized.price.gross.amount");
        assert_ne!(id.key(), price.key());
        assert_ne!(base.key(), id.key());
    }

    #[test]
    fn non_string_filters_render_as_json() {
        let spec = SubscriptionSpec::new("sale.created").filter("limit", 5);
        assert_eq!(spec.key().as_str(), "sale.created:limit=#5");
    }

    #[test]
    fn string_and_number_filters_get_distinct_keys() {
        let text = SubscriptionSpec::new("token.updated").filter("tokenId", "1");
        let number = SubscriptionSpec::new("token.updated").filter("tokenId", 1);
        assert_ne!(text.subscribe_message(), number.subscribe_message());
        assert_ne!(text.key(), number.key());
        assert_eq!(text.key().as_str(), "token.updated:tokenId=1");
    }

    #[test]
    fn separators_inside_values_are_escaped() {
        let smuggled = SubscriptionSpec::new("token.updated").filter("contract", "0xabc:changed=price");
        let watched = SubscriptionSpec::new("token.updated")
            .filter("contract", "0xabc")
            .changed("price");
        assert_ne!(smuggled.key(), watched.key());
        assert_eq!(
            smuggled.key().as_str(),
            r"token.updated:contract=0xabc\:changed\=price"
        );

        let hash = SubscriptionSpec::new("token.updated").filter("tokenId", "#1");
        let number = SubscriptionSpec::new("token.updated").filter("tokenId", 1);
        assert_ne!(hash.key(), number.key());
    }

    #[test]
    fn filter_named_changed_is_not_the_watched_field() {
        let filter = SubscriptionSpec::new("token.updated").filter("changed", "price");
        let watched = SubscriptionSpec::new("token.updated").changed("price");
        assert_ne!(filter.key(), watched.key());
        assert_eq!(watched.key().as_str(), "token.updated:changed=price");
    }

    #[test]
    fn messages_share_filters() {
        let spec = SubscriptionSpec::new("token.updated")
            .filter("contract", "0xabc")
            .changed("price");
        let sub = serde_json::to_value(spec.subscribe_message()).unwrap();
        let unsub = serde_json::to_value(spec.unsubscribe_message()).unwrap();
        assert_eq!(sub["type"], "subscribe");
        assert_eq!(unsub["type"], "unsubscribe");
        assert_eq!(sub["filters"], unsub["filters"]);
        assert_eq!(sub["changed"], "price");
    }

    #[test]
    fn matches_on_tags_case_insensitively() {
        let spec = SubscriptionSpec::new("token.updated").filter("contract", "0xABC");
        let f = frame(json!({
            "event": "token.updated",
            "tags": { "contract": "0xabc" },
            "data": {}
        }));
        assert!(spec.matches(&f));
    }

    #[test]
    fn matches_nested_data_field() {
        let spec = SubscriptionSpec::new("token.updated").filter("contract", "0xabc");
        let f = frame(json!({
            "event": "token.updated",
            "data": { "token": { "contract": "0xabc", "tokenId": "1" } }
        }));
        assert!(spec.matches(&f));

        let other = frame(json!({
            "event": "token.updated",
            "data": { "token": { "contract": "0xdef" } }
        }));
        assert!(!spec.matches(&other));
    }

    #[test]
    fn event_name_must_match() {
        let spec = SubscriptionSpec::new("token.updated");
        let f = frame(json!({ "event": "ask.created", "data": {} }));
        assert!(!spec.matches(&f));
    }

    #[test]
    fn array_filter_matches_any_element() {
        let spec = SubscriptionSpec::new("sale.created").filter("contract", json!(["0x1", "0x2"]));
        let f = frame(json!({ "event": "sale.created", "data": { "contract": "0x2" } }));
        assert!(spec.matches(&f));
    }
}
