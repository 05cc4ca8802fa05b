//! Message envelope and wire codec.
//!
//! Every payload that travels through a driver is wrapped in a [`Message`]
//! envelope carrying the business identifier used for idempotency, the
//! opaque payload bytes, the retry counter, and the topic routing key.
//!
//! The wire format is a self-describing JSON map with compact single-letter
//! keys (`b`/`p`/`r`/`k`). Absent fields decode to their defaults and
//! unknown keys are ignored, so the encoding stays stable across versions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Errors raised by the envelope codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// The envelope transported end-to-end through a broker driver.
///
/// The payload is opaque to the middleware; [`Message::scan`] decodes it
/// into a caller-supplied type when the application needs it back.
///
/// # Example
///
/// ```
/// use relay_bus::Message;
///
/// let msg = Message::auto_id(&"order-42", "orders.created").unwrap();
/// let raw = msg.encode().unwrap();
///
/// let back = Message::decode(&raw).unwrap();
/// let order: String = back.scan().unwrap();
/// assert_eq!(order, "order-42");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Business unique identifier.
    ///
    /// Carries no transport meaning; consumers key their idempotency
    /// checks on it, so duplicates of the same logical message must
    /// share the same value.
    #[serde(rename = "b", default, skip_serializing_if = "String::is_empty")]
    pub biz_uid: String,

    /// Opaque payload bytes, typically a serialized domain value.
    #[serde(
        rename = "p",
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "base64_bytes"
    )]
    pub payload: Vec<u8>,

    /// How many failed delivery attempts chose the retry branch so far.
    #[serde(rename = "r", default, skip_serializing_if = "is_zero")]
    pub retried: u32,

    /// Routing key consulted by topic-to-queue subscriptions.
    #[serde(rename = "k", default, skip_serializing_if = "String::is_empty")]
    pub route_key: String,
}

impl Message {
    /// Build a message with an explicit business identifier.
    pub fn with_id<T: Serialize>(
        id: impl Into<String>,
        payload: &T,
        route_key: impl Into<String>,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            biz_uid: id.into(),
            payload: serde_json::to_vec(payload).map_err(CodecError::Encode)?,
            retried: 0,
            route_key: route_key.into(),
        })
    }

    /// Build a message with a generated identifier.
    ///
    /// Identifiers are monotonic within the process: a time-seeded counter
    /// rendered in base 36.
    pub fn auto_id<T: Serialize>(
        payload: &T,
        route_key: impl Into<String>,
    ) -> Result<Self, CodecError> {
        Self::with_id(next_seq_id(), payload, route_key)
    }

    /// Decode the payload into a caller-supplied type.
    pub fn scan<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_slice(&self.payload).map_err(CodecError::Decode)
    }

    /// Serialize the envelope for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    /// Deserialize an envelope received from a driver.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(data).map_err(CodecError::Decode)
    }
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Payload bytes travel as base64 text inside the JSON map.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

static SEQUENCE: OnceLock<AtomicU64> = OnceLock::new();

/// Next monotonic identifier, base-36 encoded.
///
/// The counter is seeded once from the wall clock so identifiers remain
/// roughly sortable across process restarts.
pub(crate) fn next_seq_id() -> String {
    let counter = SEQUENCE.get_or_init(|| {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        AtomicU64::new(micros << 12)
    });
    to_base36(counter.fetch_add(1, Ordering::Relaxed))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut buf = [0u8; 13];
    let mut at = buf.len();
    while value > 0 {
        at -= 1;
        buf[at] = DIGITS[(value % 36) as usize];
        value /= 36;
    }
    String::from_utf8_lossy(&buf[at..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: String,
        name: String,
        info: HashMap<String, String>,
    }

    #[test]
    fn round_trip_preserves_envelope_and_payload() {
        let user = User {
            id: "u1".to_string(),
            name: "Jim".to_string(),
            info: HashMap::from([("age".to_string(), "1".to_string())]),
        };

        let msg = Message::auto_id(&user, "users.created").unwrap();
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(msg, decoded);
        let scanned: User = decoded.scan().unwrap();
        assert_eq!(user, scanned);
    }

    #[test]
    fn absent_fields_decode_to_defaults() {
        let msg = Message::decode(b"{}").unwrap();
        assert_eq!(msg, Message::default());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let msg = Message::decode(br#"{"b":"id-1","x":"future-field"}"#).unwrap();
        assert_eq!(msg.biz_uid, "id-1");
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn zero_fields_are_omitted_on_the_wire() {
        let raw = Message::with_id("id-1", &7u8, "").unwrap().encode().unwrap();
        let text = String::from_utf8(raw).unwrap();
        assert!(!text.contains("\"r\""));
        assert!(!text.contains("\"k\""));
    }

    #[test]
    fn generated_ids_are_monotonic() {
        let a = next_seq_id();
        let b = next_seq_id();
        assert!(b > a, "{b} should sort after {a}");
    }

    #[test]
    fn base36_renders_digits_and_letters() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }
}
