//! Core data model.
//!
//! A message is an opaque payload plus the bookkeeping the engine needs to
//! hand it to exactly one consumer at a time.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A message handed out by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Backend-assigned identifier. Ordering key and address for
    /// finish / release / abort.
    pub id: MessageId,

    /// Arbitrary payload. The engine never inspects it.
    pub payload: serde_json::Value,

    /// How many times this message was released or its reservation expired.
    pub failures: u32,

    /// Reservation counter, bumped by every reserve. Pins finish / release /
    /// abort to this particular reservation via [`Receipt`].
    pub lease: u32,

    /// When the reservation lapses, if the queue has a visibility timeout.
    /// Always `None` for peeked and taken messages.
    pub reserved_until: Option<DateTime<Utc>>,
}

impl Message {
    /// Decode the payload into a caller type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Newtype for message IDs.
///
/// IDs grow monotonically within a queue and are never reused, so comparing
/// two IDs compares submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .map(MessageId)
            .ok_or_else(|| Error::InvalidId(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Receipt
// ---------------------------------------------------------------------------

/// Address for finish / release / abort.
///
/// Built from a [`Message`], it only matches the reservation that handed the
/// message out: once that reservation lapses and someone else reserves the
/// message, the old receipt no longer matches. Built from a bare
/// [`MessageId`], it matches whatever reservation the message currently has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt {
    pub id: MessageId,
    pub lease: Option<u32>,
}

impl Receipt {
    pub fn pinned(id: MessageId, lease: u32) -> Self {
        Self { id, lease: Some(lease) }
    }
}

impl From<MessageId> for Receipt {
    fn from(id: MessageId) -> Self {
        Self { id, lease: None }
    }
}

impl From<&Message> for Receipt {
    fn from(message: &Message) -> Self {
        Self::pinned(message.id, message.lease)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a stored message. A deleted message has no row at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Visible, waiting for a consumer.
    Ready,
    /// Claimed by exactly one consumer, invisible to everyone else.
    Reserved,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ready => "ready",
            Status::Reserved => "reserved",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ready" => Ok(Status::Ready),
            "reserved" => Ok(Status::Reserved),
            _ => Err(Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Buried
// ---------------------------------------------------------------------------

/// A message a consumer gave up on. Kept out of delivery for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuriedMessage {
    pub id: MessageId,
    pub payload: serde_json::Value,
    /// Failure count including the abort itself.
    pub failures: u32,
    pub buried_at: DateTime<Utc>,
    /// Set when the engine buried the message itself, e.g. an undecodable
    /// payload. `None` for consumer aborts.
    pub reason: Option<String>,
}

impl BuriedMessage {
    /// Build from stored text. A payload that is not valid JSON is kept
    /// verbatim as a JSON string so the ledger stays readable.
    pub(crate) fn from_stored(
        id: MessageId,
        payload: &str,
        failures: u32,
        buried_at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Self {
        let payload = serde_json::from_str(payload)
            .unwrap_or_else(|_| serde_json::Value::String(payload.to_string()));
        Self {
            id,
            payload,
            failures,
            buried_at,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_id_round_trips_through_string() {
        let id: MessageId = "42".parse().unwrap();
        assert_eq!(id, MessageId(42));
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn message_id_rejects_garbage() {
        assert!(matches!("abc".parse::<MessageId>(), Err(Error::InvalidId(_))));
        assert!(matches!("0".parse::<MessageId>(), Err(Error::InvalidId(_))));
        assert!(matches!("-3".parse::<MessageId>(), Err(Error::InvalidId(_))));
    }

    #[test]
    fn status_parses_its_own_display() {
        for status in [Status::Ready, Status::Reserved] {
            assert_eq!(status.to_string().parse::<Status>().unwrap(), status);
        }
        assert!("submitted".parse::<Status>().is_err());
    }

    #[test]
    fn payload_as_decodes_typed_payload() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Job {
            x: i32,
        }

        let msg = Message {
            id: MessageId(1),
            payload: json!({"x": 1}),
            failures: 0,
            lease: 0,
            reserved_until: None,
        };
        assert_eq!(msg.payload_as::<Job>().unwrap(), Job { x: 1 });
        assert!(msg.payload_as::<Vec<String>>().is_err());
    }

    #[test]
    fn receipt_from_message_pins_the_lease() {
        let msg = Message {
            id: MessageId(3),
            payload: json!(null),
            failures: 1,
            lease: 2,
            reserved_until: None,
        };
        assert_eq!(Receipt::from(&msg), Receipt::pinned(MessageId(3), 2));
        assert_eq!(Receipt::from(MessageId(3)).lease, None);
    }

    #[test]
    fn buried_keeps_undecodable_payload_verbatim() {
        let at = Utc::now();
        let good = BuriedMessage::from_stored(MessageId(1), r#"{"a":1}"#, 1, at, None);
        assert_eq!(good.payload, json!({"a": 1}));

        let bad = BuriedMessage::from_stored(MessageId(2), "{not json", 1, at, Some("bad".into()));
        assert_eq!(bad.payload, json!("{not json"));
        assert_eq!(bad.reason.as_deref(), Some("bad"));
    }
}
