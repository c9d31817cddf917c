//! Client and relay wire messages.
//!
//! Frames are JSON arrays whose first element names the message type:
//!
//! ```text
//! client → relay   ["REQ", <subscription id>, <filter>]
//!                  ["CLOSE", <subscription id>]
//! relay  → client  ["EVENT", <subscription id>, <event>]
//!                  ["EOSE", <subscription id>]
//!                  ["NOTICE", <message>]
//!                  ["CLOSED", <subscription id>, <message>]
//!                  ["OK", <event id>, <accepted>, <message>]
//! ```
//!
//! Unknown relay message types are ignored rather than treated as errors.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::Filter;

/// Message sent from the client to a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filter: Filter,
    },
    Close(String),
}

impl ClientMessage {
    pub fn req(subscription_id: impl Into<String>, filter: Filter) -> Self {
        Self::Req {
            subscription_id: subscription_id.into(),
            filter,
        }
    }

    /// Encode as a JSON array frame.
    pub fn as_json(&self) -> String {
        let value = match self {
            Self::Req {
                subscription_id,
                filter,
            } => serde_json::json!(["REQ", subscription_id, filter]),
            Self::Close(subscription_id) => serde_json::json!(["CLOSE", subscription_id]),
        };
        value.to_string()
    }
}

/// Message received from a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    EndOfStoredEvents(String),
    Notice(String),
    Closed {
        subscription_id: String,
        message: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
}

impl RelayMessage {
    /// Parse a relay frame.
    ///
    /// Returns `Ok(None)` for well-formed frames of a type this client does
    /// not handle (e.g. `AUTH`, `COUNT`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] if the frame is not a JSON array
    /// with a string type tag, or a known type is missing required fields.
    pub fn from_json(text: &str) -> Result<Option<Self>> {
        let value: Value = serde_json::from_str(text)?;
        let items = value
            .as_array()
            .ok_or_else(|| Error::InvalidMessage("frame is not a JSON array".to_string()))?;
        let kind = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidMessage("missing message type".to_string()))?;

        let message = match kind {
            "EVENT" => {
                let subscription_id = string_at(items, 1, kind)?;
                let raw = items
                    .get(2)
                    .cloned()
                    .ok_or_else(|| Error::InvalidMessage("EVENT without payload".to_string()))?;
                let event = Event::from_value(raw)
                    .map_err(|e| Error::InvalidMessage(format!("malformed event: {e}")))?;
                Self::Event {
                    subscription_id,
                    event: Box::new(event),
                }
            }
            "EOSE" => Self::EndOfStoredEvents(string_at(items, 1, kind)?),
            "NOTICE" => Self::Notice(string_at(items, 1, kind)?),
            "CLOSED" => Self::Closed {
                subscription_id: string_at(items, 1, kind)?,
                message: items
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            "OK" => Self::Ok {
                event_id: string_at(items, 1, kind)?,
                accepted: items.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: items
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => return Ok(None),
        };

        Ok(Some(message))
    }

    /// The subscription this message belongs to, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Self::Event {
                subscription_id, ..
            }
            | Self::Closed {
                subscription_id, ..
            } => Some(subscription_id),
            Self::EndOfStoredEvents(subscription_id) => Some(subscription_id),
            Self::Notice(_) | Self::Ok { .. } => None,
        }
    }
}

fn string_at(items: &[Value], index: usize, kind: &str) -> Result<String> {
    items
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidMessage(format!("{kind} missing string at position {index}")))
}
