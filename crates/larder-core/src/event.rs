//! Relay event model.
//!
//! Events are immutable signed records identified by their content-derived
//! `id`. Identity is by `id` alone: two values with the same id are the same
//! event regardless of where they came from.
//!
//! Verification (id hash and Schnorr signature, per NIP-01) is delegated to
//! the nostr crate by round-tripping through its JSON representation.

use nostr::JsonUtil;
use serde::{Deserialize, Serialize};

use crate::KIND_DELETION;
use crate::error::{Error, Result};

/// A signed event as exchanged with relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-byte content hash, lowercase hex.
    pub id: String,
    /// Author public key, lowercase hex.
    pub pubkey: String,
    /// Unix timestamp (seconds) chosen by the author.
    pub created_at: u64,
    pub kind: u16,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    /// Schnorr signature over `id`, lowercase hex.
    pub sig: String,
}

impl Event {
    /// Parse an event from its JSON object form.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse an event from an already-decoded JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Serialize to the JSON object form.
    pub fn as_json(&self) -> String {
        // Plain strings and integers only; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Verify the event id and signature.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] if the JSON does not form a valid nostr
    /// event, the id does not match the canonical hash, or the signature does
    /// not verify.
    pub fn verify(&self) -> Result<()> {
        let event = nostr::Event::from_json(self.as_json())
            .map_err(|e| Error::InvalidEvent(e.to_string()))?;
        event
            .verify()
            .map_err(|e| Error::InvalidEvent(e.to_string()))
    }

    /// Iterate the first value of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// Whether this is a deletion request (kind 5).
    pub fn is_deletion(&self) -> bool {
        self.kind == KIND_DELETION
    }

    /// Event ids this tombstone asks to delete. Empty for non-deletion events.
    pub fn deletion_targets(&self) -> Vec<String> {
        if !self.is_deletion() {
            return Vec::new();
        }
        self.tag_values("e").map(str::to_string).collect()
    }
}

/// An event that has not been signed yet.
///
/// Event-creation paths only assemble data; signing is handed to a
/// [`Signer`](crate::Signer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    /// Build a tombstone for `target_ids`, all authored by `pubkey`.
    pub fn deletion(
        pubkey: impl Into<String>,
        target_ids: &[String],
        reason: Option<&str>,
        created_at: u64,
    ) -> Self {
        let tags = target_ids
            .iter()
            .map(|id| vec!["e".to_string(), id.clone()])
            .collect();

        Self {
            pubkey: pubkey.into(),
            created_at,
            kind: KIND_DELETION,
            tags,
            content: reason.unwrap_or_default().to_string(),
        }
    }
}
