//! Core types shared by the larder timeline cache.
//!
//! This crate provides:
//! - The relay event model and NIP-01 id/signature verification via the nostr crate
//! - Subscription filters and the client/relay wire messages (`REQ`, `EVENT`, `EOSE`, ...)
//! - Timeline identities and their deterministic storage keys
//! - Author profile metadata parsing
//! - The signing capability and tombstone (deletion) construction
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
mod filter;
mod message;
pub mod metrics;
mod profile;
mod signer;
mod timeline;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Kind 0: author profile metadata.
pub const KIND_METADATA: u16 = 0;

/// Kind 1: short text note.
pub const KIND_TEXT_NOTE: u16 = 1;

/// Kind 3: follow list.
pub const KIND_CONTACTS: u16 = 3;

/// Kind 5: deletion request (tombstone).
pub const KIND_DELETION: u16 = 5;

/// Kind 6: repost.
pub const KIND_REPOST: u16 = 6;

pub use error::{Error, Result};
pub use event::{Event, UnsignedEvent};
pub use filter::Filter;
pub use message::{ClientMessage, RelayMessage};
pub use profile::ProfileMetadata;
pub use signer::{KeysSigner, Signer, sign_deletion};
pub use timeline::{TimelineKind, TimelineRef};
