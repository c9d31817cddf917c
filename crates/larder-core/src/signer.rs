//! Event signing.
//!
//! Creation paths assemble [`UnsignedEvent`]s and hand them to a [`Signer`].
//! The caller may not have one (signed out, read-only session); in that case
//! creation fails with [`Error::SignerUnavailable`] and nothing is sent.

use async_trait::async_trait;
use nostr::{EventBuilder, JsonUtil, Keys, Kind, Tag, Timestamp};

use crate::error::{Error, Result};
use crate::event::{Event, UnsignedEvent};

/// Produces signatures for locally created events.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex public key of the signing identity.
    async fn public_key(&self) -> Result<String>;

    /// Sign `unsigned`, returning the complete event.
    async fn sign(&self, unsigned: UnsignedEvent) -> Result<Event>;
}

/// In-process signer backed by a secret key.
#[derive(Clone)]
pub struct KeysSigner {
    keys: Keys,
}

impl KeysSigner {
    /// Parse a hex or bech32 (`nsec`) secret key.
    pub fn parse(secret: &str) -> Result<Self> {
        let keys = Keys::parse(secret).map_err(|e| Error::InvalidKey(e.to_string()))?;
        Ok(Self { keys })
    }

    /// Fresh random identity. Mostly useful in tests.
    pub fn generate() -> Self {
        Self {
            keys: Keys::generate(),
        }
    }

    pub fn public_key_hex(&self) -> String {
        self.keys.public_key().to_hex()
    }
}

impl std::fmt::Debug for KeysSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeysSigner")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for KeysSigner {
    async fn public_key(&self) -> Result<String> {
        Ok(self.public_key_hex())
    }

    async fn sign(&self, unsigned: UnsignedEvent) -> Result<Event> {
        let own = self.public_key_hex();
        if unsigned.pubkey != own {
            return Err(Error::Signing(format!(
                "event pubkey {} does not match signer {}",
                unsigned.pubkey, own
            )));
        }

        let tags = unsigned
            .tags
            .into_iter()
            .map(|tag| Tag::parse(tag).map_err(|e| Error::Signing(e.to_string())))
            .collect::<Result<Vec<_>>>()?;

        let signed = EventBuilder::new(Kind::from(unsigned.kind), unsigned.content)
            .tags(tags)
            .custom_created_at(Timestamp::from(unsigned.created_at))
            .sign_with_keys(&self.keys)
            .map_err(|e| Error::Signing(e.to_string()))?;

        Event::from_json(&signed.as_json())
    }
}

/// Build and sign a deletion request for `target_ids`.
///
/// # Errors
///
/// Returns [`Error::SignerUnavailable`] when `signer` is `None`, or whatever
/// the signer reports.
pub async fn sign_deletion(
    signer: Option<&dyn Signer>,
    target_ids: &[String],
    reason: Option<&str>,
    created_at: u64,
) -> Result<Event> {
    let signer = signer.ok_or(Error::SignerUnavailable)?;
    let pubkey = signer.public_key().await?;
    let unsigned = UnsignedEvent::deletion(pubkey, target_ids, reason, created_at);
    signer.sign(unsigned).await
}
