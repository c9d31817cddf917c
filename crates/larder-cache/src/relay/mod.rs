//! Relay access.
//!
//! A relay subscription is modelled as a stream of [`SubscriptionItem`]s
//! rather than a set of socket callbacks. The timeline engine runs one task
//! per relay, each draining its own stream, and joins them; a relay that
//! errors or stalls only affects its own task.
//!
//! ```text
//! ┌───────────────┐   subscribe()   ┌──────────────────┐
//! │ TimelineEngine│ ──────────────► │  RelayTransport  │  (WebSocket, scripted)
//! └───────┬───────┘                 └────────┬─────────┘
//!         │   Event / EOSE / Closed / Error  │
//!         ◄──────────────────────────────────┘
//!         │
//!         ▼
//! ┌───────────────┐
//! │  RelayHealth  │  success/failure tallies, relay ordering
//! └───────────────┘
//! ```

mod health;
#[cfg(test)]
pub(crate) mod mock;
pub mod url;
mod ws;

use async_trait::async_trait;
use futures::stream::BoxStream;
use larder_core::{Event, Filter};

use crate::Result;

pub use health::{RELAY_HEALTH_KEY, RelayHealth, RelayHealthSnapshot, RelayTally};
pub use url::{NormalizeResult, is_onion_url, normalize_relay_url};
pub use ws::WebSocketTransport;

/// One item delivered on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionItem {
    /// A stored or live event matching the filter.
    Event(Event),
    /// The relay has sent everything it had stored.
    EndOfStoredEvents,
    /// The relay refused or ended the subscription.
    Closed(String),
    /// Transport or protocol failure. The stream ends after this.
    Error(String),
}

/// A cancellable subscription. Dropping it closes the subscription.
pub type SubscriptionStream = BoxStream<'static, SubscriptionItem>;

/// Opens subscriptions against relays.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open `subscription_id` on `relay_url` with `filter`.
    ///
    /// Connection failures may surface either as an `Err` here or as a
    /// [`SubscriptionItem::Error`] on the stream.
    async fn subscribe(
        &self,
        relay_url: &str,
        subscription_id: &str,
        filter: &Filter,
    ) -> Result<SubscriptionStream>;
}
