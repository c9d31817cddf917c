//! Scripted in-process relays for tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use larder_core::{Event, Filter};
use parking_lot::Mutex;

use super::{RelayTransport, SubscriptionItem, SubscriptionStream};
use crate::{Error, Result};

#[derive(Debug, Clone)]
enum Step {
    Item(SubscriptionItem),
    Delay(Duration),
    /// Never yield again.
    Stall,
}

/// What one relay does for every subscription opened against it.
#[derive(Debug, Clone, Default)]
pub(crate) struct RelayScript {
    connect_error: Option<String>,
    steps: Vec<Step>,
}

impl RelayScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// A relay that cannot be reached.
    pub fn unreachable(reason: &str) -> Self {
        Self {
            connect_error: Some(reason.to_string()),
            steps: Vec::new(),
        }
    }

    pub fn event(mut self, event: Event) -> Self {
        self.steps.push(Step::Item(SubscriptionItem::Event(event)));
        self
    }

    pub fn events(mut self, events: impl IntoIterator<Item = Event>) -> Self {
        for event in events {
            self = self.event(event);
        }
        self
    }

    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.steps.push(Step::Delay(Duration::from_millis(ms)));
        self
    }

    pub fn eose(mut self) -> Self {
        self.steps.push(Step::Item(SubscriptionItem::EndOfStoredEvents));
        self
    }

    pub fn error(mut self, reason: &str) -> Self {
        self.steps
            .push(Step::Item(SubscriptionItem::Error(reason.to_string())));
        self
    }

    pub fn stall(mut self) -> Self {
        self.steps.push(Step::Stall);
        self
    }
}

/// Transport that replays a [`RelayScript`] per relay URL.
///
/// Relays without a script behave as unreachable.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    scripts: Mutex<HashMap<String, RelayScript>>,
    opened: Mutex<Vec<(String, Filter)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relay(self, url: &str, script: RelayScript) -> Self {
        self.set_relay(url, script);
        self
    }

    /// Replace a relay's script (e.g. between sync cycles).
    pub fn set_relay(&self, url: &str, script: RelayScript) {
        self.scripts.lock().insert(url.to_string(), script);
    }

    /// Every `(relay, filter)` subscribed so far, in order.
    pub fn subscriptions(&self) -> Vec<(String, Filter)> {
        self.opened.lock().clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.opened.lock().len()
    }
}

#[async_trait]
impl RelayTransport for ScriptedTransport {
    async fn subscribe(
        &self,
        relay_url: &str,
        _subscription_id: &str,
        filter: &Filter,
    ) -> Result<SubscriptionStream> {
        self.opened
            .lock()
            .push((relay_url.to_string(), filter.clone()));

        let script = self
            .scripts
            .lock()
            .get(relay_url)
            .cloned()
            .unwrap_or_else(|| RelayScript::unreachable("no such relay"));

        if let Some(reason) = script.connect_error {
            return Err(Error::Relay(reason));
        }

        let stream = futures::stream::unfold(script.steps.into_iter(), |mut steps| async move {
            loop {
                match steps.next()? {
                    Step::Delay(delay) => tokio::time::sleep(delay).await,
                    Step::Stall => futures::future::pending::<()>().await,
                    Step::Item(item) => return Some((item, steps)),
                }
            }
        });
        Ok(stream.boxed())
    }
}
