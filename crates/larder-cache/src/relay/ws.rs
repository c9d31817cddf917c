//! WebSocket relay transport.
//!
//! One socket per subscription. The socket is driven by a spawned task that
//! forwards items into a bounded channel; the returned stream is the
//! receiving end. When the consumer drops the stream the task sends `CLOSE`
//! and shuts the socket down the next time it wakes.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use larder_core::{ClientMessage, Filter, RelayMessage};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{RelayTransport, SubscriptionItem, SubscriptionStream};
use crate::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Items buffered per subscription before the socket task waits.
const CHANNEL_CAPACITY: usize = 256;

/// Relay transport over `ws://` / `wss://`.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
    verify_events: bool,
}

impl WebSocketTransport {
    /// # Arguments
    ///
    /// * `connect_timeout` - Upper bound on the TCP + TLS + upgrade handshake
    /// * `verify_events` - Drop events whose id or signature does not check out
    pub fn new(connect_timeout: Duration, verify_events: bool) -> Self {
        Self {
            connect_timeout,
            verify_events,
        }
    }
}

#[async_trait]
impl RelayTransport for WebSocketTransport {
    async fn subscribe(
        &self,
        relay_url: &str,
        subscription_id: &str,
        filter: &Filter,
    ) -> Result<SubscriptionStream> {
        let (mut socket, _) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(relay_url))
                .await
                .map_err(|_| Error::Timeout(format!("connecting to {relay_url}")))??;

        let req = ClientMessage::req(subscription_id, filter.clone());
        socket.send(Message::Text(req.as_json())).await?;
        tracing::debug!(relay = %relay_url, sub = subscription_id, "Sent REQ");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let pump = SubscriptionPump {
            relay_url: relay_url.to_string(),
            subscription_id: subscription_id.to_string(),
            filter: filter.clone(),
            verify_events: self.verify_events,
        };
        tokio::spawn(pump.run(socket, tx));

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

/// What to do with one text frame.
#[derive(Debug, PartialEq, Eq)]
enum FrameAction {
    Forward(SubscriptionItem),
    /// Forward, then end the subscription.
    Finish(SubscriptionItem),
    Skip,
}

struct SubscriptionPump {
    relay_url: String,
    subscription_id: String,
    filter: Filter,
    verify_events: bool,
}

impl SubscriptionPump {
    async fn run(self, mut socket: Socket, tx: mpsc::Sender<SubscriptionItem>) {
        loop {
            let frame = tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!(relay = %self.relay_url, sub = %self.subscription_id, "Subscription dropped");
                    self.close(&mut socket).await;
                    return;
                }
                frame = socket.next() => frame,
            };

            let message = match frame {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    let _ = tx.send(SubscriptionItem::Error(e.to_string())).await;
                    return;
                }
                None => {
                    let _ = tx
                        .send(SubscriptionItem::Error("connection closed".to_string()))
                        .await;
                    return;
                }
            };

            match message {
                Message::Text(text) => match self.classify(&text) {
                    FrameAction::Forward(item) => {
                        if tx.send(item).await.is_err() {
                            self.close(&mut socket).await;
                            return;
                        }
                    }
                    FrameAction::Finish(item) => {
                        let _ = tx.send(item).await;
                        self.close(&mut socket).await;
                        return;
                    }
                    FrameAction::Skip => {}
                },
                Message::Ping(payload) => {
                    if let Err(e) = socket.send(Message::Pong(payload)).await {
                        tracing::debug!(relay = %self.relay_url, "Failed to answer ping: {}", e);
                    }
                }
                Message::Close(_) => {
                    let _ = tx
                        .send(SubscriptionItem::Closed("relay closed the connection".to_string()))
                        .await;
                    return;
                }
                _ => {}
            }
        }
    }

    fn classify(&self, text: &str) -> FrameAction {
        let message = match RelayMessage::from_json(text) {
            Ok(Some(message)) => message,
            Ok(None) => return FrameAction::Skip,
            Err(e) => {
                tracing::debug!(relay = %self.relay_url, "Skipping malformed frame: {}", e);
                return FrameAction::Skip;
            }
        };

        if let Some(sub) = message.subscription_id()
            && sub != self.subscription_id
        {
            return FrameAction::Skip;
        }

        match message {
            RelayMessage::Event { event, .. } => {
                if !self.filter.matches(&event) {
                    tracing::debug!(relay = %self.relay_url, id = %event.id, "Dropping event outside filter");
                    return FrameAction::Skip;
                }
                if self.verify_events
                    && let Err(e) = event.verify()
                {
                    tracing::debug!(relay = %self.relay_url, id = %event.id, "Dropping unverifiable event: {}", e);
                    return FrameAction::Skip;
                }
                FrameAction::Forward(SubscriptionItem::Event(*event))
            }
            RelayMessage::EndOfStoredEvents(_) => {
                FrameAction::Finish(SubscriptionItem::EndOfStoredEvents)
            }
            RelayMessage::Closed { message, .. } => {
                FrameAction::Finish(SubscriptionItem::Closed(message))
            }
            RelayMessage::Notice(notice) => {
                tracing::debug!(relay = %self.relay_url, "NOTICE: {}", notice);
                FrameAction::Skip
            }
            RelayMessage::Ok { .. } => FrameAction::Skip,
        }
    }

    /// Best-effort `CLOSE` plus socket shutdown.
    async fn close(&self, socket: &mut Socket) {
        let close = ClientMessage::Close(self.subscription_id.clone());
        let _ = socket.send(Message::Text(close.as_json())).await;
        let _ = socket.close(None).await;
    }
}
