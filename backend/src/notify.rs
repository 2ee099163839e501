//! Publish boundary for batch lifecycle events.
//!
//! The transport that pushes events to connected clients lives outside this
//! crate; it subscribes to a [`BroadcastNotifier`] and forwards by client id.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BatchEvent {
    #[serde(rename = "batch:processing")]
    Processing,
    #[serde(rename = "batch:completed")]
    Completed,
    #[serde(rename = "batch:failed")]
    Failed,
}

impl BatchEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "batch:processing",
            Self::Completed => "batch:completed",
            Self::Failed => "batch:failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Notification {
    pub event: BatchEvent,
    pub client_id: String,
    pub payload: Value,
}

/// Fire-and-forget event sink.
pub trait Notifier: Send + Sync + 'static {
    /// Publishes `payload` to `client_id`. Without a client id nothing is sent.
    fn publish(&self, event: BatchEvent, client_id: Option<&str>, payload: Value);
}

pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    /// When the channel is full the oldest notifications are dropped for
    /// lagging subscribers.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, event: BatchEvent, client_id: Option<&str>, payload: Value) {
        let Some(client_id) = client_id else {
            debug!(event = event.as_str(), "no client attached; notification skipped");
            return;
        };

        // No subscriber is not an error.
        let _ = self.sender.send(Notification {
            event,
            client_id: client_id.to_string(),
            payload,
        });
    }
}
