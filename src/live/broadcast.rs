//! Publish side of the live event channels.

use crate::domain::events::LiveEvent;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type EventReceiver = broadcast::Receiver<LiveEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    Lobby(Uuid),
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKey::Lobby(id) => write!(f, "lobby:{}", id),
        }
    }
}

/// Best-effort fan-out; the engine never waits for delivery.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, channel: &ChannelKey, event: LiveEvent);
}

/// One tokio broadcast channel per key, created on first use.
#[derive(Clone)]
pub struct ChannelHub {
    capacity: usize,
    channels: Arc<RwLock<HashMap<ChannelKey, broadcast::Sender<LiveEvent>>>>,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn subscribe(&self, channel: ChannelKey) -> EventReceiver {
        let mut channels = match self.channels.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drops channels nobody listens to any more.
    pub fn prune(&self) -> usize {
        let mut channels = match self.channels.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = channels.len();
        channels.retain(|_, sender| sender.receiver_count() > 0);
        before - channels.len()
    }

    pub fn channel_count(&self) -> usize {
        match self.channels.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Broadcaster for ChannelHub {
    fn publish(&self, channel: &ChannelKey, event: LiveEvent) {
        let channels = match self.channels.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(sender) = channels.get(channel) else {
            tracing::debug!("No subscribers on {}, dropping {}", channel, event.type_name());
            return;
        };
        if sender.send(event).is_err() {
            tracing::debug!("All subscribers of {} are gone", channel);
        }
    }
}
