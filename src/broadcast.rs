//! In-process event broadcaster.
//!
//! Channels are ephemeral fan-out groups keyed by name: a channel exists while
//! it has at least one subscriber. Each subscriber owns a bounded queue;
//! publishing never blocks and a full queue drops the message for that
//! subscriber only. Nothing is replayed to late subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default per-subscriber queue capacity.
pub const DEFAULT_SINK_CAPACITY: usize = 256;

/// Message delivered to subscribers. Shared between all sinks of a publish.
pub type Message = Arc<Value>;

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    channels: HashMap<String, HashMap<u64, mpsc::Sender<Message>>>,
}

impl Registry {
    fn remove(&mut self, channel: &str, id: u64) -> bool {
        let Some(sinks) = self.channels.get_mut(channel) else {
            return false;
        };
        let removed = sinks.remove(&id).is_some();
        if sinks.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }
}

/// Channel registry shared by the stream endpoint and the effect runner.
///
/// Registry mutations and publish iteration happen under one mutex, so a
/// subscriber is either fully registered or not visible to a publish.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<Mutex<Registry>>,
    sink_capacity: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SINK_CAPACITY)
    }
}

impl Broadcaster {
    /// Create an empty broadcaster whose subscribers buffer up to
    /// `sink_capacity` messages each.
    pub fn new(sink_capacity: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            sink_capacity: sink_capacity.max(1),
        }
    }

    /// Register a new subscriber on `channel`, creating the channel if needed.
    pub fn subscribe(&self, channel: impl Into<String>) -> Subscription {
        let channel = channel.into();
        let (tx, rx) = mpsc::channel(self.sink_capacity);

        let id = {
            let mut registry = self.registry.lock();
            registry.next_id += 1;
            let id = registry.next_id;
            registry
                .channels
                .entry(channel.clone())
                .or_default()
                .insert(id, tx);
            id
        };

        tracing::debug!(channel = %channel, subscriber = id, "Subscriber registered");
        Subscription {
            id,
            channel,
            rx,
            registry: Arc::downgrade(&self.registry),
            active: true,
        }
    }

    /// Deliver `message` to every current subscriber of `channel`.
    ///
    /// Returns the number of subscribers the message was queued for. Full
    /// sinks miss this message; closed sinks are removed.
    pub fn publish(&self, channel: &str, message: Value) -> usize {
        let message = Arc::new(message);
        let mut registry = self.registry.lock();
        let Some(sinks) = registry.channels.get_mut(channel) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dropped = 0;
        sinks.retain(|id, tx| match tx.try_send(Arc::clone(&message)) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                tracing::warn!(channel, subscriber = id, "Subscriber queue full, message dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if sinks.is_empty() {
            registry.channels.remove(channel);
        }
        drop(registry);

        tracing::trace!(channel, delivered, dropped, "Message published");
        delivered
    }

    /// Number of subscribers currently registered on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.registry
            .lock()
            .channels
            .get(channel)
            .map_or(0, HashMap::len)
    }

    /// Number of channels with at least one subscriber.
    pub fn channel_count(&self) -> usize {
        self.registry.lock().channels.len()
    }
}

/// A live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    channel: String,
    rx: mpsc::Receiver<Message>,
    registry: Weak<Mutex<Registry>>,
    active: bool,
}

impl Subscription {
    /// Subscriber identifier, unique for the broadcaster's lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once unsubscribed and drained, or if the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Take the next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Remove this subscriber from its channel. Idempotent.
    pub fn unsubscribe(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        self.rx.close();
        if let Some(registry) = self.registry.upgrade()
            && registry.lock().remove(&self.channel, self.id)
        {
            tracing::debug!(channel = %self.channel, subscriber = self.id, "Subscriber removed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
