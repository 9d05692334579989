use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use ahash::AHashMap;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::data::{BroadcastMessage, ChangeEvent, ChangeFeed, ChannelId, EntityName};
use crate::{lock, Result, SyncConfig};

/// Callback receiving every change event of one entity
pub type EventCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Callback receiving the payload of one named broadcast
pub type BroadcastHandler = Arc<dyn Fn(&JsonValue) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Topic {
    Entity(EntityName),
    Broadcast(String),
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: AHashMap<EntityName, Vec<(u64, EventCallback)>>,
    broadcast_handlers: AHashMap<String, Vec<(u64, BroadcastHandler)>>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove(&mut self, topic: &Topic, id: u64) -> bool {
        match topic {
            Topic::Entity(entity) => remove_entry(self.listeners.get_mut(entity), id),
            Topic::Broadcast(event) => remove_entry(self.broadcast_handlers.get_mut(event), id),
        }
    }
}

fn remove_entry<T>(entries: Option<&mut Vec<(u64, T)>>, id: u64) -> bool {
    match entries {
        Some(entries) => {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            entries.len() != before
        }
        None => false,
    }
}

/// Channels opened by `initialize`, torn down by `shutdown`
struct OpenChannels {
    ids: Vec<ChannelId>,
    pumps: Vec<JoinHandle<()>>,
}

/// Disposer returned by [`EventBus::subscribe`] and [`EventBus::on_broadcast`].
///
/// Removes exactly the callback it was created for, either explicitly through
/// `unsubscribe` or when dropped.
#[must_use = "dropping a Subscription unsubscribes the callback"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    topic: Topic,
    id: u64,
}

impl Subscription {
    /// Returns false when the callback was already removed.
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => lock(&registry).remove(&self.topic, self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

/// Fans out change-feed events to per-entity subscribers.
///
/// One bus is created per process and shared as `Arc<EventBus>`. Feed
/// channels are opened lazily by the first `initialize` call; every later call
/// is a no-op until `shutdown`.
pub struct EventBus {
    feed: Arc<dyn ChangeFeed>,
    tracked: Vec<EntityName>,
    registry: Arc<Mutex<Registry>>,
    channels: Mutex<Option<OpenChannels>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("feed", &"<dyn ChangeFeed>")
            .field("tracked", &self.tracked)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl EventBus {
    pub fn new(feed: Arc<dyn ChangeFeed>, config: &SyncConfig) -> Self {
        EventBus {
            feed,
            tracked: config.tracked.clone(),
            registry: Arc::new(Mutex::new(Registry::default())),
            channels: Mutex::new(None),
        }
    }

    /// Open one feed channel per tracked entity plus the broadcast channel.
    ///
    /// Must run inside a tokio runtime since each channel gets a pump task.
    pub fn initialize(&self) -> Result<()> {
        let mut channels = lock(&self.channels);
        if channels.is_some() {
            return Ok(());
        }

        let mut opened = OpenChannels {
            ids: Vec::with_capacity(self.tracked.len() + 1),
            pumps: Vec::with_capacity(self.tracked.len() + 1),
        };

        for entity in self.tracked.iter().copied() {
            let (sender, mut receiver) = mpsc::unbounded_channel::<ChangeEvent>();
            match self.feed.open_channel(entity, sender) {
                Ok(id) => opened.ids.push(id),
                Err(e) => {
                    self.close(opened);
                    return Err(e);
                }
            }

            let registry = Arc::clone(&self.registry);
            opened.pumps.push(tokio::spawn(async move {
                while let Some(event) = receiver.recv().await {
                    dispatch_event(&registry, &event);
                }
            }));
        }

        let (sender, mut receiver) = mpsc::unbounded_channel::<BroadcastMessage>();
        match self.feed.open_broadcast(sender) {
            Ok(id) => opened.ids.push(id),
            Err(e) => {
                self.close(opened);
                return Err(e);
            }
        }
        let registry = Arc::clone(&self.registry);
        opened.pumps.push(tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                dispatch_broadcast(&registry, &message.event, &message.payload);
            }
        }));

        log::info!(
            "Event bus initialized with {} entity channels",
            self.tracked.len()
        );
        *channels = Some(opened);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.channels).is_some()
    }

    /// Close every channel and return to the uninitialized state.
    /// Registered callbacks are kept.
    pub fn shutdown(&self) {
        let opened = lock(&self.channels).take();
        if let Some(opened) = opened {
            self.close(opened);
            log::info!("Event bus shut down");
        }
    }

    fn close(&self, opened: OpenChannels) {
        for id in opened.ids {
            self.feed.close_channel(id);
        }
        for pump in opened.pumps {
            pump.abort();
        }
    }

    pub fn subscribe<F>(&self, entity: EntityName, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let id = registry.next_id();
        registry
            .listeners
            .entry(entity)
            .or_default()
            .push((id, Arc::new(callback)));

        Subscription {
            registry: Arc::downgrade(&self.registry),
            topic: Topic::Entity(entity),
            id,
        }
    }

    pub fn on_broadcast<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&JsonValue) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let id = registry.next_id();
        registry
            .broadcast_handlers
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            registry: Arc::downgrade(&self.registry),
            topic: Topic::Broadcast(event.to_string()),
            id,
        }
    }

    /// Send a synthetic signal to every peer on the feed.
    ///
    /// The feed echoes broadcasts back to our own channel. Before
    /// `initialize`, or when the feed rejects the message, local handlers are
    /// invoked directly instead.
    pub fn publish_broadcast(&self, event: &str, payload: JsonValue) {
        if self.is_initialized() {
            let message = BroadcastMessage {
                event: event.to_string(),
                payload,
            };
            match self.feed.broadcast(message.clone()) {
                Ok(()) => return,
                Err(e) => {
                    log::warn!("Broadcast '{}' failed on the feed: {}", event, e);
                    self.dispatch_broadcast(&message.event, &message.payload);
                }
            }
        } else {
            self.dispatch_broadcast(event, &payload);
        }
    }

    /// Deliver an event to every subscriber of its entity.
    /// Returns the number of callbacks that completed without panicking.
    pub fn dispatch(&self, event: &ChangeEvent) -> usize {
        dispatch_event(&self.registry, event)
    }

    pub fn dispatch_broadcast(&self, event: &str, payload: &JsonValue) -> usize {
        dispatch_broadcast(&self.registry, event, payload)
    }

    pub fn listener_count(&self, entity: EntityName) -> usize {
        lock(&self.registry)
            .listeners
            .get(&entity)
            .map_or(0, Vec::len)
    }
}

fn dispatch_event(registry: &Mutex<Registry>, event: &ChangeEvent) -> usize {
    // Snapshot the list so callbacks may subscribe or unsubscribe freely
    let callbacks: Vec<EventCallback> = lock(registry)
        .listeners
        .get(&event.entity)
        .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
        .unwrap_or_default();

    let mut delivered = 0;
    for callback in callbacks {
        match catch_unwind(AssertUnwindSafe(|| callback(event))) {
            Ok(()) => delivered += 1,
            Err(_) => log::error!(
                "Listener for {} panicked while handling {:?}",
                event.entity,
                event.action
            ),
        }
    }
    delivered
}

fn dispatch_broadcast(registry: &Mutex<Registry>, event: &str, payload: &JsonValue) -> usize {
    let handlers: Vec<BroadcastHandler> = lock(registry)
        .broadcast_handlers
        .get(event)
        .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
        .unwrap_or_default();

    let mut delivered = 0;
    for handler in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
            Ok(()) => delivered += 1,
            Err(_) => log::error!("Broadcast handler for '{}' panicked", event),
        }
    }
    delivered
}
