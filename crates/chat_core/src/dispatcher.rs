//! Single application path for live and replayed events.
//!
//! `dispatch` applies an event to the store under the store lock, releases the
//! lock, then notifies channel-scoped listeners for the event's cid, then
//! client-wide listeners, then the broadcast stream.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, Weak,
    },
};

use chat_shared::{
    domain::Cid,
    protocol::{Event, EventType, User},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, trace};

use crate::store::{Applied, ChatStore};

const EVENT_BUFFER: usize = 1024;

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    filter: Option<EventType>,
    callback: Listener,
}

impl ListenerEntry {
    fn wants(&self, event: &Event) -> bool {
        self.filter.map_or(true, |kind| kind == event.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Scope {
    Client,
    Channel(Cid),
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    client: StdMutex<Vec<ListenerEntry>>,
    channels: StdMutex<HashMap<Cid, Vec<ListenerEntry>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ListenerRegistry {
    fn add(&self, scope: Scope, filter: Option<EventType>, callback: Listener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = ListenerEntry {
            id,
            filter,
            callback,
        };
        match scope {
            Scope::Client => lock(&self.client).push(entry),
            Scope::Channel(cid) => lock(&self.channels).entry(cid).or_default().push(entry),
        }
        id
    }

    fn remove(&self, scope: &Scope, id: u64) {
        match scope {
            Scope::Client => lock(&self.client).retain(|entry| entry.id != id),
            Scope::Channel(cid) => {
                let mut channels = lock(&self.channels);
                if let Some(entries) = channels.get_mut(cid) {
                    entries.retain(|entry| entry.id != id);
                    if entries.is_empty() {
                        channels.remove(cid);
                    }
                }
            }
        }
    }

    /// Callbacks are collected first so a listener may unsubscribe itself.
    fn matching(&self, event: &Event) -> Vec<Listener> {
        let mut matched = Vec::new();
        if let Some(cid) = event.target_cid() {
            if let Some(entries) = lock(&self.channels).get(cid) {
                matched.extend(
                    entries
                        .iter()
                        .filter(|entry| entry.wants(event))
                        .map(|entry| Arc::clone(&entry.callback)),
                );
            }
        }
        matched.extend(
            lock(&self.client)
                .iter()
                .filter(|entry| entry.wants(event))
                .map(|entry| Arc::clone(&entry.callback)),
        );
        matched
    }

    fn len(&self) -> usize {
        lock(&self.client).len() + lock(&self.channels).values().map(Vec::len).sum::<usize>()
    }
}

/// Disposer for a registered listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription removes the listener"]
pub struct Subscription {
    registry: Weak<ListenerRegistry>,
    scope: Scope,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.scope, self.id);
        }
    }
}

pub struct EventDispatcher {
    store: Arc<Mutex<ChatStore>>,
    listeners: Arc<ListenerRegistry>,
    events: broadcast::Sender<Event>,
}

impl EventDispatcher {
    pub fn new(store: Arc<Mutex<ChatStore>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            store,
            listeners: Arc::new(ListenerRegistry::default()),
            events,
        }
    }

    pub fn store(&self) -> &Arc<Mutex<ChatStore>> {
        &self.store
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Registers a client-wide listener, optionally limited to one event type.
    pub fn on<F>(&self, filter: Option<EventType>, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(Scope::Client, filter, Arc::new(callback))
    }

    /// Registers a listener for events targeting `cid`.
    pub fn on_channel<F>(&self, cid: Cid, filter: Option<EventType>, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(Scope::Channel(cid), filter, Arc::new(callback))
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub async fn dispatch(&self, event: Event) -> Applied {
        let applied = {
            let mut store = self.store.lock().await;
            store.apply(&event, Instant::now())
        };
        trace!(event_type = %event.kind, ?applied, "state: event applied");
        self.notify(&event);
        applied
    }

    /// Replays a batch in order through the same path as live frames.
    pub async fn dispatch_all(&self, events: Vec<Event>) -> usize {
        let mut changed = 0;
        for event in events {
            if self.dispatch(event).await.is_changed() {
                changed += 1;
            }
        }
        changed
    }

    fn register(&self, scope: Scope, filter: Option<EventType>, callback: Listener) -> Subscription {
        let id = self.listeners.add(scope.clone(), filter, callback);
        Subscription {
            registry: Arc::downgrade(&self.listeners),
            scope,
            id,
        }
    }

    fn notify(&self, event: &Event) {
        for listener in self.listeners.matching(event) {
            listener(event);
        }
        // No receivers is not an error.
        let _ = self.events.send(event.clone());
    }

    /// Periodically expires typing indicators and emits `typing.stop` for
    /// each. The task ends once the dispatcher is dropped.
    pub fn spawn_typing_sweep(self: &Arc<Self>, every: Duration, timeout: Duration) -> JoinHandle<()> {
        let dispatcher = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(dispatcher) = dispatcher.upgrade() else {
                    break;
                };
                let expired = {
                    let mut store = dispatcher.store.lock().await;
                    let expired = store.sweep_typing(Instant::now(), timeout);
                    expired
                        .into_iter()
                        .map(|(cid, user_id)| {
                            let user = store
                                .client()
                                .user(&user_id)
                                .cloned()
                                .unwrap_or_else(|| User::new(user_id));
                            (cid, user)
                        })
                        .collect::<Vec<_>>()
                };
                for (cid, user) in expired {
                    debug!(%cid, user_id = %user.id, "state: typing indicator expired");
                    let event = Event::new(EventType::TypingStop)
                        .with_cid(cid)
                        .with_user(user);
                    dispatcher.dispatch(event).await;
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
