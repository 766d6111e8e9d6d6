//! Room-based fan-out to connected viewers.
//!
//! Every subscriber owns a bounded channel. Publishing uses `try_send`, so a
//! slow viewer loses events instead of stalling everyone else, and a viewer
//! whose receiver is gone is pruned on the next publish.

use crate::types::HubEvent;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub type SubscriberId = u64;

pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Handle returned by [`BroadcastHub::connect`].
pub struct Subscription {
    pub id: SubscriberId,
    pub events: mpsc::Receiver<HubEvent>,
}

#[derive(Default)]
struct HubState {
    subscribers: HashMap<SubscriberId, mpsc::Sender<HubEvent>>,
    rooms: HashMap<String, HashSet<SubscriberId>>,
}

impl HubState {
    fn remove(&mut self, id: SubscriberId) -> bool {
        let existed = self.subscribers.remove(&id).is_some();
        self.rooms.retain(|_, members| {
            members.remove(&id);
            !members.is_empty()
        });
        existed
    }
}

pub struct BroadcastHub {
    state: RwLock<HubState>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl BroadcastHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    pub async fn connect(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.state.write().await.subscribers.insert(id, tx);
        debug!(subscriber = id, "viewer connected");
        Subscription { id, events: rx }
    }

    pub async fn disconnect(&self, id: SubscriberId) {
        if self.state.write().await.remove(id) {
            debug!(subscriber = id, "viewer disconnected");
        }
    }

    /// Add a subscriber to a room. Joining twice is a no-op.
    /// Returns `false` if the subscriber is not connected.
    pub async fn join(&self, id: SubscriberId, phone_number: &str) -> bool {
        let mut state = self.state.write().await;
        if !state.subscribers.contains_key(&id) {
            return false;
        }
        state
            .rooms
            .entry(phone_number.to_string())
            .or_default()
            .insert(id);
        true
    }

    /// Remove a subscriber from a room. Leaving a room you're not in is a no-op.
    pub async fn leave(&self, id: SubscriberId, phone_number: &str) {
        let mut state = self.state.write().await;
        if let Some(members) = state.rooms.get_mut(phone_number) {
            members.remove(&id);
            if members.is_empty() {
                state.rooms.remove(phone_number);
            }
        }
    }

    /// Deliver to every member of the room except `except`.
    /// Returns how many subscribers accepted the event.
    pub async fn publish_to_conversation(
        &self,
        phone_number: &str,
        event: HubEvent,
        except: Option<SubscriberId>,
    ) -> usize {
        let targets: Vec<(SubscriberId, mpsc::Sender<HubEvent>)> = {
            let state = self.state.read().await;
            let Some(members) = state.rooms.get(phone_number) else {
                return 0;
            };
            members
                .iter()
                .filter(|id| Some(**id) != except)
                .filter_map(|id| state.subscribers.get(id).map(|tx| (*id, tx.clone())))
                .collect()
        };
        self.fan_out(targets, event).await
    }

    /// Deliver to every connected subscriber regardless of rooms.
    pub async fn publish_global(&self, event: HubEvent) -> usize {
        let targets: Vec<(SubscriberId, mpsc::Sender<HubEvent>)> = {
            let state = self.state.read().await;
            state
                .subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };
        self.fan_out(targets, event).await
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.read().await.subscribers.len()
    }

    pub async fn room_members(&self, phone_number: &str) -> Vec<SubscriberId> {
        let state = self.state.read().await;
        let mut members: Vec<SubscriberId> = state
            .rooms
            .get(phone_number)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    async fn fan_out(
        &self,
        targets: Vec<(SubscriberId, mpsc::Sender<HubEvent>)>,
        event: HubEvent,
    ) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = id, "viewer is lagging, dropping event");
                }
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }
        if !closed.is_empty() {
            let mut state = self.state.write().await;
            for id in closed {
                state.remove(id);
                debug!(subscriber = id, "pruned closed viewer");
            }
        }
        delivered
    }
}
