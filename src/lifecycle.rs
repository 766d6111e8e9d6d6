use crate::conversation::counterparty;
use crate::hub::BroadcastHub;
use crate::store::MessageStore;
use crate::types::{HubEvent, Message, MessageStatus};
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LifecycleTiming {
    /// Delay from `queued` to `sent`.
    pub sent_after: Duration,
    /// Delay from `sent` to `delivered` (or `failed`).
    pub delivered_after: Duration,
    /// Probability in `[0, 1]` that a sent message fails instead of delivering.
    pub failure_rate: f64,
}

impl Default for LifecycleTiming {
    fn default() -> Self {
        Self {
            sent_after: Duration::from_millis(1000),
            delivered_after: Duration::from_millis(2000),
            failure_rate: 0.0,
        }
    }
}

type TaskMap = Arc<Mutex<HashMap<String, AbortHandle>>>;

/// Drives outbound messages through `queued -> sent -> delivered | failed`.
///
/// Each message gets one task that performs both transitions in order, so a
/// message never has more than one pending transition.
pub struct LifecycleScheduler {
    store: Arc<MessageStore>,
    hub: Arc<BroadcastHub>,
    system_prefix: String,
    timing: LifecycleTiming,
    tasks: TaskMap,
}

impl LifecycleScheduler {
    pub fn new(
        store: Arc<MessageStore>,
        hub: Arc<BroadcastHub>,
        system_prefix: impl Into<String>,
        timing: LifecycleTiming,
    ) -> Self {
        Self {
            store,
            hub,
            system_prefix: system_prefix.into(),
            timing,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn the lifecycle task for a freshly created message.
    pub fn schedule(&self, message_id: &str) {
        let store = self.store.clone();
        let hub = self.hub.clone();
        let prefix = self.system_prefix.clone();
        let timing = self.timing;
        let tasks = self.tasks.clone();
        let id = message_id.to_string();

        // Hold the map while spawning so the task can't deregister before it is registered.
        let mut guard = lock(&self.tasks);
        let handle = tokio::spawn(async move {
            run(&store, &hub, &prefix, timing, &id).await;
            lock(&tasks).remove(&id);
        });
        if let Some(previous) = guard.insert(message_id.to_string(), handle.abort_handle()) {
            previous.abort();
        }
    }

    /// Abort the pending transitions of one message. Returns `true` if a task was pending.
    pub fn cancel(&self, message_id: &str) -> bool {
        match lock(&self.tasks).remove(message_id) {
            Some(handle) => {
                handle.abort();
                debug!(message_id, "lifecycle cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<AbortHandle> = lock(&self.tasks).drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.abort();
        }
        drained.len()
    }

    pub fn pending(&self) -> usize {
        lock(&self.tasks).len()
    }
}

impl Drop for LifecycleScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn lock(
    tasks: &Mutex<HashMap<String, AbortHandle>>,
) -> MutexGuard<'_, HashMap<String, AbortHandle>> {
    tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run(
    store: &MessageStore,
    hub: &BroadcastHub,
    prefix: &str,
    timing: LifecycleTiming,
    id: &str,
) {
    tokio::time::sleep(timing.sent_after).await;
    if advance(store, hub, prefix, id, MessageStatus::Sent).await.is_none() {
        return;
    }

    tokio::time::sleep(timing.delivered_after).await;
    let failed = timing.failure_rate > 0.0
        && rand::thread_rng().gen_bool(timing.failure_rate.min(1.0));
    let next = if failed {
        MessageStatus::Failed
    } else {
        MessageStatus::Delivered
    };
    advance(store, hub, prefix, id, next).await;
}

/// Apply one transition and publish it. A vanished message or a transition
/// that would move backwards is dropped silently.
async fn advance(
    store: &MessageStore,
    hub: &BroadcastHub,
    prefix: &str,
    id: &str,
    next: MessageStatus,
) -> Option<Message> {
    let mut applied = false;
    let updated = store
        .update(id, |msg| {
            if !msg.status.can_advance_to(next) {
                return;
            }
            applied = true;
            msg.status = next;
            match next {
                MessageStatus::Sent => msg.error_message = None,
                MessageStatus::Delivered => msg.delivered_at = Some(Utc::now()),
                MessageStatus::Failed => {
                    msg.error_message = Some("simulated carrier failure".to_string())
                }
                MessageStatus::Queued => {}
            }
        })
        .await;

    let Some(msg) = updated else {
        debug!(message_id = id, "message vanished before transition, dropping");
        return None;
    };
    if !applied {
        return None;
    }

    info!(message_id = id, status = next.as_str(), "message status advanced");
    let room = counterparty(&msg, prefix).to_string();
    hub.publish_to_conversation(&room, HubEvent::MessageUpdated(msg.clone()), None)
        .await;
    Some(msg)
}
