use crate::error::SimError;
use crate::types::{
    Direction, Message, MessageFilter, MessagePage, MessageStatus, NewMessage, Pagination,
    ReplyRequest, MESSAGE_COST,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    /// Insertion sequence -> message. Breaks `created_at` ties deterministically.
    messages: BTreeMap<u64, Message>,
    index: HashMap<String, u64>,
    next_seq: u64,
}

impl Inner {
    fn insert(&mut self, msg: Message) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(msg.id.clone(), seq);
        self.messages.insert(seq, msg);
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        let seq = self.index.get(id)?;
        self.messages.get_mut(seq)
    }

    /// Matches in ascending (`created_at`, insertion) order.
    fn matching(&self, filter: &MessageFilter) -> Vec<&Message> {
        let mut items: Vec<&Message> = self
            .messages
            .values()
            .filter(|m| filter.matches(m))
            .collect();
        // BTreeMap order is insertion order; stable sort keeps it for equal timestamps.
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        items
    }
}

/// Canonical in-memory owner of every message record.
pub struct MessageStore {
    inner: RwLock<Inner>,
    default_from: String,
}

impl MessageStore {
    pub fn new(default_from: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            default_from: default_from.into(),
        }
    }

    /// Create an outbound message in `queued` state.
    pub async fn create(&self, req: NewMessage) -> Result<Message, SimError> {
        req.validate()?;
        let from = req
            .from
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| self.default_from.clone());
        let msg = Message {
            id: new_message_id(),
            to: req.to.trim().to_string(),
            from: from.trim().to_string(),
            body: req.body,
            status: MessageStatus::Queued,
            direction: Direction::Outbound,
            created_at: Utc::now(),
            delivered_at: None,
            error_message: None,
            cost: MESSAGE_COST,
        };
        self.inner.write().await.insert(msg.clone());
        Ok(msg)
    }

    /// Record a reply that arrives already delivered from the simulated handset.
    pub async fn insert_inbound(&self, req: ReplyRequest) -> Result<Message, SimError> {
        req.validate()?;
        let now = Utc::now();
        let msg = Message {
            id: new_message_id(),
            to: req.to.trim().to_string(),
            from: req.from.trim().to_string(),
            body: req.body,
            status: MessageStatus::Delivered,
            direction: Direction::Inbound,
            created_at: now,
            delivered_at: Some(now),
            error_message: None,
            cost: MESSAGE_COST,
        };
        self.inner.write().await.insert(msg.clone());
        Ok(msg)
    }

    pub async fn get(&self, id: &str) -> Result<Message, SimError> {
        let inner = self.inner.read().await;
        inner
            .index
            .get(id)
            .and_then(|seq| inner.messages.get(seq))
            .cloned()
            .ok_or_else(|| SimError::not_found(id))
    }

    /// Newest first, one page at a time.
    pub async fn list(&self, filter: &MessageFilter, page: Pagination) -> MessagePage {
        let inner = self.inner.read().await;
        let matching = inner.matching(filter);
        let total = matching.len();
        let items: Vec<Message> = matching
            .into_iter()
            .rev()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect();
        MessagePage {
            has_more: page.offset.saturating_add(items.len()) < total,
            items,
            total,
            limit: page.limit,
            offset: page.offset,
        }
    }

    /// Every match, oldest first.
    pub async fn export(&self, filter: &MessageFilter) -> Vec<Message> {
        let inner = self.inner.read().await;
        inner.matching(filter).into_iter().cloned().collect()
    }

    /// Snapshot of all messages in insertion order.
    pub async fn all(&self) -> Vec<Message> {
        self.inner.read().await.messages.values().cloned().collect()
    }

    /// Apply `mutator` to the message and return the result.
    /// Returns `None` when the id is unknown, e.g. for a timer that outlived its message.
    pub async fn update<F>(&self, id: &str, mutator: F) -> Option<Message>
    where
        F: FnOnce(&mut Message),
    {
        let mut inner = self.inner.write().await;
        let msg = inner.get_mut(id)?;
        mutator(msg);
        Some(msg.clone())
    }

    pub async fn delete(&self, id: &str) -> Result<Message, SimError> {
        let mut inner = self.inner.write().await;
        let seq = inner.index.remove(id).ok_or_else(|| SimError::not_found(id))?;
        inner
            .messages
            .remove(&seq)
            .ok_or_else(|| SimError::not_found(id))
    }

    /// Remove everything and return the removed ids.
    pub async fn clear(&self) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let ids = inner.index.keys().cloned().collect();
        inner.messages.clear();
        inner.index.clear();
        ids
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn new_message_id() -> String {
    format!("SM{}", Uuid::new_v4().simple())
}
