//! Conversation views derived from the message store.
//!
//! A message belongs to the conversation of its counterparty: the party that
//! is not the simulator's own number. The simulator's numbers are recognised
//! by a reserved prefix. When `to` carries the prefix the counterparty is
//! `from`; otherwise it is `to`. A message between two external numbers
//! (neither matching) is therefore grouped under `to`, and a message between
//! two simulator numbers under `from`.

use crate::store::MessageStore;
use crate::types::{Conversation, Message};
use std::collections::HashMap;
use std::sync::Arc;

pub fn counterparty<'a>(msg: &'a Message, system_prefix: &str) -> &'a str {
    if !system_prefix.is_empty() && msg.to.starts_with(system_prefix) {
        &msg.from
    } else {
        &msg.to
    }
}

/// Group messages by counterparty, most recently active conversation first.
pub fn group(messages: Vec<Message>, system_prefix: &str) -> Vec<Conversation> {
    let mut groups: HashMap<String, Vec<Message>> = HashMap::new();
    for msg in messages {
        let key = counterparty(&msg, system_prefix).to_string();
        groups.entry(key).or_default().push(msg);
    }

    let mut conversations: Vec<Conversation> = groups
        .into_iter()
        .filter_map(|(phone_number, mut messages)| {
            messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            let last_activity = messages.last()?.created_at;
            Some(Conversation {
                phone_number,
                messages,
                last_activity,
            })
        })
        .collect();

    // Phone number as secondary key keeps the order stable across regroupings.
    conversations.sort_by(|a, b| {
        b.last_activity
            .cmp(&a.last_activity)
            .then_with(|| a.phone_number.cmp(&b.phone_number))
    });
    conversations
}

pub struct ConversationIndex {
    store: Arc<MessageStore>,
    system_prefix: String,
}

impl ConversationIndex {
    pub fn new(store: Arc<MessageStore>, system_prefix: impl Into<String>) -> Self {
        Self {
            store,
            system_prefix: system_prefix.into(),
        }
    }

    /// Room a message's events are published to.
    pub fn room_for(&self, msg: &Message) -> String {
        counterparty(msg, &self.system_prefix).to_string()
    }

    pub async fn list_conversations(&self) -> Vec<Conversation> {
        group(self.store.all().await, &self.system_prefix)
    }

    pub async fn conversation(&self, phone_number: &str) -> Option<Conversation> {
        let messages: Vec<Message> = self
            .store
            .all()
            .await
            .into_iter()
            .filter(|m| counterparty(m, &self.system_prefix) == phone_number)
            .collect();
        group(messages, &self.system_prefix).into_iter().next()
    }
}
