use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rg_common::{Message, MessageCriteria, MessageId, MessageStatus};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::repository::MessageStore;

/// Process-local store. Used by tests and by gateways running without a
/// database.
pub struct InMemoryMessageStore {
    messages: RwLock<BTreeMap<MessageId, Message>>,
    next_id: AtomicI64,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    pub fn get(&self, id: MessageId) -> Option<Message> {
        self.messages.read().get(&id).cloned()
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn save_or_update(&self, message: &mut Message) -> Result<()> {
        let mut messages = self.messages.write();
        match message.id {
            None => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                message.id = Some(id);
                messages.insert(id, message.clone());
                debug!(message_id = id, status = %message.status, "Inserted message");
            }
            Some(id) => {
                let slot = messages.get_mut(&id).ok_or(StoreError::NotFound { id })?;
                *slot = message.clone();
                debug!(message_id = id, status = %message.status, "Updated message");
            }
        }
        Ok(())
    }

    async fn update_status(&self, criteria: &MessageCriteria, status: MessageStatus) -> Result<u64> {
        let now = Utc::now();
        let mut updated = 0;
        for message in self.messages.write().values_mut() {
            if criteria.matches(message) {
                message.status = status;
                message.modification_time = Some(now);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn list(&self, criteria: &MessageCriteria) -> Result<Vec<Message>> {
        let matching: Vec<Message> = self
            .messages
            .read()
            .values()
            .filter(|m| criteria.matches(m))
            .cloned()
            .collect();
        Ok(criteria.sort_and_page(matching))
    }
}
