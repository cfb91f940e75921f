use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rg_common::{Message, MessageCriteria, MessageStatus};
use tracing::info;

use crate::error::{Result, StoreError};
use crate::repository::MessageStore;

/// Dispatches by message type. Types without a dedicated store go to the
/// default store; criteria without a type span every store.
pub struct MultiMessageStore {
    stores: RwLock<HashMap<String, Arc<dyn MessageStore>>>,
    default_store: Option<Arc<dyn MessageStore>>,
}

impl MultiMessageStore {
    pub fn new(default_store: Option<Arc<dyn MessageStore>>) -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            default_store,
        }
    }

    pub fn add_store(&self, message_type: impl Into<String>, store: Arc<dyn MessageStore>) {
        let message_type = message_type.into();
        info!(message_type = %message_type, "Registered message store for type");
        self.stores.write().insert(message_type, store);
    }

    pub fn remove_store(&self, message_type: &str) -> bool {
        self.stores.write().remove(message_type).is_some()
    }

    fn store_for(&self, message_type: &str) -> Option<Arc<dyn MessageStore>> {
        self.stores
            .read()
            .get(message_type)
            .cloned()
            .or_else(|| self.default_store.clone())
    }

    fn all_stores(&self) -> Vec<Arc<dyn MessageStore>> {
        let mut stores: Vec<Arc<dyn MessageStore>> = self.stores.read().values().cloned().collect();
        if let Some(ref default_store) = self.default_store {
            stores.push(default_store.clone());
        }
        stores
    }
}

#[async_trait]
impl MessageStore for MultiMessageStore {
    async fn save_or_update(&self, message: &mut Message) -> Result<()> {
        let store = self.store_for(&message.message_type).ok_or_else(|| {
            StoreError::rejected(format!("no store handles message type '{}'", message.message_type))
        })?;
        store.save_or_update(message).await
    }

    async fn update_status(&self, criteria: &MessageCriteria, status: MessageStatus) -> Result<u64> {
        if let Some(ref message_type) = criteria.message_type {
            return match self.store_for(message_type) {
                Some(store) => store.update_status(criteria, status).await,
                None => Ok(0),
            };
        }

        let mut updated = 0;
        for store in self.all_stores() {
            updated += store.update_status(criteria, status).await?;
        }
        Ok(updated)
    }

    async fn list(&self, criteria: &MessageCriteria) -> Result<Vec<Message>> {
        if let Some(ref message_type) = criteria.message_type {
            return match self.store_for(message_type) {
                Some(store) => store.list(criteria).await,
                None => Ok(Vec::new()),
            };
        }

        let wide = criteria.widened();
        let mut merged = Vec::new();
        for store in self.all_stores() {
            merged.extend(store.list(&wide).await?);
        }
        Ok(criteria.sort_and_page(merged))
    }
}
