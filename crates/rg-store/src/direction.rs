use std::sync::Arc;

use async_trait::async_trait;
use rg_common::{Direction, Message, MessageCriteria, MessageStatus};

use crate::error::{Result, StoreError};
use crate::repository::MessageStore;

/// Keeps outbound (to connections) and inbound (to applications) traffic in
/// separate child stores. Listings without a direction merge both.
pub struct DirectionMessageStore {
    to_connections: Arc<dyn MessageStore>,
    to_applications: Arc<dyn MessageStore>,
}

impl DirectionMessageStore {
    pub fn new(to_connections: Arc<dyn MessageStore>, to_applications: Arc<dyn MessageStore>) -> Self {
        Self { to_connections, to_applications }
    }

    fn store_for(&self, direction: Direction) -> Option<&Arc<dyn MessageStore>> {
        match direction {
            Direction::ToConnections => Some(&self.to_connections),
            Direction::ToApplications => Some(&self.to_applications),
            Direction::Unknown => None,
        }
    }
}

#[async_trait]
impl MessageStore for DirectionMessageStore {
    async fn save_or_update(&self, message: &mut Message) -> Result<()> {
        let store = self.store_for(message.direction).ok_or_else(|| {
            StoreError::rejected(format!("message {} has no direction", message.reference))
        })?;
        store.save_or_update(message).await
    }

    async fn update_status(&self, criteria: &MessageCriteria, status: MessageStatus) -> Result<u64> {
        match criteria.direction.and_then(|d| self.store_for(d)) {
            Some(store) => store.update_status(criteria, status).await,
            None => {
                let outbound = self.to_connections.update_status(criteria, status).await?;
                let inbound = self.to_applications.update_status(criteria, status).await?;
                Ok(outbound + inbound)
            }
        }
    }

    async fn list(&self, criteria: &MessageCriteria) -> Result<Vec<Message>> {
        match criteria.direction {
            Some(Direction::Unknown) => Ok(Vec::new()),
            Some(direction) => match self.store_for(direction) {
                Some(store) => store.list(criteria).await,
                None => Ok(Vec::new()),
            },
            None => {
                let wide = criteria.widened();
                let mut merged = self.to_connections.list(&wide).await?;
                merged.extend(self.to_applications.list(&wide).await?);
                Ok(criteria.sort_and_page(merged))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryMessageStore;

    #[tokio::test]
    async fn test_messages_split_by_direction() {
        let outbound = Arc::new(InMemoryMessageStore::new());
        let inbound = Arc::new(InMemoryMessageStore::new());
        let store = DirectionMessageStore::new(outbound.clone(), inbound.clone());

        let mut out_msg = Message::new().direction(Direction::ToConnections);
        let mut in_msg = Message::new().direction(Direction::ToApplications);
        store.save_or_update(&mut out_msg).await.unwrap();
        store.save_or_update(&mut in_msg).await.unwrap();

        assert_eq!(outbound.len(), 1);
        assert_eq!(inbound.len(), 1);

        let all = store.list(&MessageCriteria::new()).await.unwrap();
        assert_eq!(all.len(), 2);

        let inbound_only = store
            .list(&MessageCriteria::new().direction(Direction::ToApplications))
            .await
            .unwrap();
        assert_eq!(inbound_only.len(), 1);
        assert_eq!(inbound_only[0].direction, Direction::ToApplications);
    }

    #[tokio::test]
    async fn test_unknown_direction_is_rejected() {
        let store = DirectionMessageStore::new(
            Arc::new(InMemoryMessageStore::new()),
            Arc::new(InMemoryMessageStore::new()),
        );
        let mut message = Message::new();

        let result = store.save_or_update(&mut message).await;
        assert!(matches!(result, Err(StoreError::Rejected { .. })));
        assert!(message.id.is_none());
    }
}
