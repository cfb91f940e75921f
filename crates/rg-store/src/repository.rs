use async_trait::async_trait;
use rg_common::{Message, MessageCriteria, MessageStatus};

use crate::error::Result;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert when the message has no id yet (assigning one), otherwise
    /// update the stored row. `NotFound` when the id no longer exists,
    /// `Rejected` when the backend cannot hold this kind of message.
    async fn save_or_update(&self, message: &mut Message) -> Result<()>;

    /// Set `status` on every message matching `criteria`; ordering and
    /// pagination are ignored. Returns the number of messages updated.
    async fn update_status(&self, criteria: &MessageCriteria, status: MessageStatus) -> Result<u64>;

    async fn list(&self, criteria: &MessageCriteria) -> Result<Vec<Message>>;
}
