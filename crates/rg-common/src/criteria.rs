//! Query descriptor shared by all message store backends

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{DestinationType, Direction, Message, MessageStatus};

/// Page size used when a criteria carries no positive limit
pub const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    #[default]
    Upwards,
    Downwards,
}

/// Columns a listing can be ordered by
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderField {
    Id,
    CreationTime,
    ModificationTime,
    Status,
}

impl OrderField {
    pub fn column(self) -> &'static str {
        match self {
            OrderField::Id => "id",
            OrderField::CreationTime => "creation_time",
            OrderField::ModificationTime => "modification_time",
            OrderField::Status => "status",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageCriteria {
    /// OR-ed; empty means any status
    pub statuses: Vec<MessageStatus>,
    pub direction: Option<Direction>,
    pub message_type: Option<String>,
    pub destination: Option<String>,
    pub destination_type: Option<DestinationType>,
    /// AND-ed equality on message properties
    pub properties: BTreeMap<String, Value>,
    pub order_by: Option<OrderField>,
    pub order_type: OrderType,
    pub offset: u64,
    /// `<= 0` means the store default page size
    pub limit: i64,
}

impl MessageCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_status(mut self, status: MessageStatus) -> Self {
        if !self.statuses.contains(&status) {
            self.statuses.push(status);
        }
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn destination_type(mut self, destination_type: DestinationType) -> Self {
        self.destination_type = Some(destination_type);
        self
    }

    pub fn add_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn order_by(mut self, field: OrderField, order_type: OrderType) -> Self {
        self.order_by = Some(field);
        self.order_type = order_type;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn effective_limit(&self) -> usize {
        if self.limit <= 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.limit as usize
        }
    }

    /// Same filters and order, first page large enough to cover this page.
    /// Composite stores query children with it and page the merged result.
    pub fn widened(&self) -> Self {
        let mut wide = self.clone();
        wide.offset = 0;
        wide.limit = (self.offset as usize + self.effective_limit()) as i64;
        wide
    }

    /// Filter semantics shared by every backend, applied in memory
    pub fn matches(&self, message: &Message) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&message.status) {
            return false;
        }
        if let Some(direction) = self.direction {
            if message.direction != direction {
                return false;
            }
        }
        if let Some(ref message_type) = self.message_type {
            if &message.message_type != message_type {
                return false;
            }
        }
        if let Some(ref destination) = self.destination {
            if message.destination.as_deref() != Some(destination.as_str()) {
                return false;
            }
        }
        if let Some(destination_type) = self.destination_type {
            if message.destination_type != destination_type {
                return false;
            }
        }
        self.properties
            .iter()
            .all(|(key, expected)| message.properties.get(key) == Some(expected))
    }

    pub fn compare(&self, a: &Message, b: &Message) -> Ordering {
        let ordering = match self.order_by {
            None | Some(OrderField::Id) => a.id.cmp(&b.id),
            Some(OrderField::CreationTime) => a.creation_time.cmp(&b.creation_time),
            Some(OrderField::ModificationTime) => a.modification_time.cmp(&b.modification_time),
            Some(OrderField::Status) => a.status.code().cmp(&b.status.code()),
        };
        match self.order_type {
            OrderType::Upwards => ordering,
            OrderType::Downwards => ordering.reverse(),
        }
    }

    /// Sort (stable) and cut the requested page out of `messages`
    pub fn sort_and_page(&self, mut messages: Vec<Message>) -> Vec<Message> {
        messages.sort_by(|a, b| self.compare(a, b));
        messages
            .into_iter()
            .skip(self.offset as usize)
            .take(self.effective_limit())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: i64, status: MessageStatus) -> Message {
        let mut m = Message::new().property("to", "123");
        m.id = Some(id);
        m.status = status;
        m
    }

    #[test]
    fn test_empty_criteria_matches_everything() {
        let criteria = MessageCriteria::new();
        assert!(criteria.matches(&message(1, MessageStatus::Processed)));
        assert_eq!(criteria.effective_limit(), DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_statuses_are_ored_properties_anded() {
        let criteria = MessageCriteria::new()
            .add_status(MessageStatus::Failed)
            .add_status(MessageStatus::Unroutable)
            .add_property("to", "123");

        assert!(criteria.matches(&message(1, MessageStatus::Failed)));
        assert!(criteria.matches(&message(2, MessageStatus::Unroutable)));
        assert!(!criteria.matches(&message(3, MessageStatus::Processed)));

        let other = message(4, MessageStatus::Failed).property("to", "999");
        assert!(!criteria.matches(&other));
    }

    #[test]
    fn test_sort_and_page() {
        let messages: Vec<Message> = (1..=10).map(|i| message(i, MessageStatus::Created)).collect();
        let criteria = MessageCriteria::new()
            .order_by(OrderField::Id, OrderType::Downwards)
            .offset(2)
            .limit(3);

        let page = criteria.sort_and_page(messages);
        let ids: Vec<i64> = page.iter().filter_map(|m| m.id).collect();
        assert_eq!(ids, vec![8, 7, 6]);
    }

    #[test]
    fn test_widened_covers_requested_page() {
        let criteria = MessageCriteria::new().offset(10).limit(5);
        let wide = criteria.widened();
        assert_eq!(wide.offset, 0);
        assert_eq!(wide.limit, 15);
    }
}
