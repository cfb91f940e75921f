//! Message entity routed through the gateway

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GatewayError, Result};

/// Persistence-assigned identifier
pub type MessageId = i64;

pub const ANONYMOUS_ACCOUNT: &str = "anonymous";
pub const DEFAULT_MESSAGE_TYPE: &str = "sms";

/// Which way a message travels through the gateway
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    ToApplications,
    ToConnections,
    #[default]
    Unknown,
}

impl Direction {
    pub fn code(self) -> i32 {
        match self {
            Direction::ToConnections => 1,
            Direction::ToApplications => 2,
            Direction::Unknown => 0,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Direction::ToConnections,
            2 => Direction::ToApplications,
            _ => Direction::Unknown,
        }
    }

    /// Direction of replies to a message travelling this way
    pub fn opposite(self) -> Self {
        match self {
            Direction::ToConnections => Direction::ToApplications,
            Direction::ToApplications => Direction::ToConnections,
            Direction::Unknown => Direction::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    Receiver,
    Processor,
    #[default]
    Unknown,
}

impl SourceType {
    pub fn code(self) -> i32 {
        match self {
            SourceType::Receiver => 1,
            SourceType::Processor => 2,
            SourceType::Unknown => 0,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => SourceType::Receiver,
            2 => SourceType::Processor,
            _ => SourceType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DestinationType {
    Processor,
    #[default]
    Unknown,
}

impl DestinationType {
    pub fn code(self) -> i32 {
        match self {
            DestinationType::Processor => 1,
            DestinationType::Unknown => 0,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => DestinationType::Processor,
            _ => DestinationType::Unknown,
        }
    }
}

/// Delivery state of a message. The numeric code is the persisted form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    #[default]
    Created,
    Processed,
    Failed,
    Unroutable,
    Retrying,
    Rerouted,
}

impl MessageStatus {
    pub fn code(self) -> i32 {
        match self {
            MessageStatus::Created => 1,
            MessageStatus::Processed => 2,
            MessageStatus::Failed => 3,
            MessageStatus::Unroutable => 4,
            MessageStatus::Retrying => 5,
            MessageStatus::Rerouted => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(MessageStatus::Created),
            2 => Some(MessageStatus::Processed),
            3 => Some(MessageStatus::Failed),
            4 => Some(MessageStatus::Unroutable),
            5 => Some(MessageStatus::Retrying),
            6 => Some(MessageStatus::Rerouted),
            _ => None,
        }
    }

    /// Legal lifecycle edges.
    ///
    /// `Failed` and `Unroutable` only leave through a bulk retry, and
    /// `Processed` is terminal.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        match (self, next) {
            (Created | Retrying | Rerouted, Processed | Failed | Unroutable | Rerouted) => true,
            (Failed | Unroutable, Retrying) => true,
            _ => false,
        }
    }

    /// Still waiting for a processing decision
    pub fn is_pending(self) -> bool {
        matches!(self, MessageStatus::Created | MessageStatus::Retrying | MessageStatus::Rerouted)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageStatus::Created => "CREATED",
            MessageStatus::Processed => "PROCESSED",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Unroutable => "UNROUTABLE",
            MessageStatus::Retrying => "RETRYING",
            MessageStatus::Rerouted => "REROUTED",
        };
        f.write_str(s)
    }
}

/// The unit of routed data
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Assigned by the message store on first save
    pub id: Option<MessageId>,
    pub reference: String,
    pub account_id: String,
    pub message_type: String,
    pub direction: Direction,
    pub source: Option<String>,
    pub source_type: SourceType,
    pub destination: Option<String>,
    pub destination_type: DestinationType,
    pub status: MessageStatus,
    pub properties: HashMap<String, Value>,
    pub creation_time: DateTime<Utc>,
    pub modification_time: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new() -> Self {
        Self::with_type(DEFAULT_MESSAGE_TYPE)
    }

    pub fn with_type(message_type: impl Into<String>) -> Self {
        Self {
            id: None,
            reference: uuid::Uuid::new_v4().to_string(),
            account_id: ANONYMOUS_ACCOUNT.to_string(),
            message_type: message_type.into(),
            direction: Direction::Unknown,
            source: None,
            source_type: SourceType::Unknown,
            destination: None,
            destination_type: DestinationType::Unknown,
            status: MessageStatus::Created,
            properties: HashMap::new(),
            creation_time: Utc::now(),
            modification_time: None,
        }
    }

    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = reference.into();
        self
    }

    pub fn account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    pub fn get_property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Typed property accessor. `None` when missing or not convertible.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.properties
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    /// Property rendered as text: strings as-is, scalars via their JSON
    /// representation, null as absent.
    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.properties.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    /// Move to `next`, stamping the modification time. Illegal edges leave
    /// the message untouched.
    pub fn transition_to(&mut self, next: MessageStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(GatewayError::invalid_state(format!(
                "message {} cannot move from {} to {}",
                self.reference, self.status, next
            )));
        }
        self.status = next;
        self.modification_time = Some(Utc::now());
        Ok(())
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}
