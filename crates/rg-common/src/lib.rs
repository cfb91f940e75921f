//! RelayGate common types
//!
//! Shared by every crate in the workspace:
//! - `Message` and its classification enums
//! - `MessageCriteria` for querying message stores
//! - `MonitorStatus` health reporting for connectors and services
//! - `GatewayError` taxonomy

pub mod criteria;
pub mod error;
pub mod logging;
pub mod message;
pub mod status;

pub use criteria::{MessageCriteria, OrderField, OrderType, DEFAULT_PAGE_SIZE};
pub use error::{GatewayError, Result};
pub use message::{
    DestinationType, Direction, Message, MessageId, MessageStatus, SourceType,
    ANONYMOUS_ACCOUNT, DEFAULT_MESSAGE_TYPE,
};
pub use status::{HealthState, MonitorStatus};
