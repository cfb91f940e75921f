//! Message persistence for the gateway
//!
//! `MessageStore` is the single port the routing engine persists through.
//! Backends:
//! - `InMemoryMessageStore` - process-local, full criteria support
//! - `SqlMessageStore` - SQLite / PostgreSQL / MySQL through `sqlx::AnyPool` (feature `sql`)
//! - `MongoMessageStore` - one collection per direction (feature `mongo`)
//! - `MultiMessageStore` - dispatch by message type with a default fallback
//! - `DirectionMessageStore` - dispatch by direction to two child stores

pub mod direction;
pub mod error;
pub mod memory;
pub mod multi;
pub mod repository;

#[cfg(feature = "sql")]
pub mod sql;
#[cfg(feature = "mongo")]
pub mod mongo;

pub use direction::DirectionMessageStore;
pub use error::{Result, StoreError};
pub use memory::InMemoryMessageStore;
pub use multi::MultiMessageStore;
pub use repository::MessageStore;

#[cfg(feature = "sql")]
pub use sql::{SqlDialect, SqlMessageStore};
#[cfg(feature = "mongo")]
pub use mongo::MongoMessageStore;
