//! RelayGate routing engine
//!
//! - `RoutingEngine` - registry of processor and receiver services and the
//!   priority-ordered routing decision
//! - `ProcessorService` / `ReceiverService` - queue, concurrency, actions and
//!   lifecycle around a user connector
//! - `Acceptor` / `Action` - routing predicates and message mutation steps
//! - `ReconnectSupervisor` - retry/backoff for connectors with a live link
//! - `RetryScheduler` - periodic retry of failed messages

pub mod acceptor;
pub mod action;
pub mod connector;
pub mod connectors;
pub mod engine;
pub mod lifecycle;
pub mod processor_service;
pub mod receiver_service;
pub mod service;
pub mod supervisor;

pub use acceptor::{Acceptor, AcceptorPredicate};
pub use action::{run_actions, Action, ActionHandler, Execution, PipelineOutcome};
pub use connector::{Connector, MessageProducer, Processor, Receiver};
pub use connectors::{FakeProcessor, LogProcessor, RoundRobinProcessor};
pub use engine::{normalize_id, EngineConfig, EngineState, RoutingEngine};
pub use lifecycle::{RetryScheduler, RetrySchedulerConfig};
pub use processor_service::{ProcessorService, DEFAULT_MAX_CONCURRENT_MSGS, DEFAULT_PRIORITY};
pub use receiver_service::ReceiverService;
pub use service::{MessageRouter, RedeliveryPolicy, ServiceState};
pub use supervisor::{Connection, ConnectionState, ReconnectConfig, ReconnectSupervisor};

pub use rg_common::{GatewayError, Result};
