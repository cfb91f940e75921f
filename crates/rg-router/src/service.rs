//! Pieces shared by processor and receiver services

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use rg_common::{Direction, Message, MessageStatus, MonitorStatus, SourceType};
use rg_store::MessageStore;
use tracing::{debug, error, warn};

use crate::action::{run_actions, Action, PipelineOutcome};

/// Routing entry points services use to hand messages back to the engine
#[async_trait]
pub trait MessageRouter: Send + Sync {
    /// Full routing decision over every processor
    async fn route(&self, message: Message);

    /// Routing decision restricted to processors ordered after `after_processor`
    async fn reroute(&self, message: Message, after_processor: &str);
}

/// In-connector retries before a message is marked FAILED
#[derive(Debug, Clone)]
pub struct RedeliveryPolicy {
    pub max_redeliveries: u32,
    pub delay: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: 3,
            delay: Duration::from_millis(3000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Destroyed,
}

#[derive(Clone)]
pub(crate) struct ServiceContext {
    pub store: Arc<dyn MessageStore>,
    pub router: Weak<dyn MessageRouter>,
    pub redelivery: RedeliveryPolicy,
}

impl ServiceContext {
    /// Persist failures are logged and not retried
    pub async fn persist(&self, message: &mut Message) {
        if let Err(e) = self.store.save_or_update(message).await {
            error!(
                reference = %message.reference,
                status = %message.status,
                error = %e,
                "Message state not durably recorded"
            );
        }
    }

    pub async fn route(&self, message: Message) {
        match self.router.upgrade() {
            Some(router) => router.route(message).await,
            None => warn!(reference = %message.reference, "Routing engine gone, dropping message"),
        }
    }

    pub async fn reroute(&self, message: Message, after_processor: &str) {
        match self.router.upgrade() {
            Some(router) => router.reroute(message, after_processor).await,
            None => warn!(reference = %message.reference, "Routing engine gone, dropping message"),
        }
    }
}

/// Apply a status change, logging instead of failing on an illegal edge
pub(crate) fn set_status(message: &mut Message, status: MessageStatus) {
    if let Err(e) = message.transition_to(status) {
        warn!(reference = %message.reference, error = %e, "Skipping illegal status change");
    }
}

/// Drive `future` to completion, turning an unwind into its panic message
pub(crate) async fn catch_panic<F>(future: F) -> std::result::Result<(), String>
where
    F: Future<Output = ()>,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Where a connector-produced message comes from
#[derive(Debug, Clone)]
pub(crate) struct Origin {
    pub id: String,
    pub source_type: SourceType,
    pub direction: Direction,
}

impl Origin {
    pub fn stamp(&self, message: &mut Message) {
        message.source = Some(self.id.clone());
        message.source_type = self.source_type;
        message.direction = self.direction;
    }
}

/// Stamp a produced message, run the post-receiving actions and route
/// whatever they deliver. A panic along the way fails and persists the
/// message instead of taking the caller down with it.
pub(crate) async fn accept_produced(
    context: &ServiceContext,
    health: &HealthTracker,
    origin: &Origin,
    actions: &[Action],
    message: Message,
) {
    let mut fallback = message.clone();

    let pipeline = async {
        let mut message = message;
        origin.stamp(&mut message);

        let PipelineOutcome { delivered, halted, failed } = run_actions(actions, message).await;

        for (mut message, e) in failed {
            health.record_failure(e.to_string());
            set_status(&mut message, MessageStatus::Failed);
            context.persist(&mut message).await;
        }
        for mut message in halted {
            context.persist(&mut message).await;
        }
        for mut message in delivered {
            health.record_success();
            if message.source.is_none() {
                origin.stamp(&mut message);
            }
            debug!(source = %origin.id, reference = %message.reference, "Routing produced message");
            context.route(message).await;
        }
    };

    if let Err(panic) = catch_panic(pipeline).await {
        error!(
            source = %origin.id,
            reference = %fallback.reference,
            panic = %panic,
            "Produced message handling panicked"
        );
        origin.stamp(&mut fallback);
        health.record_failure(format!("panicked: {}", panic));
        set_status(&mut fallback, MessageStatus::Failed);
        context.persist(&mut fallback).await;
    }
}

#[derive(Debug, Default)]
struct HealthInner {
    processed_any: bool,
    consecutive_failures: u64,
    last_error: Option<String>,
    connector_error: Option<String>,
}

/// Outcome of the last operations, combined with connector health in
/// `status()`
#[derive(Debug, Default)]
pub(crate) struct HealthTracker {
    inner: Mutex<HealthInner>,
}

impl HealthTracker {
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.processed_any = true;
        inner.consecutive_failures = 0;
        inner.last_error = None;
    }

    pub fn record_failure(&self, error: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.processed_any = true;
        inner.consecutive_failures += 1;
        inner.last_error = Some(error.into());
    }

    pub fn set_connector_error(&self, error: Option<String>) {
        self.inner.lock().connector_error = error;
    }

    /// - connector FAILED (reported, or its start hook errored) -> FAILED
    /// - last operation failed -> FAILED with the failure count
    /// - connector OK or last operation succeeded -> OK
    /// - otherwise UNKNOWN
    pub fn status(&self, connector: Option<MonitorStatus>) -> MonitorStatus {
        let inner = self.inner.lock();

        if let Some(ref status) = connector {
            if status.is_failed() {
                return status.clone();
            }
        }
        if connector.is_none() {
            if let Some(ref error) = inner.connector_error {
                return MonitorStatus::failed(format!("connector failed to start: {}", error));
            }
        }
        if inner.consecutive_failures > 0 {
            let detail = inner.last_error.as_deref().unwrap_or("unknown error");
            return MonitorStatus::failed(format!(
                "Connector is OK but {} messages have failed; last error: {}",
                inner.consecutive_failures, detail
            ));
        }
        match connector {
            Some(status) if status.is_ok() => status,
            _ if inner.processed_any => MonitorStatus::ok(),
            _ => MonitorStatus::unknown(),
        }
    }
}
