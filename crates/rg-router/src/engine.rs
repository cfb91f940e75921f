//! RoutingEngine - registry of connector services and the routing decision
//!
//! Processors are consulted in ascending priority; equal priorities keep
//! registration order. A message goes to the first started processor whose
//! acceptors all accept it and whose connector supports it. Messages no
//! processor takes are marked UNROUTABLE and persisted once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rg_common::{
    Direction, GatewayError, Message, MessageCriteria, MessageStatus, OrderField, OrderType, Result,
};
use rg_store::MessageStore;
use tracing::{debug, error, info, warn};

use crate::connector::{Processor, Receiver};
use crate::processor_service::{ProcessorService, DEFAULT_MAX_CONCURRENT_MSGS};
use crate::receiver_service::ReceiverService;
use crate::service::{set_status, MessageRouter, RedeliveryPolicy, ServiceContext};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub redelivery: RedeliveryPolicy,
    /// Concurrency given to newly created processor services
    pub default_max_concurrent_msgs: usize,
    /// Direction stamped on messages coming from receivers
    pub receiver_direction: Direction,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redelivery: RedeliveryPolicy::default(),
            default_max_concurrent_msgs: DEFAULT_MAX_CONCURRENT_MSGS,
            receiver_direction: Direction::ToConnections,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Started,
    Stopped,
}

/// Lower-cased with all whitespace removed
pub fn normalize_id(id: &str) -> Result<String> {
    let normalized: String = id
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    if normalized.is_empty() {
        return Err(GatewayError::invalid_argument("connector id must not be empty"));
    }
    Ok(normalized)
}

pub struct RoutingEngine {
    processors: DashMap<String, Arc<ProcessorService>>,
    receivers: DashMap<String, Arc<ReceiverService>>,
    sequence: AtomicU64,
    store: Arc<dyn MessageStore>,
    config: EngineConfig,
    state: Mutex<EngineState>,
    weak_self: Weak<RoutingEngine>,
}

impl RoutingEngine {
    /// Build an engine in the started state
    pub fn new(store: Arc<dyn MessageStore>, config: EngineConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            processors: DashMap::new(),
            receivers: DashMap::new(),
            sequence: AtomicU64::new(0),
            store,
            config,
            state: Mutex::new(EngineState::Started),
            weak_self: weak_self.clone(),
        })
    }

    pub fn store(&self) -> Arc<dyn MessageStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    fn context(&self) -> ServiceContext {
        let router: Weak<dyn MessageRouter> = self.weak_self.clone();
        ServiceContext {
            store: Arc::clone(&self.store),
            router,
            redelivery: self.config.redelivery.clone(),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Processors
    // ------------------------------------------------------------------

    /// Register and start a processor. `AlreadyExists` when the normalized
    /// id is taken; the existing registration is left untouched.
    pub async fn create_processor(
        &self,
        id: &str,
        priority: i32,
        processor: Arc<dyn Processor>,
    ) -> Result<Arc<ProcessorService>> {
        self.create_processor_with(id, priority, processor, |_| Ok(())).await
    }

    /// Register a processor, run `configure` on it while it is still
    /// `Created` (routing skips it), then start it if the engine is
    /// started. A `configure` error unregisters and destroys the service.
    pub async fn create_processor_with<F>(
        &self,
        id: &str,
        priority: i32,
        processor: Arc<dyn Processor>,
        configure: F,
    ) -> Result<Arc<ProcessorService>>
    where
        F: FnOnce(&ProcessorService) -> Result<()>,
    {
        let id = normalize_id(id)?;

        let service = match self.processors.entry(id.clone()) {
            Entry::Occupied(_) => return Err(GatewayError::already_exists("Processor", id)),
            Entry::Vacant(vacant) => {
                let service = ProcessorService::new(
                    id.clone(),
                    priority,
                    processor,
                    self.context(),
                    self.next_sequence(),
                    self.config.default_max_concurrent_msgs,
                    self.config.receiver_direction.opposite(),
                );
                vacant.insert(Arc::clone(&service));
                service
            }
        };

        if let Err(e) = configure(&service) {
            self.processors.remove(&id);
            service.destroy().await;
            warn!(processor_id = %id, error = %e, "Processor configuration rejected");
            return Err(e);
        }

        if self.state() == EngineState::Started {
            service.start().await?;
        }

        info!(processor_id = %id, priority, "Created processor service");
        Ok(service)
    }

    /// Unregister, stop and destroy a processor
    pub async fn remove_processor(&self, id: &str) -> Result<()> {
        let key = normalize_id(id).map_err(|_| GatewayError::not_found("Processor", id))?;
        let (_, service) = self
            .processors
            .remove(&key)
            .ok_or_else(|| GatewayError::not_found("Processor", key.clone()))?;

        service.destroy().await;
        info!(processor_id = %key, "Removed processor service");
        Ok(())
    }

    pub fn processor(&self, id: &str) -> Option<Arc<ProcessorService>> {
        let key = normalize_id(id).ok()?;
        self.processors.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot in routing order
    pub fn processors(&self) -> Vec<Arc<ProcessorService>> {
        let mut services: Vec<Arc<ProcessorService>> =
            self.processors.iter().map(|entry| Arc::clone(entry.value())).collect();
        services.sort_by_key(|s| (s.priority(), s.sequence()));
        services
    }

    // ------------------------------------------------------------------
    // Receivers
    // ------------------------------------------------------------------

    pub async fn create_receiver(&self, id: &str, receiver: Arc<dyn Receiver>) -> Result<Arc<ReceiverService>> {
        let id = normalize_id(id)?;

        let service = match self.receivers.entry(id.clone()) {
            Entry::Occupied(_) => return Err(GatewayError::already_exists("Receiver", id)),
            Entry::Vacant(vacant) => {
                let service = ReceiverService::new(
                    id.clone(),
                    receiver,
                    self.config.receiver_direction,
                    self.context(),
                    self.next_sequence(),
                );
                vacant.insert(Arc::clone(&service));
                service
            }
        };

        if self.state() == EngineState::Started {
            service.start().await?;
        }

        info!(receiver_id = %id, "Created receiver service");
        Ok(service)
    }

    pub async fn remove_receiver(&self, id: &str) -> Result<()> {
        let key = normalize_id(id).map_err(|_| GatewayError::not_found("Receiver", id))?;
        let (_, service) = self
            .receivers
            .remove(&key)
            .ok_or_else(|| GatewayError::not_found("Receiver", key.clone()))?;

        service.destroy().await;
        info!(receiver_id = %key, "Removed receiver service");
        Ok(())
    }

    pub fn receiver(&self, id: &str) -> Option<Arc<ReceiverService>> {
        let key = normalize_id(id).ok()?;
        self.receivers.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot in registration order
    pub fn receivers(&self) -> Vec<Arc<ReceiverService>> {
        let mut services: Vec<Arc<ReceiverService>> =
            self.receivers.iter().map(|entry| Arc::clone(entry.value())).collect();
        services.sort_by_key(|s| s.sequence());
        services
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    pub async fn route(&self, message: Message) {
        let candidates = self.processors();
        self.dispatch(message, candidates).await;
    }

    async fn dispatch(&self, mut message: Message, candidates: Vec<Arc<ProcessorService>>) {
        for service in candidates {
            if !service.is_accepting() || !service.accepts(&message) {
                continue;
            }
            match service.enqueue(message) {
                Ok(()) => {
                    debug!(processor_id = %service.id(), "Message routed");
                    return;
                }
                // stopped between the check and the enqueue
                Err(returned) => message = returned,
            }
        }
        self.mark_unroutable(message).await;
    }

    async fn mark_unroutable(&self, mut message: Message) {
        set_status(&mut message, MessageStatus::Unroutable);
        warn!(
            reference = %message.reference,
            source = ?message.source,
            "No processor accepted message"
        );
        if let Err(e) = self.store.save_or_update(&mut message).await {
            error!(
                reference = %message.reference,
                error = %e,
                "Unroutable message not durably recorded"
            );
        }
    }

    // ------------------------------------------------------------------
    // Retries
    // ------------------------------------------------------------------

    /// Move FAILED messages (oldest first, one page) to RETRYING and route
    /// them again. Returns how many were re-routed.
    pub async fn retry_failed_messages(&self) -> Result<usize> {
        self.retry_messages(MessageStatus::Failed).await
    }

    /// Same as `retry_failed_messages` for UNROUTABLE messages
    pub async fn retry_unroutable_messages(&self) -> Result<usize> {
        self.retry_messages(MessageStatus::Unroutable).await
    }

    async fn retry_messages(&self, status: MessageStatus) -> Result<usize> {
        let criteria = MessageCriteria::new()
            .add_status(status)
            .order_by(OrderField::CreationTime, OrderType::Upwards);
        let messages = self.store.list(&criteria).await?;

        if messages.is_empty() {
            debug!(status = %status, "No messages to retry");
            return Ok(0);
        }

        let mut retried = 0;
        for mut message in messages {
            if let Err(e) = message.transition_to(MessageStatus::Retrying) {
                warn!(reference = %message.reference, error = %e, "Skipping retry");
                continue;
            }
            if let Err(e) = self.store.save_or_update(&mut message).await {
                error!(reference = %message.reference, error = %e, "Could not record retry, skipping");
                continue;
            }
            self.route(message).await;
            retried += 1;
        }

        info!(status = %status, retried, "Retried messages");
        Ok(retried)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start every processor, then every receiver
    pub async fn start(&self) -> Result<()> {
        *self.state.lock() = EngineState::Started;

        for service in self.processors() {
            service.start().await?;
        }
        for service in self.receivers() {
            service.start().await?;
        }

        info!(
            processors = self.processors.len(),
            receivers = self.receivers.len(),
            "Routing engine started"
        );
        Ok(())
    }

    /// Stop every processor, then every receiver
    pub async fn stop(&self) -> Result<()> {
        *self.state.lock() = EngineState::Stopped;

        for service in self.processors() {
            service.stop().await?;
        }
        for service in self.receivers() {
            service.stop().await?;
        }

        info!("Routing engine stopped");
        Ok(())
    }
}

#[async_trait]
impl MessageRouter for RoutingEngine {
    async fn route(&self, message: Message) {
        RoutingEngine::route(self, message).await;
    }

    async fn reroute(&self, message: Message, after_processor: &str) {
        let candidates: Vec<Arc<ProcessorService>> = self
            .processors()
            .into_iter()
            .skip_while(|s| s.id() != after_processor)
            .skip(1)
            .collect();
        self.dispatch(message, candidates).await;
    }
}
