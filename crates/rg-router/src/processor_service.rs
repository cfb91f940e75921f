//! ProcessorService - wraps an outbound connector
//!
//! Each service owns:
//! - an unbounded FIFO queue of accepted messages
//! - a semaphore bounding concurrent `process()` calls (resizable at runtime)
//! - ordered acceptors plus pre- and post-processing action lists
//! - a dispatcher task pulling from the queue while the service is started
//! - a producer channel for messages the processor itself emits (replies,
//!   delivery receipts), routed after its post-receiving actions

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rg_common::{
    DestinationType, Direction, GatewayError, Message, MessageStatus, MonitorStatus, Result, SourceType,
};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::acceptor::{accepts_all, Acceptor};
use crate::action::{add_unique, remove_existing, run_actions, Action, PipelineOutcome};
use crate::connector::{MessageProducer, Processor};
use crate::service::{
    accept_produced, catch_panic, set_status, HealthTracker, Origin, ServiceContext, ServiceState,
};

pub const DEFAULT_MAX_CONCURRENT_MSGS: usize = 1;
pub const DEFAULT_PRIORITY: i32 = 1000;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct ProcessorService {
    id: String,
    sequence: u64,
    priority: AtomicI32,
    processor: Arc<dyn Processor>,
    acceptors: RwLock<Vec<Acceptor>>,
    pre_processing_actions: RwLock<Vec<Action>>,
    post_processing_actions: RwLock<Vec<Action>>,
    post_receiving_actions: RwLock<Vec<Action>>,
    context: ServiceContext,
    state: Mutex<ServiceState>,

    queue_tx: mpsc::UnboundedSender<Message>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,

    /// Concurrency permits, one per in-flight message
    semaphore: Arc<Semaphore>,
    max_concurrent_msgs: AtomicUsize,

    queued: AtomicUsize,
    in_flight: AtomicUsize,
    health: HealthTracker,

    shutdown_tx: broadcast::Sender<()>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,

    /// Messages emitted by the processor, stamped with this direction
    produced_direction: Direction,
    produced_tx: mpsc::UnboundedSender<Message>,
    produced_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    accepting: Arc<AtomicBool>,
    pump_shutdown_tx: broadcast::Sender<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessorService {
    pub(crate) fn new(
        id: String,
        priority: i32,
        processor: Arc<dyn Processor>,
        context: ServiceContext,
        sequence: u64,
        max_concurrent_msgs: usize,
        produced_direction: Direction,
    ) -> Arc<Self> {
        let max_concurrent_msgs = max_concurrent_msgs.max(1);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let (produced_tx, produced_rx) = mpsc::unbounded_channel();
        let (pump_shutdown_tx, _) = broadcast::channel(1);

        let service = Arc::new(Self {
            id,
            sequence,
            priority: AtomicI32::new(priority),
            processor,
            acceptors: RwLock::new(Vec::new()),
            pre_processing_actions: RwLock::new(Vec::new()),
            post_processing_actions: RwLock::new(Vec::new()),
            post_receiving_actions: RwLock::new(Vec::new()),
            context,
            state: Mutex::new(ServiceState::Created),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            semaphore: Arc::new(Semaphore::new(max_concurrent_msgs)),
            max_concurrent_msgs: AtomicUsize::new(max_concurrent_msgs),
            queued: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            health: HealthTracker::default(),
            shutdown_tx,
            dispatcher: Mutex::new(None),
            produced_direction,
            produced_tx,
            produced_rx: tokio::sync::Mutex::new(produced_rx),
            accepting: Arc::new(AtomicBool::new(false)),
            pump_shutdown_tx,
            pump: Mutex::new(None),
        });

        service.processor.set_producer(service.producer());
        service
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn processor(&self) -> Arc<dyn Processor> {
        Arc::clone(&self.processor)
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::SeqCst)
    }

    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::SeqCst);
        debug!(processor_id = %self.id, priority, "Updated processor priority");
    }

    /// Registration order, the tie-break between equal priorities
    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    pub fn max_concurrent_msgs(&self) -> usize {
        self.max_concurrent_msgs.load(Ordering::SeqCst)
    }

    /// Resize the concurrency limit without dropping queued work. Growing
    /// takes effect immediately; shrinking retires permits as in-flight
    /// messages complete. Must be called from within a Tokio runtime.
    pub fn set_max_concurrent_msgs(&self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(GatewayError::invalid_argument("max concurrent messages must be at least 1"));
        }

        let previous = self.max_concurrent_msgs.swap(max, Ordering::SeqCst);
        if max > previous {
            self.semaphore.add_permits(max - previous);
        } else if max < previous {
            let semaphore = Arc::clone(&self.semaphore);
            let excess = (previous - max) as u32;
            tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(excess).await {
                    permits.forget();
                }
            });
        }

        info!(
            processor_id = %self.id,
            old_max = previous,
            new_max = max,
            "Updated processor concurrency"
        );
        Ok(())
    }

    pub fn num_queued_messages(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn num_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> MonitorStatus {
        self.health.status(self.processor.status())
    }

    /// Handle for messages the processor emits on its own
    pub fn producer(&self) -> MessageProducer {
        MessageProducer::new(self.id.clone(), self.produced_tx.clone(), Arc::clone(&self.accepting))
    }

    // ------------------------------------------------------------------
    // Acceptors and actions
    // ------------------------------------------------------------------

    pub fn acceptors(&self) -> Vec<Acceptor> {
        self.acceptors.read().clone()
    }

    pub fn add_acceptor(&self, acceptor: Acceptor) -> Result<()> {
        add_unique(&mut self.acceptors.write(), acceptor, "Acceptor")
    }

    pub fn remove_acceptor(&self, acceptor: &Acceptor) -> Result<()> {
        remove_existing(&mut self.acceptors.write(), acceptor, "Acceptor")
    }

    pub fn pre_processing_actions(&self) -> Vec<Action> {
        self.pre_processing_actions.read().clone()
    }

    pub fn add_pre_processing_action(&self, action: Action) -> Result<()> {
        add_unique(&mut self.pre_processing_actions.write(), action, "Action")
    }

    pub fn remove_pre_processing_action(&self, action: &Action) -> Result<()> {
        remove_existing(&mut self.pre_processing_actions.write(), action, "Action")
    }

    pub fn post_processing_actions(&self) -> Vec<Action> {
        self.post_processing_actions.read().clone()
    }

    pub fn add_post_processing_action(&self, action: Action) -> Result<()> {
        add_unique(&mut self.post_processing_actions.write(), action, "Action")
    }

    pub fn remove_post_processing_action(&self, action: &Action) -> Result<()> {
        remove_existing(&mut self.post_processing_actions.write(), action, "Action")
    }

    pub fn post_receiving_actions(&self) -> Vec<Action> {
        self.post_receiving_actions.read().clone()
    }

    pub fn add_post_receiving_action(&self, action: Action) -> Result<()> {
        add_unique(&mut self.post_receiving_actions.write(), action, "Action")
    }

    pub fn remove_post_receiving_action(&self, action: &Action) -> Result<()> {
        remove_existing(&mut self.post_receiving_actions.write(), action, "Action")
    }

    // ------------------------------------------------------------------
    // Routing hooks
    // ------------------------------------------------------------------

    pub fn is_accepting(&self) -> bool {
        *self.state.lock() == ServiceState::Started
    }

    /// Acceptors AND-ed together with the processor's own `supports()`
    pub fn accepts(&self, message: &Message) -> bool {
        accepts_all(&self.acceptors.read(), message) && self.processor.supports(message)
    }

    /// Queue a message. Hands the message back when the service stopped
    /// accepting in the meantime.
    pub(crate) fn enqueue(&self, message: Message) -> std::result::Result<(), Message> {
        let state = self.state.lock();
        if *state != ServiceState::Started {
            return Err(message);
        }
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.queue_tx.send(message).map_err(|e| {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            e.0
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ServiceState::Started | ServiceState::Starting => return Ok(()),
                ServiceState::Destroyed => {
                    return Err(GatewayError::invalid_state(format!(
                        "processor '{}' has been destroyed",
                        self.id
                    )))
                }
                ServiceState::Stopping => {
                    return Err(GatewayError::invalid_state(format!(
                        "processor '{}' is stopping",
                        self.id
                    )))
                }
                ServiceState::Created | ServiceState::Stopped => *state = ServiceState::Starting,
            }
        }

        *self.pump.lock() = Some(self.spawn_pump());
        self.accepting.store(true, Ordering::SeqCst);

        match self.processor.start().await {
            Ok(()) => self.health.set_connector_error(None),
            Err(e) => {
                error!(processor_id = %self.id, error = %e, "Processor connector failed to start");
                self.health.set_connector_error(Some(e.to_string()));
            }
        }

        let handle = self.spawn_dispatcher();
        *self.dispatcher.lock() = Some(handle);
        *self.state.lock() = ServiceState::Started;

        info!(
            processor_id = %self.id,
            priority = self.priority(),
            max_concurrent_msgs = self.max_concurrent_msgs(),
            queued = self.num_queued_messages(),
            "Started processor service"
        );
        Ok(())
    }

    /// Stop intake immediately, wait for in-flight messages, then run the
    /// connector's stop hook. Queued messages stay queued for a restart.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ServiceState::Started => *state = ServiceState::Stopping,
                ServiceState::Destroyed => {
                    return Err(GatewayError::invalid_state(format!(
                        "processor '{}' has been destroyed",
                        self.id
                    )))
                }
                _ => return Ok(()),
            }
        }

        let _ = self.shutdown_tx.send(());
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(processor_id = %self.id, error = %e, "Dispatcher task ended abnormally");
            }
        }

        while self.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        self.accepting.store(false, Ordering::SeqCst);
        let _ = self.pump_shutdown_tx.send(());
        let pump = self.pump.lock().take();
        if let Some(handle) = pump {
            if let Err(e) = handle.await {
                warn!(processor_id = %self.id, error = %e, "Producer pump ended abnormally");
            }
        }

        if let Err(e) = self.processor.stop().await {
            warn!(processor_id = %self.id, error = %e, "Processor connector failed to stop cleanly");
        }

        *self.state.lock() = ServiceState::Stopped;
        info!(
            processor_id = %self.id,
            queued = self.num_queued_messages(),
            "Stopped processor service"
        );
        Ok(())
    }

    /// Stop, then fail and persist whatever is still queued so a later
    /// retry picks it up. A destroyed service cannot be restarted.
    pub async fn destroy(&self) {
        if self.state() == ServiceState::Destroyed {
            return;
        }
        if let Err(e) = self.stop().await {
            debug!(processor_id = %self.id, error = %e, "Stop during destroy");
        }
        *self.state.lock() = ServiceState::Destroyed;

        let mut drained = 0;
        {
            let mut rx = self.queue_rx.lock().await;
            rx.close();
            while let Ok(mut message) = rx.try_recv() {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                set_status(&mut message, MessageStatus::Failed);
                self.context.persist(&mut message).await;
                drained += 1;
            }
        }

        let mut produced = 0;
        {
            let origin = self.origin();
            let mut rx = self.produced_rx.lock().await;
            rx.close();
            while let Ok(mut message) = rx.try_recv() {
                origin.stamp(&mut message);
                set_status(&mut message, MessageStatus::Failed);
                self.context.persist(&mut message).await;
                produced += 1;
            }
        }

        self.acceptors.write().clear();
        self.pre_processing_actions.write().clear();
        self.post_processing_actions.write().clear();
        self.post_receiving_actions.write().clear();

        info!(
            processor_id = %self.id,
            failed_queued = drained,
            failed_produced = produced,
            "Destroyed processor service"
        );
    }

    // ------------------------------------------------------------------
    // Message flow
    // ------------------------------------------------------------------

    fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut rx = service.queue_rx.lock().await;

            loop {
                let permit = tokio::select! {
                    permit = Arc::clone(&service.semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = shutdown_rx.recv() => break,
                };

                let message = tokio::select! {
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                };

                service.queued.fetch_sub(1, Ordering::SeqCst);
                service.in_flight.fetch_add(1, Ordering::SeqCst);

                let worker = Arc::clone(&service);
                tokio::spawn(async move {
                    let fallback = message.clone();
                    if let Err(panic) = catch_panic(worker.handle(message)).await {
                        worker.fail_panicked(fallback, panic).await;
                    }
                    worker.in_flight.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                });
            }

            debug!(processor_id = %service.id, "Dispatcher exiting");
        })
    }

    fn spawn_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut shutdown_rx = self.pump_shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut rx = service.produced_rx.lock().await;

            loop {
                let message = tokio::select! {
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                };
                let actions = service.post_receiving_actions();
                accept_produced(&service.context, &service.health, &service.origin(), &actions, message).await;
            }

            debug!(processor_id = %service.id, "Producer pump exiting");
        })
    }

    fn origin(&self) -> Origin {
        Origin {
            id: self.id.clone(),
            source_type: SourceType::Processor,
            direction: self.produced_direction,
        }
    }

    fn stamp(&self, message: &mut Message) {
        message.destination = Some(self.id.clone());
        message.destination_type = DestinationType::Processor;
    }

    /// A panic inside the pipeline fails the message; the permit and the
    /// in-flight count are released by the caller.
    async fn fail_panicked(&self, mut message: Message, panic: String) {
        error!(
            processor_id = %self.id,
            reference = %message.reference,
            panic = %panic,
            "Message handling panicked"
        );
        self.stamp(&mut message);
        self.health.record_failure(format!("panicked: {}", panic));
        set_status(&mut message, MessageStatus::Failed);
        self.context.persist(&mut message).await;
    }

    async fn handle(&self, mut message: Message) {
        self.stamp(&mut message);

        let actions = self.pre_processing_actions();
        let PipelineOutcome { delivered, halted, failed } = run_actions(&actions, message).await;

        for (mut message, e) in failed {
            self.health.record_failure(e.to_string());
            set_status(&mut message, MessageStatus::Failed);
            self.context.persist(&mut message).await;
        }
        for mut message in halted {
            self.context.persist(&mut message).await;
        }
        for message in delivered {
            self.deliver(message).await;
        }
    }

    async fn deliver(&self, mut message: Message) {
        self.stamp(&mut message);

        if !self.processor.supports(&message) {
            set_status(&mut message, MessageStatus::Rerouted);
            debug!(
                processor_id = %self.id,
                reference = %message.reference,
                "Processor declined message, rerouting"
            );
            self.context.reroute(message, &self.id).await;
            return;
        }

        match self.process_with_redelivery(&mut message).await {
            Ok(()) => {
                self.health.record_success();
                set_status(&mut message, MessageStatus::Processed);
                debug!(processor_id = %self.id, reference = %message.reference, "Message processed");
            }
            Err(e) => {
                self.health.record_failure(e.to_string());
                set_status(&mut message, MessageStatus::Failed);
            }
        }

        let actions = self.post_processing_actions();
        let PipelineOutcome { delivered, halted, failed } = run_actions(&actions, message).await;

        for mut message in delivered.into_iter().chain(halted) {
            self.context.persist(&mut message).await;
        }
        for (mut message, e) in failed {
            warn!(
                processor_id = %self.id,
                reference = %message.reference,
                error = %e,
                "Post-processing action failed"
            );
            self.context.persist(&mut message).await;
        }
    }

    async fn process_with_redelivery(&self, message: &mut Message) -> anyhow::Result<()> {
        let policy = &self.context.redelivery;
        let mut retry = 0;

        loop {
            match self.processor.process(message).await {
                Ok(()) => return Ok(()),
                Err(e) if retry < policy.max_redeliveries => {
                    retry += 1;
                    warn!(
                        processor_id = %self.id,
                        reference = %message.reference,
                        retry,
                        max_redeliveries = policy.max_redeliveries,
                        error = %e,
                        "Message failed, retrying"
                    );
                    tokio::time::sleep(policy.delay).await;
                }
                Err(e) => {
                    error!(
                        processor_id = %self.id,
                        reference = %message.reference,
                        retries = retry,
                        error = %e,
                        "Message failed"
                    );
                    return Err(e);
                }
            }
        }
    }
}

impl std::fmt::Debug for ProcessorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorService")
            .field("id", &self.id)
            .field("priority", &self.priority())
            .field("state", &self.state())
            .field("queued", &self.num_queued_messages())
            .finish()
    }
}
