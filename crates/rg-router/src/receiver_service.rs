//! ReceiverService - wraps an inbound connector
//!
//! Messages produced by the receiver are stamped with their origin, run
//! through the post-receiving actions and handed to the routing engine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rg_common::{Direction, GatewayError, Message, MessageStatus, MonitorStatus, Result, SourceType};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::action::{add_unique, remove_existing, Action};
use crate::connector::{MessageProducer, Receiver};
use crate::service::{accept_produced, set_status, HealthTracker, Origin, ServiceContext, ServiceState};

pub struct ReceiverService {
    id: String,
    sequence: u64,
    direction: Direction,
    receiver: Arc<dyn Receiver>,
    post_receiving_actions: RwLock<Vec<Action>>,
    context: ServiceContext,
    state: Mutex<ServiceState>,

    tx: mpsc::UnboundedSender<Message>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    accepting: Arc<AtomicBool>,

    received: AtomicU64,
    health: HealthTracker,

    shutdown_tx: broadcast::Sender<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ReceiverService {
    pub(crate) fn new(
        id: String,
        receiver: Arc<dyn Receiver>,
        direction: Direction,
        context: ServiceContext,
        sequence: u64,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        let service = Arc::new(Self {
            id,
            sequence,
            direction,
            receiver,
            post_receiving_actions: RwLock::new(Vec::new()),
            context,
            state: Mutex::new(ServiceState::Created),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            accepting: Arc::new(AtomicBool::new(false)),
            received: AtomicU64::new(0),
            health: HealthTracker::default(),
            shutdown_tx,
            pump: Mutex::new(None),
        });

        service.receiver.set_producer(service.producer());
        service
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn receiver(&self) -> Arc<dyn Receiver> {
        Arc::clone(&self.receiver)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    /// Messages handed over by the receiver since creation
    pub fn num_received_messages(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    pub fn producer(&self) -> MessageProducer {
        MessageProducer::new(self.id.clone(), self.tx.clone(), Arc::clone(&self.accepting))
    }

    pub fn status(&self) -> MonitorStatus {
        self.health.status(self.receiver.status())
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

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ServiceState::Started | ServiceState::Starting => return Ok(()),
                ServiceState::Destroyed | ServiceState::Stopping => {
                    return Err(GatewayError::invalid_state(format!(
                        "receiver '{}' cannot start while {:?}",
                        self.id, *state
                    )))
                }
                ServiceState::Created | ServiceState::Stopped => *state = ServiceState::Starting,
            }
        }

        *self.pump.lock() = Some(self.spawn_pump());
        self.accepting.store(true, Ordering::SeqCst);

        match self.receiver.start().await {
            Ok(()) => self.health.set_connector_error(None),
            Err(e) => {
                error!(receiver_id = %self.id, error = %e, "Receiver connector failed to start");
                self.health.set_connector_error(Some(e.to_string()));
            }
        }

        *self.state.lock() = ServiceState::Started;
        info!(receiver_id = %self.id, direction = ?self.direction, "Started receiver service");
        Ok(())
    }

    /// Stop intake, let the message being handled finish, then run the
    /// connector's stop hook.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ServiceState::Started => *state = ServiceState::Stopping,
                ServiceState::Destroyed => {
                    return Err(GatewayError::invalid_state(format!(
                        "receiver '{}' has been destroyed",
                        self.id
                    )))
                }
                _ => return Ok(()),
            }
        }

        self.accepting.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        let pump = self.pump.lock().take();
        if let Some(handle) = pump {
            if let Err(e) = handle.await {
                warn!(receiver_id = %self.id, error = %e, "Receiver pump ended abnormally");
            }
        }

        if let Err(e) = self.receiver.stop().await {
            warn!(receiver_id = %self.id, error = %e, "Receiver connector failed to stop cleanly");
        }

        *self.state.lock() = ServiceState::Stopped;
        info!(receiver_id = %self.id, "Stopped receiver service");
        Ok(())
    }

    /// Stop, then fail and persist messages that were produced but never
    /// routed.
    pub async fn destroy(&self) {
        if self.state() == ServiceState::Destroyed {
            return;
        }
        if let Err(e) = self.stop().await {
            debug!(receiver_id = %self.id, error = %e, "Stop during destroy");
        }
        *self.state.lock() = ServiceState::Destroyed;

        let mut drained = 0;
        {
            let mut rx = self.rx.lock().await;
            rx.close();
            let origin = self.origin();
            while let Ok(mut message) = rx.try_recv() {
                origin.stamp(&mut message);
                set_status(&mut message, MessageStatus::Failed);
                self.context.persist(&mut message).await;
                drained += 1;
            }
        }
        self.post_receiving_actions.write().clear();

        info!(receiver_id = %self.id, failed_pending = drained, "Destroyed receiver service");
    }

    fn spawn_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut rx = service.rx.lock().await;

            loop {
                let message = tokio::select! {
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                };
                service.handle(message).await;
            }

            debug!(receiver_id = %service.id, "Receiver pump exiting");
        })
    }

    fn origin(&self) -> Origin {
        Origin {
            id: self.id.clone(),
            source_type: SourceType::Receiver,
            direction: self.direction,
        }
    }

    async fn handle(&self, message: Message) {
        self.received.fetch_add(1, Ordering::SeqCst);
        let actions = self.post_receiving_actions();
        accept_produced(&self.context, &self.health, &self.origin(), &actions, message).await;
    }
}

impl std::fmt::Debug for ReceiverService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverService")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}
