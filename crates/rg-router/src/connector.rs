//! Contracts between the engine and transport connectors

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rg_common::{GatewayError, Message, MonitorStatus, Result};
use tokio::sync::mpsc;

/// Lifecycle and health hooks shared by receivers and processors. All
/// hooks are optional.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// `None` when the connector does not report health
    fn status(&self) -> Option<MonitorStatus> {
        None
    }
}

/// Outbound connector: delivers messages to an external system
#[async_trait]
pub trait Processor: Connector {
    async fn process(&self, message: &mut Message) -> anyhow::Result<()>;

    fn supports(&self, message: &Message) -> bool;

    /// Handed over at registration. Processors that receive replies or
    /// delivery receipts keep it to send those back through the gateway.
    fn set_producer(&self, _producer: MessageProducer) {}
}

/// Inbound connector: hands received messages to the gateway through the
/// producer it is given at registration
pub trait Receiver: Connector {
    fn set_producer(&self, producer: MessageProducer);
}

/// Handle a connector uses to submit messages for routing
#[derive(Clone)]
pub struct MessageProducer {
    connector_id: String,
    tx: mpsc::UnboundedSender<Message>,
    accepting: Arc<AtomicBool>,
}

impl MessageProducer {
    pub(crate) fn new(
        connector_id: String,
        tx: mpsc::UnboundedSender<Message>,
        accepting: Arc<AtomicBool>,
    ) -> Self {
        Self { connector_id, tx, accepting }
    }

    pub fn connector_id(&self) -> &str {
        &self.connector_id
    }

    /// Queue a message for routing. Fails when the owning service is not
    /// started.
    pub fn produce(&self, message: Message) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(GatewayError::invalid_state(format!(
                "connector '{}' is not accepting messages",
                self.connector_id
            )));
        }
        self.tx.send(message).map_err(|_| {
            GatewayError::invalid_state(format!("connector '{}' has been destroyed", self.connector_id))
        })
    }
}
