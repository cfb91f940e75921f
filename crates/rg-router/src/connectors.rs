//! Built-in processors

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rg_common::{GatewayError, HealthState, Message, MonitorStatus, Result};
use tracing::info;

use crate::connector::{Connector, MessageProducer, Processor};

/// Logs every message and accepts everything
#[derive(Debug, Default)]
pub struct LogProcessor;

#[async_trait]
impl Connector for LogProcessor {}

#[async_trait]
impl Processor for LogProcessor {
    async fn process(&self, message: &mut Message) -> anyhow::Result<()> {
        info!(
            reference = %message.reference,
            message_type = %message.message_type,
            destination = ?message.destination,
            properties = ?message.properties,
            "Processed message"
        );
        Ok(())
    }

    fn supports(&self, _message: &Message) -> bool {
        true
    }
}

/// Records processed messages. Can be switched into failing mode.
#[derive(Debug, Default)]
pub struct FakeProcessor {
    messages: Mutex<Vec<Message>>,
    failing: AtomicBool,
}

impl FakeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let processor = Self::default();
        processor.set_failing(true);
        processor
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }
}

#[async_trait]
impl Connector for FakeProcessor {
    fn status(&self) -> Option<MonitorStatus> {
        if self.failing.load(Ordering::SeqCst) {
            Some(MonitorStatus::failed("fake processor is failing"))
        } else {
            Some(MonitorStatus::ok())
        }
    }
}

#[async_trait]
impl Processor for FakeProcessor {
    async fn process(&self, message: &mut Message) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("fake processor failure for {}", message.reference);
        }
        self.messages.lock().push(message.clone());
        Ok(())
    }

    fn supports(&self, _message: &Message) -> bool {
        true
    }
}

/// Spreads messages over several processors in turn. When the chosen
/// processor fails, the next ones are tried before giving up.
pub struct RoundRobinProcessor {
    processors: Vec<Arc<dyn Processor>>,
    next: AtomicUsize,
}

impl RoundRobinProcessor {
    pub fn new(processors: Vec<Arc<dyn Processor>>) -> Result<Self> {
        if processors.is_empty() {
            return Err(GatewayError::invalid_argument("round robin needs at least one processor"));
        }
        Ok(Self {
            processors,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[async_trait]
impl Connector for RoundRobinProcessor {
    async fn start(&self) -> anyhow::Result<()> {
        for processor in &self.processors {
            processor.start().await?;
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        for processor in &self.processors {
            processor.stop().await?;
        }
        Ok(())
    }

    /// Any FAILED -> FAILED; otherwise OK when at least one reports OK
    fn status(&self) -> Option<MonitorStatus> {
        let statuses: Vec<MonitorStatus> = self.processors.iter().filter_map(|p| p.status()).collect();
        if statuses.is_empty() {
            return None;
        }

        let failed: Vec<String> = statuses
            .iter()
            .filter(|s| s.is_failed())
            .map(|s| s.message.clone().unwrap_or_else(|| "failed".to_string()))
            .collect();
        if !failed.is_empty() {
            return Some(MonitorStatus::failed(format!(
                "{} of {} processors failed: {}",
                failed.len(),
                self.processors.len(),
                failed.join("; ")
            )));
        }

        if statuses.iter().any(|s| s.state == HealthState::Ok) {
            Some(MonitorStatus::ok())
        } else {
            Some(MonitorStatus::unknown())
        }
    }
}

#[async_trait]
impl Processor for RoundRobinProcessor {
    async fn process(&self, message: &mut Message) -> anyhow::Result<()> {
        let count = self.processors.len();
        let start = self.next.fetch_add(1, Ordering::SeqCst) % count;

        let mut last_error = None;
        for offset in 0..count {
            let processor = &self.processors[(start + offset) % count];
            match processor.process(message).await {
                Ok(()) => return Ok(()),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no processor available")))
    }

    fn supports(&self, message: &Message) -> bool {
        self.processors.iter().all(|p| p.supports(message))
    }

    fn set_producer(&self, producer: MessageProducer) {
        for processor in &self.processors {
            processor.set_producer(producer.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let first = Arc::new(FakeProcessor::new());
        let second = Arc::new(FakeProcessor::new());
        let rr = RoundRobinProcessor::new(vec![first.clone() as Arc<dyn Processor>, second.clone()]).unwrap();

        for _ in 0..4 {
            rr.process(&mut Message::new()).await.unwrap();
        }

        assert_eq!(first.count(), 2);
        assert_eq!(second.count(), 2);
    }

    #[tokio::test]
    async fn test_round_robin_falls_over_to_next() {
        let broken = Arc::new(FakeProcessor::failing());
        let healthy = Arc::new(FakeProcessor::new());
        let rr = RoundRobinProcessor::new(vec![broken.clone() as Arc<dyn Processor>, healthy.clone()]).unwrap();

        for _ in 0..3 {
            rr.process(&mut Message::new()).await.unwrap();
        }
        assert_eq!(healthy.count(), 3);

        healthy.set_failing(true);
        assert!(rr.process(&mut Message::new()).await.is_err());
    }

    #[test]
    fn test_round_robin_status_aggregates() {
        let a = Arc::new(FakeProcessor::new());
        let b = Arc::new(FakeProcessor::new());
        let rr = RoundRobinProcessor::new(vec![a.clone() as Arc<dyn Processor>, b.clone()]).unwrap();
        assert!(rr.status().unwrap().is_ok());

        b.set_failing(true);
        assert!(rr.status().unwrap().is_failed());

        let silent = RoundRobinProcessor::new(vec![Arc::new(LogProcessor) as Arc<dyn Processor>]).unwrap();
        assert!(silent.status().is_none());
    }

    #[test]
    fn test_round_robin_requires_processors() {
        assert!(RoundRobinProcessor::new(vec![]).is_err());
    }
}
