//! Routing engine behaviour tests
//!
//! Uses hand-written processors and receivers with an in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rg_common::{Direction, Message, MessageCriteria, MessageStatus, SourceType};
use rg_router::{
    Acceptor, Action, ActionHandler, Connector, EngineConfig, Execution, FakeProcessor, GatewayError,
    MessageProducer, Processor, Receiver, RedeliveryPolicy, RoutingEngine, ServiceState,
};
use rg_store::{InMemoryMessageStore, MessageStore, StoreError};

// ============================================================================
// Test doubles
// ============================================================================

/// Counts saves on top of the in-memory store
#[derive(Default)]
struct CountingStore {
    inner: InMemoryMessageStore,
    saves: AtomicUsize,
}

#[async_trait]
impl MessageStore for CountingStore {
    async fn save_or_update(&self, message: &mut Message) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save_or_update(message).await
    }

    async fn update_status(
        &self,
        criteria: &MessageCriteria,
        status: MessageStatus,
    ) -> Result<u64, StoreError> {
        self.inner.update_status(criteria, status).await
    }

    async fn list(&self, criteria: &MessageCriteria) -> Result<Vec<Message>, StoreError> {
        self.inner.list(criteria).await
    }
}

/// Records every message; declines messages carrying `decline = true`
#[derive(Default)]
struct RecordingProcessor {
    processed: Mutex<Vec<Message>>,
}

impl RecordingProcessor {
    fn count(&self) -> usize {
        self.processed.lock().len()
    }
}

#[async_trait]
impl Connector for RecordingProcessor {}

#[async_trait]
impl Processor for RecordingProcessor {
    async fn process(&self, message: &mut Message) -> anyhow::Result<()> {
        self.processed.lock().push(message.clone());
        Ok(())
    }

    fn supports(&self, message: &Message) -> bool {
        message.get_as::<bool>("decline") != Some(true)
    }
}

/// Tracks how many `process()` calls overlap
struct ConcurrencyTracker {
    current: AtomicUsize,
    max_seen: AtomicUsize,
    done: AtomicUsize,
    hold: Duration,
}

impl ConcurrencyTracker {
    fn new(hold: Duration) -> Self {
        Self {
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            hold,
        }
    }
}

#[async_trait]
impl Connector for ConcurrencyTracker {}

#[async_trait]
impl Processor for ConcurrencyTracker {
    async fn process(&self, _message: &mut Message) -> anyhow::Result<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn supports(&self, _message: &Message) -> bool {
        true
    }
}

/// Keeps the producer handed over at registration
#[derive(Default)]
struct TestReceiver {
    producer: Mutex<Option<MessageProducer>>,
}

impl TestReceiver {
    fn produce(&self, message: Message) -> rg_router::Result<()> {
        let producer = self.producer.lock().clone();
        producer
            .ok_or_else(|| GatewayError::invalid_state("no producer"))?
            .produce(message)
    }
}

#[async_trait]
impl Connector for TestReceiver {}

impl Receiver for TestReceiver {
    fn set_producer(&self, producer: MessageProducer) {
        *self.producer.lock() = Some(producer);
    }
}

struct StopAll;

#[async_trait]
impl ActionHandler for StopAll {
    async fn execute(&self, _message: &mut Message, execution: &mut Execution) -> anyhow::Result<()> {
        execution.stop();
        Ok(())
    }
}

/// Panics on every message
struct PanickingProcessor;

#[async_trait]
impl Connector for PanickingProcessor {}

#[async_trait]
impl Processor for PanickingProcessor {
    async fn process(&self, _message: &mut Message) -> anyhow::Result<()> {
        panic!("connector bug");
    }

    fn supports(&self, _message: &Message) -> bool {
        true
    }
}

/// Panics on messages carrying `explode = true`
struct ExplodeOnFlag;

#[async_trait]
impl ActionHandler for ExplodeOnFlag {
    async fn execute(&self, message: &mut Message, _execution: &mut Execution) -> anyhow::Result<()> {
        if message.get_as::<bool>("explode") == Some(true) {
            panic!("action bug");
        }
        Ok(())
    }
}

/// Answers every delivered message with a receipt through its producer
#[derive(Default)]
struct ReceiptingProcessor {
    producer: Mutex<Option<MessageProducer>>,
}

impl ReceiptingProcessor {
    fn producer(&self) -> Option<MessageProducer> {
        self.producer.lock().clone()
    }
}

#[async_trait]
impl Connector for ReceiptingProcessor {}

#[async_trait]
impl Processor for ReceiptingProcessor {
    async fn process(&self, message: &mut Message) -> anyhow::Result<()> {
        let producer = self.producer().ok_or_else(|| anyhow::anyhow!("no producer"))?;
        let to = message.get_str("to").unwrap_or_default().to_string();
        producer.produce(Message::new().property("kind", "receipt").property("receiptFor", to))?;
        Ok(())
    }

    fn supports(&self, _message: &Message) -> bool {
        true
    }

    fn set_producer(&self, producer: MessageProducer) {
        *self.producer.lock() = Some(producer);
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn test_config() -> EngineConfig {
    EngineConfig {
        redelivery: RedeliveryPolicy {
            max_redeliveries: 0,
            delay: Duration::from_millis(10),
        },
        ..EngineConfig::default()
    }
}

fn engine_with(store: Arc<dyn MessageStore>) -> Arc<RoutingEngine> {
    rg_common::logging::init(false);
    RoutingEngine::new(store, test_config())
}

async fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

async fn wait_for_stored(store: &dyn MessageStore, status: MessageStatus, count: usize) -> Vec<Message> {
    let criteria = MessageCriteria::new().add_status(status);
    for _ in 0..300 {
        let messages = store.list(&criteria).await.unwrap();
        if messages.len() >= count {
            return messages;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    store.list(&criteria).await.unwrap()
}

fn sms(to: &str) -> Message {
    Message::new().direction(Direction::ToConnections).property("to", to)
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn test_duplicate_processor_rejected() {
    let engine = engine_with(Arc::new(InMemoryMessageStore::new()));

    let first = engine
        .create_processor("sms-out", 10, Arc::new(RecordingProcessor::default()))
        .await
        .unwrap();

    let result = engine
        .create_processor("SMS-Out", 20, Arc::new(RecordingProcessor::default()))
        .await;
    assert!(matches!(result, Err(GatewayError::AlreadyExists { .. })));

    let registered = engine.processor("sms-out").unwrap();
    assert!(Arc::ptr_eq(&first, &registered));
    assert_eq!(registered.priority(), 10);
    assert_eq!(engine.processors().len(), 1);
}

#[tokio::test]
async fn test_remove_unknown_processor_is_not_found() {
    let engine = engine_with(Arc::new(InMemoryMessageStore::new()));

    let result = engine.remove_processor("ghost").await;
    assert!(matches!(result, Err(GatewayError::NotFound { .. })));
}

#[tokio::test]
async fn test_ids_are_normalized() {
    let engine = engine_with(Arc::new(InMemoryMessageStore::new()));

    let service = engine
        .create_processor("  My Processor ", 1, Arc::new(RecordingProcessor::default()))
        .await
        .unwrap();

    assert_eq!(service.id(), "myprocessor");
    assert!(engine.processor("MYPROCESSOR").is_some());
    engine.remove_processor("my processor").await.unwrap();
    assert!(engine.processors().is_empty());
}

#[tokio::test]
async fn test_processors_listed_by_priority_then_registration() {
    let engine = engine_with(Arc::new(InMemoryMessageStore::new()));

    for (id, priority) in [("c", 5), ("a", 1), ("b", 5), ("d", 0)] {
        engine
            .create_processor(id, priority, Arc::new(RecordingProcessor::default()))
            .await
            .unwrap();
    }

    let order: Vec<String> = engine.processors().iter().map(|s| s.id().to_string()).collect();
    assert_eq!(order, vec!["d", "a", "c", "b"]);
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_lower_priority_value_wins() {
    let engine = engine_with(Arc::new(InMemoryMessageStore::new()));
    let p1 = Arc::new(RecordingProcessor::default());
    let p2 = Arc::new(RecordingProcessor::default());

    engine.create_processor("p1", 2000, p1.clone()).await.unwrap();
    engine.create_processor("p2", 1000, p2.clone()).await.unwrap();

    engine.route(sms("123")).await;

    assert!(wait_until(|| p2.count() == 1).await);
    assert_eq!(p1.count(), 0);
    assert_eq!(p2.processed.lock()[0].destination.as_deref(), Some("p2"));
}

#[tokio::test]
async fn test_acceptors_are_anded_and_removal_opens_route() {
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = engine_with(store.clone());
    let processor = Arc::new(RecordingProcessor::default());

    let service = engine.create_processor("p", 1, processor.clone()).await.unwrap();
    service.add_acceptor(Acceptor::exact_match("to", "123")).unwrap();
    service.add_acceptor(Acceptor::exact_match("from", "555")).unwrap();

    engine.route(sms("123")).await;
    let unroutable = wait_for_stored(store.as_ref(), MessageStatus::Unroutable, 1).await;
    assert_eq!(unroutable.len(), 1);
    assert_eq!(processor.count(), 0);

    service.remove_acceptor(&Acceptor::exact_match("from", "555")).unwrap();
    engine.route(sms("123")).await;

    assert!(wait_until(|| processor.count() == 1).await);
}

#[tokio::test]
async fn test_duplicate_acceptor_rejected() {
    let engine = engine_with(Arc::new(InMemoryMessageStore::new()));
    let service = engine
        .create_processor("p", 1, Arc::new(RecordingProcessor::default()))
        .await
        .unwrap();

    service.add_acceptor(Acceptor::exact_match("to", "1")).unwrap();
    let dup = service.add_acceptor(Acceptor::exact_match("to", "1"));
    assert!(matches!(dup, Err(GatewayError::AlreadyExists { .. })));

    let missing = service.remove_acceptor(&Acceptor::exact_match("to", "2"));
    assert!(matches!(missing, Err(GatewayError::NotFound { .. })));
    assert_eq!(service.acceptors().len(), 1);
}

#[tokio::test]
async fn test_unroutable_persisted_exactly_once() {
    let store = Arc::new(CountingStore::default());
    let engine = engine_with(store.clone());

    engine.route(sms("123")).await;

    assert_eq!(store.saves.load(Ordering::SeqCst), 1);
    let stored = store.list(&MessageCriteria::new()).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, MessageStatus::Unroutable);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.saves.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_processed_message_is_persisted() {
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = engine_with(store.clone());
    engine
        .create_processor("sms-out", 1, Arc::new(FakeProcessor::new()))
        .await
        .unwrap();

    engine.route(sms("123").property("custom-field", "xyz")).await;

    let processed = wait_for_stored(store.as_ref(), MessageStatus::Processed, 1).await;
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].destination.as_deref(), Some("sms-out"));
    assert_eq!(processed[0].get_str("custom-field"), Some("xyz"));
}

#[tokio::test]
async fn test_declined_message_is_rerouted_to_next_processor() {
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = engine_with(store.clone());
    let first = Arc::new(RecordingProcessor::default());
    let second = Arc::new(FakeProcessor::new());

    let service = engine.create_processor("first", 1, first.clone()).await.unwrap();
    service
        .add_pre_processing_action(Action::update("decline", true))
        .unwrap();
    engine.create_processor("second", 2, second.clone()).await.unwrap();

    engine.route(sms("123")).await;

    let processed = wait_for_stored(store.as_ref(), MessageStatus::Processed, 1).await;
    assert_eq!(processed.len(), 1);
    assert_eq!(first.count(), 0);
    assert_eq!(second.count(), 1);
    assert_eq!(processed[0].destination.as_deref(), Some("second"));
    assert_eq!(processed[0].get_as::<bool>("decline"), Some(true));
}

#[tokio::test]
async fn test_declined_by_last_processor_is_unroutable() {
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = engine_with(store.clone());
    let only = Arc::new(RecordingProcessor::default());

    let service = engine.create_processor("only", 1, only.clone()).await.unwrap();
    service
        .add_pre_processing_action(Action::update("decline", true))
        .unwrap();

    engine.route(sms("123")).await;

    let unroutable = wait_for_stored(store.as_ref(), MessageStatus::Unroutable, 1).await;
    assert_eq!(unroutable.len(), 1);
    assert_eq!(only.count(), 0);
}

#[tokio::test]
async fn test_pre_processing_stop_skips_processor() {
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = engine_with(store.clone());
    let processor = Arc::new(RecordingProcessor::default());

    let service = engine.create_processor("p", 1, processor.clone()).await.unwrap();
    service
        .add_pre_processing_action(Action::add_prefix("to", "57"))
        .unwrap();
    service
        .add_pre_processing_action(Action::custom("stop-all", StopAll))
        .unwrap();

    engine.route(sms("300")).await;

    let stored = wait_for_stored(store.as_ref(), MessageStatus::Created, 1).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].get_str("to"), Some("57300"));
    assert_eq!(processor.count(), 0);
}

#[tokio::test]
async fn test_post_processing_actions_run_before_persist() {
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = engine_with(store.clone());

    let service = engine
        .create_processor("p", 1, Arc::new(FakeProcessor::new()))
        .await
        .unwrap();
    service
        .add_post_processing_action(Action::update("delivered-by", "p"))
        .unwrap();

    engine.route(sms("1")).await;

    let processed = wait_for_stored(store.as_ref(), MessageStatus::Processed, 1).await;
    assert_eq!(processed[0].get_str("delivered-by"), Some("p"));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_max_concurrent_messages() {
    let engine = engine_with(Arc::new(InMemoryMessageStore::new()));
    let tracker = Arc::new(ConcurrencyTracker::new(Duration::from_millis(30)));

    let service = engine.create_processor("tracked", 1, tracker.clone()).await.unwrap();
    service.set_max_concurrent_msgs(2).unwrap();

    for i in 0..6 {
        engine.route(sms(&i.to_string())).await;
    }

    assert!(wait_until(|| tracker.done.load(Ordering::SeqCst) == 6).await);
    assert!(tracker.max_seen.load(Ordering::SeqCst) <= 2);
    assert_eq!(tracker.max_seen.load(Ordering::SeqCst), 2);
    assert_eq!(service.num_queued_messages(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shrinking_concurrency_limits_later_messages() {
    let engine = engine_with(Arc::new(InMemoryMessageStore::new()));
    let tracker = Arc::new(ConcurrencyTracker::new(Duration::from_millis(50)));

    let service = engine.create_processor("tracked", 1, tracker.clone()).await.unwrap();
    service.set_max_concurrent_msgs(3).unwrap();

    for i in 0..3 {
        engine.route(sms(&i.to_string())).await;
    }
    assert!(wait_until(|| tracker.current.load(Ordering::SeqCst) == 3).await);

    service.set_max_concurrent_msgs(1).unwrap();
    assert_eq!(service.max_concurrent_msgs(), 1);
    for i in 3..7 {
        engine.route(sms(&i.to_string())).await;
    }
    assert!(wait_until(|| tracker.done.load(Ordering::SeqCst) == 7).await);

    // the retired permits are gone once the original batch drained
    tracker.max_seen.store(0, Ordering::SeqCst);
    for i in 7..10 {
        engine.route(sms(&i.to_string())).await;
    }
    assert!(wait_until(|| tracker.done.load(Ordering::SeqCst) == 10).await);
    assert_eq!(tracker.max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(service.num_queued_messages(), 0);
}

#[tokio::test]
async fn test_zero_concurrency_rejected() {
    let engine = engine_with(Arc::new(InMemoryMessageStore::new()));
    let service = engine
        .create_processor("p", 1, Arc::new(FakeProcessor::new()))
        .await
        .unwrap();

    let result = service.set_max_concurrent_msgs(0);
    assert!(matches!(result, Err(GatewayError::InvalidArgument { .. })));
    assert_eq!(service.max_concurrent_msgs(), 1);
}

// ============================================================================
// Failures and retries
// ============================================================================

#[tokio::test]
async fn test_retry_with_nothing_failed_is_noop() {
    let store = Arc::new(CountingStore::default());
    let engine = engine_with(store.clone());

    assert_eq!(engine.retry_failed_messages().await.unwrap(), 0);
    assert_eq!(engine.retry_unroutable_messages().await.unwrap(), 0);
    assert_eq!(store.saves.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_message_retried_after_recovery() {
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = engine_with(store.clone());
    let processor = Arc::new(FakeProcessor::failing());

    let service = engine.create_processor("p", 1, processor.clone()).await.unwrap();

    engine.route(sms("1")).await;
    let failed = wait_for_stored(store.as_ref(), MessageStatus::Failed, 1).await;
    assert_eq!(failed.len(), 1);
    assert!(service.status().is_failed());

    processor.set_failing(false);
    assert_eq!(engine.retry_failed_messages().await.unwrap(), 1);

    let processed = wait_for_stored(store.as_ref(), MessageStatus::Processed, 1).await;
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].id, failed[0].id);
    assert_eq!(processor.count(), 1);
    assert!(service.status().is_ok());
}

#[tokio::test]
async fn test_redelivery_retries_before_failing() {
    let store = Arc::new(InMemoryMessageStore::new());
    let config = EngineConfig {
        redelivery: RedeliveryPolicy {
            max_redeliveries: 2,
            delay: Duration::from_millis(5),
        },
        ..EngineConfig::default()
    };
    let engine = RoutingEngine::new(store.clone(), config);

    struct FailTwice(AtomicUsize);

    #[async_trait]
    impl Connector for FailTwice {}

    #[async_trait]
    impl Processor for FailTwice {
        async fn process(&self, _message: &mut Message) -> anyhow::Result<()> {
            if self.0.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("transient");
            }
            Ok(())
        }

        fn supports(&self, _message: &Message) -> bool {
            true
        }
    }

    let processor = Arc::new(FailTwice(AtomicUsize::new(0)));
    engine.create_processor("p", 1, processor.clone()).await.unwrap();
    engine.route(sms("1")).await;

    let processed = wait_for_stored(store.as_ref(), MessageStatus::Processed, 1).await;
    assert_eq!(processed.len(), 1);
    assert_eq!(processor.0.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_processor_panic_fails_message_and_frees_its_slot() {
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = engine_with(store.clone());

    let service = engine
        .create_processor("buggy", 1, Arc::new(PanickingProcessor))
        .await
        .unwrap();

    engine.route(sms("1")).await;
    let failed = wait_for_stored(store.as_ref(), MessageStatus::Failed, 1).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].destination.as_deref(), Some("buggy"));
    assert!(wait_until(|| service.num_in_flight() == 0).await);
    assert!(service.status().is_failed());

    // the single permit came back, so the next message is handled too
    engine.route(sms("2")).await;
    assert_eq!(wait_for_stored(store.as_ref(), MessageStatus::Failed, 2).await.len(), 2);

    tokio::time::timeout(Duration::from_secs(2), engine.remove_processor("buggy"))
        .await
        .expect("removal hung on a leaked in-flight count")
        .unwrap();
}

#[tokio::test]
async fn test_unroutable_retried_once_processor_exists() {
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = engine_with(store.clone());

    engine.route(sms("1")).await;
    assert_eq!(wait_for_stored(store.as_ref(), MessageStatus::Unroutable, 1).await.len(), 1);

    let processor = Arc::new(FakeProcessor::new());
    engine.create_processor("late", 1, processor.clone()).await.unwrap();

    assert_eq!(engine.retry_unroutable_messages().await.unwrap(), 1);
    assert!(wait_until(|| processor.count() == 1).await);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_destroy_fails_queued_messages() {
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = engine_with(store.clone());
    let tracker = Arc::new(ConcurrencyTracker::new(Duration::from_millis(100)));

    engine.create_processor("slow", 1, tracker.clone()).await.unwrap();
    for i in 0..3 {
        engine.route(sms(&i.to_string())).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    engine.remove_processor("slow").await.unwrap();

    assert_eq!(tracker.done.load(Ordering::SeqCst), 1);
    let processed = store
        .list(&MessageCriteria::new().add_status(MessageStatus::Processed))
        .await
        .unwrap();
    let failed = store
        .list(&MessageCriteria::new().add_status(MessageStatus::Failed))
        .await
        .unwrap();
    assert_eq!(processed.len(), 1);
    assert_eq!(failed.len(), 2);
}

#[tokio::test]
async fn test_stopped_processor_is_skipped() {
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = engine_with(store.clone());
    let first = Arc::new(RecordingProcessor::default());
    let second = Arc::new(RecordingProcessor::default());

    let service = engine.create_processor("first", 1, first.clone()).await.unwrap();
    engine.create_processor("second", 2, second.clone()).await.unwrap();

    service.stop().await.unwrap();
    engine.route(sms("1")).await;

    assert!(wait_until(|| second.count() == 1).await);
    assert_eq!(first.count(), 0);
}

#[tokio::test]
async fn test_configure_runs_before_processor_is_routable() {
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = engine_with(store.clone());
    let processor = Arc::new(RecordingProcessor::default());
    let seen_state = Mutex::new(None);

    let service = engine
        .create_processor_with("p", 1, processor.clone(), |service| {
            *seen_state.lock() = Some(service.state());
            service.add_acceptor(Acceptor::exact_match("to", "1"))
        })
        .await
        .unwrap();

    assert_eq!(*seen_state.lock(), Some(ServiceState::Created));
    assert_eq!(service.state(), ServiceState::Started);

    engine.route(sms("2")).await;
    assert_eq!(wait_for_stored(store.as_ref(), MessageStatus::Unroutable, 1).await.len(), 1);
    engine.route(sms("1")).await;
    assert!(wait_until(|| processor.count() == 1).await);
}

#[tokio::test]
async fn test_rejected_configuration_leaves_no_registration() {
    let engine = engine_with(Arc::new(InMemoryMessageStore::new()));

    let result = engine
        .create_processor_with("p", 1, Arc::new(FakeProcessor::new()), |service| {
            service.add_acceptor(Acceptor::exact_match("to", "1"))?;
            service.set_max_concurrent_msgs(0)
        })
        .await;

    assert!(matches!(result, Err(GatewayError::InvalidArgument { .. })));
    assert!(engine.processor("p").is_none());
    assert!(engine.processors().is_empty());

    engine
        .create_processor("p", 1, Arc::new(FakeProcessor::new()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_destroyed_service_cannot_restart() {
    let engine = engine_with(Arc::new(InMemoryMessageStore::new()));
    let service = engine
        .create_processor("p", 1, Arc::new(FakeProcessor::new()))
        .await
        .unwrap();

    engine.remove_processor("p").await.unwrap();

    let result = service.start().await;
    assert!(matches!(result, Err(GatewayError::InvalidState { .. })));
}

// ============================================================================
// Receivers
// ============================================================================

#[tokio::test]
async fn test_received_message_is_stamped_and_routed() {
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = engine_with(store.clone());
    let processor = Arc::new(RecordingProcessor::default());
    let receiver = Arc::new(TestReceiver::default());

    engine.create_processor("sms-out", 1, processor.clone()).await.unwrap();
    let service = engine.create_receiver("http-in", receiver.clone()).await.unwrap();
    service
        .add_post_receiving_action(Action::add_prefix("to", "57"))
        .unwrap();

    receiver
        .produce(Message::new().property("to", "300"))
        .unwrap();

    assert!(wait_until(|| processor.count() == 1).await);
    let routed = processor.processed.lock()[0].clone();
    assert_eq!(routed.source.as_deref(), Some("http-in"));
    assert_eq!(routed.source_type, SourceType::Receiver);
    assert_eq!(routed.direction, Direction::ToConnections);
    assert_eq!(routed.get_str("to"), Some("57300"));
    assert_eq!(service.num_received_messages(), 1);
}

#[tokio::test]
async fn test_receiver_survives_panicking_action() {
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = engine_with(store.clone());
    let processor = Arc::new(RecordingProcessor::default());
    let receiver = Arc::new(TestReceiver::default());

    engine.create_processor("sms-out", 1, processor.clone()).await.unwrap();
    let service = engine.create_receiver("http-in", receiver.clone()).await.unwrap();
    service
        .add_post_receiving_action(Action::custom("explode", ExplodeOnFlag))
        .unwrap();

    receiver
        .produce(Message::new().property("to", "1").property("explode", true))
        .unwrap();
    receiver.produce(Message::new().property("to", "2")).unwrap();

    assert!(wait_until(|| processor.count() == 1).await);
    assert_eq!(processor.processed.lock()[0].get_str("to"), Some("2"));

    let failed = wait_for_stored(store.as_ref(), MessageStatus::Failed, 1).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].get_str("to"), Some("1"));
    assert_eq!(failed[0].source.as_deref(), Some("http-in"));
    assert_eq!(service.num_received_messages(), 2);
    assert_eq!(service.state(), ServiceState::Started);
    assert!(receiver.produce(Message::new().property("to", "3")).is_ok());
}

#[tokio::test]
async fn test_processor_produced_receipt_is_routed() {
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = engine_with(store.clone());
    let smsc = Arc::new(ReceiptingProcessor::default());
    let app = Arc::new(RecordingProcessor::default());

    let smsc_service = engine.create_processor("smsc", 1, smsc.clone()).await.unwrap();
    smsc_service.add_acceptor(Acceptor::exact_match("kind", "sms")).unwrap();
    smsc_service
        .add_post_receiving_action(Action::update("receipted", true))
        .unwrap();
    let app_service = engine.create_processor("app", 2, app.clone()).await.unwrap();
    app_service.add_acceptor(Acceptor::exact_match("kind", "receipt")).unwrap();

    engine.route(sms("300").property("kind", "sms")).await;

    assert!(wait_until(|| app.count() == 1).await);
    let receipt = app.processed.lock()[0].clone();
    assert_eq!(receipt.source.as_deref(), Some("smsc"));
    assert_eq!(receipt.source_type, SourceType::Processor);
    assert_eq!(receipt.direction, Direction::ToApplications);
    assert_eq!(receipt.get_str("receiptFor"), Some("300"));
    assert_eq!(receipt.get_as::<bool>("receipted"), Some(true));
    assert_eq!(receipt.destination.as_deref(), Some("app"));

    let producer = smsc.producer().unwrap();
    assert_eq!(producer.connector_id(), "smsc");
    smsc_service.stop().await.unwrap();
    let result = producer.produce(Message::new());
    assert!(matches!(result, Err(GatewayError::InvalidState { .. })));
}

#[tokio::test]
async fn test_stopped_receiver_rejects_messages() {
    let engine = engine_with(Arc::new(InMemoryMessageStore::new()));
    let receiver = Arc::new(TestReceiver::default());

    let service = engine.create_receiver("in", receiver.clone()).await.unwrap();
    service.stop().await.unwrap();

    let result = receiver.produce(Message::new());
    assert!(matches!(result, Err(GatewayError::InvalidState { .. })));
}

#[tokio::test]
async fn test_engine_stop_and_start() {
    let engine = engine_with(Arc::new(InMemoryMessageStore::new()));
    let processor = Arc::new(RecordingProcessor::default());
    let service = engine.create_processor("p", 1, processor.clone()).await.unwrap();
    let receiver_service = engine
        .create_receiver("in", Arc::new(TestReceiver::default()))
        .await
        .unwrap();

    engine.stop().await.unwrap();
    assert!(!service.is_accepting());
    assert_eq!(receiver_service.state(), rg_router::ServiceState::Stopped);

    engine.start().await.unwrap();
    assert!(service.is_accepting());
    engine.route(sms("1")).await;
    assert!(wait_until(|| processor.count() == 1).await);
}

// ============================================================================
// Retry scheduler
// ============================================================================

#[tokio::test]
async fn test_retry_scheduler_recovers_failed_messages() {
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = engine_with(store.clone());
    let processor = Arc::new(FakeProcessor::failing());
    engine.create_processor("p", 1, processor.clone()).await.unwrap();

    engine.route(sms("1")).await;
    assert_eq!(wait_for_stored(store.as_ref(), MessageStatus::Failed, 1).await.len(), 1);
    processor.set_failing(false);

    let scheduler = rg_router::RetryScheduler::start(
        engine.clone(),
        rg_router::RetrySchedulerConfig {
            initial_delay: Duration::from_millis(20),
            interval: Duration::from_millis(20),
            retry_unroutable: false,
        },
    );

    assert!(wait_until(|| processor.count() == 1).await);
    scheduler.shutdown().await;

    let processed = wait_for_stored(store.as_ref(), MessageStatus::Processed, 1).await;
    assert_eq!(processed.len(), 1);
}
