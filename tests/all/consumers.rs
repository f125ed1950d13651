use crate::helpers::{declare_queue, get_delivery_service, get_pool_manager, payloads, pool_settings};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warren::configuration::ConsumerSettings;
use warren::consumers::{
    ConsumerError, ConsumerFactory, ConsumerOptions, ConsumerState, Handler, HandlerError,
    Incoming, SyncHandler,
};
use warren::pool::PoolManager;
use warren::transport::memory::InMemoryBroker;

fn consumer_factory(
    pool: &PoolManager<InMemoryBroker>,
    async_dispatch: bool,
) -> ConsumerFactory<InMemoryBroker> {
    ConsumerFactory::new(
        pool.clone(),
        ConsumerSettings {
            qos_prefetch_count: 10,
            dispatch_consumers_async: async_dispatch,
            ..ConsumerSettings::default()
        },
    )
}

/// Poll `condition` until it holds, failing the test after two seconds.
async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Condition not met in time");
}

#[derive(Default, Clone)]
struct Recorder {
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Recorder {
    fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

impl SyncHandler for Recorder {
    fn handle(&self, incoming: Incoming<'_>) -> Result<(), HandlerError> {
        self.received.lock().unwrap().push(incoming.data().to_vec());
        Ok(())
    }
}

/// Fails every first delivery of a message with the given error type, then succeeds.
#[derive(Clone)]
struct FailFirst {
    fatal: bool,
    attempts: Arc<AtomicUsize>,
    successes: Arc<AtomicUsize>,
}

impl FailFirst {
    fn new(fatal: bool) -> Self {
        Self {
            fatal,
            attempts: Arc::new(AtomicUsize::new(0)),
            successes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait::async_trait]
impl Handler for FailFirst {
    async fn handle(&self, incoming: Incoming<'_>) -> Result<(), HandlerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if incoming.message.redelivered {
            self.successes.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        let error = anyhow::anyhow!("First attempt always fails");
        if self.fatal {
            Err(HandlerError::fatal(error))
        } else {
            Err(HandlerError::transient(error))
        }
    }
}

#[tokio::test]
async fn a_sync_consumer_processes_and_acknowledges_every_message() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    let payloads = payloads(5);
    service
        .publish_many("", &queue_name, &payloads)
        .await
        .unwrap();
    let recorder = Recorder::default();

    let consumer = consumer_factory(service.pool(), false)
        .create_consumer(&queue_name, ConsumerOptions::default(), recorder.clone())
        .await
        .unwrap();
    assert_eq!(consumer.state(), ConsumerState::Created);
    let mut handle = consumer.spawn();
    assert_eq!(
        handle.wait_for(ConsumerState::Consuming).await,
        ConsumerState::Consuming
    );
    eventually(|| recorder.count() == payloads.len()).await;
    handle.stop().await.unwrap();

    assert_eq!(*recorder.received.lock().unwrap(), payloads);
    assert_eq!(broker.queue_depth(&queue_name), Some(0));
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn a_transient_failure_requeues_the_message() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    service.publish("", &queue_name, b"flaky").await.unwrap();
    let handler = FailFirst::new(false);

    let consumer = consumer_factory(service.pool(), true)
        .create_async_consumer(&queue_name, ConsumerOptions::default(), handler.clone())
        .await
        .unwrap();
    let handle = consumer.spawn();
    eventually(|| handler.successes.load(Ordering::SeqCst) == 1).await;
    handle.stop().await.unwrap();

    assert_eq!(handler.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(broker.queue_depth(&queue_name), Some(0));
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn a_fatal_failure_drops_the_message() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    service.publish("", &queue_name, b"poison").await.unwrap();
    let handler = FailFirst::new(true);

    let consumer = consumer_factory(service.pool(), true)
        .create_async_consumer(&queue_name, ConsumerOptions::default(), handler.clone())
        .await
        .unwrap();
    let handle = consumer.spawn();
    eventually(|| handler.attempts.load(Ordering::SeqCst) == 1 && broker.unacked_count() == 0)
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop().await.unwrap();

    assert_eq!(handler.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(handler.successes.load(Ordering::SeqCst), 0);
    assert_eq!(broker.queue_depth(&queue_name), Some(0));
}

#[tokio::test]
async fn auto_ack_consumers_do_not_settle_messages() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    service.publish("", &queue_name, b"once").await.unwrap();
    let handler = FailFirst::new(false);
    let options = ConsumerOptions {
        auto_ack: true,
        ..ConsumerOptions::default()
    };

    let consumer = consumer_factory(service.pool(), true)
        .create_async_consumer(&queue_name, options, handler.clone())
        .await
        .unwrap();
    let handle = consumer.spawn();
    eventually(|| handler.attempts.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop().await.unwrap();

    // The failure was only logged: no redelivery.
    assert_eq!(handler.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(broker.queue_depth(&queue_name), Some(0));
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn the_wrong_handler_kind_is_rejected_before_opening_a_channel() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let pool = get_pool_manager(&broker, &pool_settings()).await;
    let opened = broker.channels_opened();

    let sync_only = consumer_factory(&pool, false)
        .create_async_consumer(&queue_name, ConsumerOptions::default(), FailFirst::new(false))
        .await;
    let async_only = consumer_factory(&pool, true)
        .create_consumer(&queue_name, ConsumerOptions::default(), Recorder::default())
        .await;

    assert!(matches!(
        sync_only.err().unwrap(),
        ConsumerError::DispatchMode {
            dispatch_consumers_async: false
        }
    ));
    assert!(matches!(
        async_only.err().unwrap(),
        ConsumerError::DispatchMode {
            dispatch_consumers_async: true
        }
    ));
    assert_eq!(broker.channels_opened(), opened);
}

#[tokio::test]
async fn stopping_a_consumer_closes_its_channel() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let pool = get_pool_manager(&broker, &pool_settings()).await;
    let pooled = broker.open_channels();

    let consumer = consumer_factory(&pool, false)
        .create_consumer(&queue_name, ConsumerOptions::default(), Recorder::default())
        .await
        .unwrap();
    assert_eq!(broker.open_channels(), pooled + 1);
    let mut state = consumer.subscribe();
    let mut handle = consumer.spawn();
    handle.wait_for(ConsumerState::Consuming).await;
    handle.stop().await.unwrap();

    assert_eq!(*state.borrow_and_update(), ConsumerState::Stopped);
    assert_eq!(broker.open_channels(), pooled);
    // The consumer channel never went through the pools.
    assert_eq!(pool.status().standard.checked_out, 0);
    assert_eq!(pool.status().ackable.size, 0);
}

#[tokio::test]
async fn a_consumer_stops_when_the_broker_cancels_it() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let pool = get_pool_manager(&broker, &pool_settings()).await;

    let consumer = consumer_factory(&pool, false)
        .create_consumer(&queue_name, ConsumerOptions::default(), Recorder::default())
        .await
        .unwrap();
    let mut handle = consumer.spawn();
    handle.wait_for(ConsumerState::Consuming).await;
    broker.close_all_channels();

    assert_eq!(
        handle.wait_for(ConsumerState::Stopped).await,
        ConsumerState::Stopped
    );
    assert!(handle.stop().await.is_err());
}
