use fake::{Fake, Faker};
use warren::configuration::{DeliverySettings, PoolSettings};
use warren::delivery::DeliveryService;
use warren::pool::PoolManager;
use warren::transport::memory::InMemoryBroker;

pub fn pool_settings() -> PoolSettings {
    PoolSettings {
        connection_pool_count: 2,
        channel_pool_count: 4,
        ackable_channel_pool_count: 2,
        reconnect_timeout_seconds: 1,
        ..PoolSettings::default()
    }
}

pub fn delivery_settings() -> DeliverySettings {
    DeliverySettings {
        throttle_fast_body_loops: false,
        ..DeliverySettings::default()
    }
}

pub async fn get_pool_manager(
    broker: &InMemoryBroker,
    settings: &PoolSettings,
) -> PoolManager<InMemoryBroker> {
    PoolManager::initialize(broker.clone(), settings)
        .await
        .unwrap()
}

pub async fn get_delivery_service(broker: &InMemoryBroker) -> DeliveryService<InMemoryBroker> {
    let pool = get_pool_manager(broker, &pool_settings()).await;
    DeliveryService::new(pool, delivery_settings())
}

/// A queue with a random name, declared on `broker`.
pub fn declare_queue(broker: &InMemoryBroker) -> String {
    let queue_name = format!("queue-{}", Faker.fake::<u64>());
    broker.declare_queue(&queue_name);
    queue_name
}

/// `count` distinct payloads, in order.
pub fn payloads(count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| format!("message-{i}").into_bytes())
        .collect()
}
