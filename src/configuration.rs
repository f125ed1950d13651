//! The immutable settings ("seasoning") read once when a [`PoolManager`] is initialised.
//!
//! Every section has defaults suitable for a local, out-of-the-box RabbitMq installation:
//! `Settings::default()` is enough to get started.
//!
//! [`PoolManager`]: crate::pool::PoolManager
use crate::amqp::configuration::RabbitMqSettings;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
/// Top-level configuration, grouping connection parameters and the knobs of each layer.
pub struct Settings {
    #[serde(default)]
    pub rabbit_mq: RabbitMqSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub delivery: DeliverySettings,
    #[serde(default)]
    pub consumer: ConsumerSettings,
}

/// How [`ConnectionPool`](crate::pool::ConnectionPool) picks the connection a new channel
/// is opened on.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionSelection {
    /// Cycle through the connection slots in order.
    #[default]
    RoundRobin,
    /// Pick the connection with the fewest live channels derived from it.
    LeastLoaded,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
/// Sizing of the connection pool and of the two channel pools.
pub struct PoolSettings {
    /// Number of long-lived connections, established eagerly.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub connection_pool_count: usize,
    /// Capacity of the standard (auto-ack friendly) channel pool.
    /// The pool is pre-warmed up to this capacity.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub channel_pool_count: usize,
    /// Capacity of the ackable (manual acknowledgment) channel pool.
    /// Ackable channels are only created on demand.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub ackable_channel_pool_count: usize,
    pub connection_selection: ConnectionSelection,
    /// Upper bound on how long reconnecting a dead connection slot may take, in seconds.
    pub reconnect_timeout_seconds: u64,
    /// Enable publisher confirms on pooled channels.
    pub publisher_confirms: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connection_pool_count: 1,
            channel_pool_count: 10,
            ackable_channel_pool_count: 5,
            connection_selection: ConnectionSelection::RoundRobin,
            reconnect_timeout_seconds: 10,
            publisher_confirms: false,
        }
    }
}

impl PoolSettings {
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
/// Behaviour of [`DeliveryService`](crate::delivery::DeliveryService) operations.
pub struct DeliverySettings {
    /// When `true`, transport failures of single-item operations are returned to the caller
    /// as errors. When `false`, they are logged and reported as a plain failure
    /// (`false`/`None`).
    pub propagate_errors: bool,
    /// Pause between messages (and between batches) of multi-message publishes.
    pub throttle_fast_body_loops: bool,
    /// Length of the pause applied when `throttle_fast_body_loops` is enabled.
    pub throttle_interval_millis: u64,
    /// Batch size used when a batched publish does not specify one.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub default_batch_size: usize,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            propagate_errors: false,
            throttle_fast_body_loops: true,
            throttle_interval_millis: 1,
            default_batch_size: 100,
        }
    }
}

impl DeliverySettings {
    /// The pause between messages, if throttling is enabled.
    pub fn throttle_interval(&self) -> Option<Duration> {
        self.throttle_fast_body_loops
            .then(|| Duration::from_millis(self.throttle_interval_millis))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
/// Quality of service and dispatch mode of consumers.
pub struct ConsumerSettings {
    /// Prefetch window size in bytes. RabbitMq only supports `0` (no limit).
    pub qos_prefetch_size: u32,
    /// Maximum number of unacknowledged deliveries a consumer may hold at once.
    pub qos_prefetch_count: u16,
    /// Selects, for the whole process, whether consumers are driven by asynchronous
    /// handlers ([`ConsumerFactory::create_async_consumer`]) or synchronous ones
    /// ([`ConsumerFactory::create_consumer`]).
    ///
    /// [`ConsumerFactory::create_async_consumer`]: crate::consumers::ConsumerFactory::create_async_consumer
    /// [`ConsumerFactory::create_consumer`]: crate::consumers::ConsumerFactory::create_consumer
    pub dispatch_consumers_async: bool,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            qos_prefetch_size: 0,
            qos_prefetch_count: 120,
            dispatch_consumers_async: false,
        }
    }
}
