//! `warren` is a resilient connection and channel pool for RabbitMQ, built on top of [`lapin`].
//!
//! It hands out ready-to-use channels to concurrent callers, survives broken channels and
//! connections without failing the caller's operation, and keeps manually-acknowledged
//! (ackable) channels in a pool of their own.
//!
//! [`PoolManager`](crate::pool::PoolManager) owns the pools,
//! [`DeliveryService`](crate::delivery::DeliveryService) publishes and pulls messages through
//! them and [`ConsumerFactory`](crate::consumers::ConsumerFactory) creates long-running
//! consumers. They are the best starting points to learn more about what `warren` provides.

pub mod amqp;
pub mod configuration;
pub mod consumers;
pub mod delivery;
pub mod pool;
pub mod random;
pub mod transport;
