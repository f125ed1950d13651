//! The narrow interface the pools rely on to talk to a message broker.
//!
//! The hierarchy is [`Transport`] -> [`TransportConnection`] -> [`TransportChannel`]:
//! channels are multiplexed over connections, connections are opened by a transport.
//!
//! Two implementations are provided:
//! - [`ConnectionFactory`](crate::amqp::ConnectionFactory), backed by [`lapin`], for a real
//!   RabbitMq broker;
//! - [`memory::InMemoryBroker`], a process-local broker with fault injection, for tests and
//!   local development.
mod delivery;
mod error;
mod rabbit_mq;
pub mod memory;

pub use delivery::{ChannelOptions, Delivery, PublishOptions};
pub use error::{TransportError, TransportErrorKind};

use amq_protocol_types::DeliveryTag;
use futures_util::stream::BoxStream;

/// A stream of deliveries pushed by the broker to a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Opens connections to a broker.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: TransportConnection<Channel = Self::Channel>;
    type Channel: TransportChannel;

    async fn open_connection(&self) -> Result<Self::Connection, TransportError>;
}

/// A long-lived session with the broker.
#[async_trait::async_trait]
pub trait TransportConnection: Send + Sync + 'static {
    type Channel: TransportChannel;

    async fn open_channel(&self, options: ChannelOptions) -> Result<Self::Channel, TransportError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A lightweight session multiplexed over a [`TransportConnection`].
///
/// A channel must never be used by two operations at the same time: the pools hand out
/// exclusive access to it.
#[async_trait::async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    /// Publish `payload` on `exchange` with the given routing key.
    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), TransportError>;

    /// Pull a single message from `queue`. `Ok(None)` means the queue is empty.
    async fn receive(&self, queue: &str, auto_ack: bool)
        -> Result<Option<Delivery>, TransportError>;

    /// The number of messages ready for delivery in `queue`.
    async fn message_count(&self, queue: &str) -> Result<u32, TransportError>;

    async fn set_qos(&self, prefetch_size: u32, prefetch_count: u16)
        -> Result<(), TransportError>;

    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), TransportError>;

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError>;

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool)
        -> Result<(), TransportError>;

    /// Ask the broker to push messages from `queue` to this channel.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, TransportError>;

    /// Stop the consumer registered with `consumer_tag`.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;
}
