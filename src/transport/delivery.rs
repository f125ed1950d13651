use amq_protocol_types::{DeliveryTag, ShortString};
use lapin::BasicProperties;

/// A message received from the broker, either pulled (`get`) or pushed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The delivery tag of the message, scoped to the channel it was received on.
    pub delivery_tag: DeliveryTag,

    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: ShortString,

    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: ShortString,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// Contains the properties and the headers of the
    /// message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            data: value.data,
        }
    }
}

/// Per-message publishing options.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// If `true`, the broker returns messages that cannot be routed to any queue and the
    /// publish fails. If `false`, unroutable messages are silently dropped.
    pub mandatory: bool,
    pub properties: BasicProperties,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            mandatory: false,
            // Delivery mode: Non-persistent (1) or persistent (2).
            properties: BasicProperties::default().with_delivery_mode(2),
        }
    }
}

/// Options fixed on a channel for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelOptions {
    /// Deliveries pulled from this channel are acknowledged manually by the caller.
    pub ackable: bool,
    /// Wait for the broker to confirm every publish.
    pub publisher_confirms: bool,
}
