//! [`Transport`] implementation on top of [`lapin`]'s [`Connection`] and [`Channel`].
//!
//! [`Connection`]: lapin::Connection
//! [`Channel`]: lapin::Channel
use super::{
    ChannelOptions, Delivery, DeliveryStream, PublishOptions, Transport, TransportChannel,
    TransportConnection, TransportError,
};
use crate::amqp::ConnectionFactory;
use amq_protocol_types::{DeliveryTag, FieldTable};
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    Channel, Connection,
};

/// Reply code 200 - REPLY_SUCCESS
const REPLY_SUCCESS: u16 = 200;
/// Reply code 312 - NO_ROUTE
/// See https://www.rabbitmq.com/amqp-0-9-1-reference.html
const NO_ROUTE: u16 = 312;

#[async_trait::async_trait]
impl Transport for ConnectionFactory {
    type Connection = Connection;
    type Channel = Channel;

    async fn open_connection(&self) -> Result<Connection, TransportError> {
        self.new_connection().await.map_err(TransportError::Transient)
    }
}

#[async_trait::async_trait]
impl TransportConnection for Connection {
    type Channel = Channel;

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn open_channel(&self, options: ChannelOptions) -> Result<Channel, TransportError> {
        let channel = self.create_channel().await?;
        if options.publisher_confirms {
            // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }
        Ok(channel)
    }

    fn is_open(&self) -> bool {
        self.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(Connection::close(self, REPLY_SUCCESS, "Connection closed by the pool").await?)
    }
}

#[async_trait::async_trait]
impl TransportChannel for Channel {
    #[tracing::instrument(level = "debug", skip(self, payload, options))]
    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), TransportError> {
        let publish_options = BasicPublishOptions {
            mandatory: options.mandatory,
            // The immediate flag was dropped in RabbitMQ 3.0 - see https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/
            // Setting `true` will cause a not-supported error
            immediate: false,
        };
        let confirm = self
            .basic_publish(
                exchange,
                routing_key,
                publish_options,
                payload,
                options.properties.clone(),
            )
            .await?
            .await?;

        match confirm {
            Confirmation::Ack(Some(returned)) if returned.reply_code == NO_ROUTE => Err(
                TransportError::transient(format!("The message could not be routed: {returned:?}")),
            ),
            Confirmation::Nack(returned) => Err(TransportError::transient(format!(
                "The RabbitMq broker nacked the publishing of the message: {returned:?}"
            ))),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn receive(
        &self,
        queue: &str,
        auto_ack: bool,
    ) -> Result<Option<Delivery>, TransportError> {
        let message = self
            .basic_get(queue, BasicGetOptions { no_ack: auto_ack })
            .await?;
        Ok(message.map(|m| m.delivery.into()))
    }

    /// The most convenient way to get the length of a queue in AMQP is... re-declaring it.
    /// We use `passive=true` to avoid settings conflict.
    async fn message_count(&self, queue: &str) -> Result<u32, TransportError> {
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .queue_declare(queue, options, FieldTable::default())
            .await?;
        Ok(queue.message_count())
    }

    async fn set_qos(&self, prefetch_size: u32, prefetch_count: u16) -> Result<(), TransportError> {
        if prefetch_size != 0 {
            tracing::warn!(
                prefetch_size,
                "RabbitMq does not support a prefetch size, only the prefetch count is applied"
            );
        }
        Ok(self
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?)
    }

    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), TransportError> {
        Ok(self
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await?)
    }

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        let options = BasicNackOptions {
            multiple: false,
            requeue,
        };
        Ok(self.basic_nack(delivery_tag, options).await?)
    }

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        Ok(self
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, TransportError> {
        let options = BasicConsumeOptions {
            no_ack: auto_ack,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await?;
        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(TransportError::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        Ok(self
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?)
    }

    fn is_open(&self) -> bool {
        self.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(Channel::close(self, REPLY_SUCCESS, "Channel closed by the pool").await?)
    }
}
