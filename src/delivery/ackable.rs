use crate::pool::{ChannelPair, PoolManager};
use crate::transport::{Delivery, Transport, TransportChannel, TransportError};
use amq_protocol_types::DeliveryTag;

/// Deliveries pulled with manual acknowledgment, together with the ackable channel they were
/// received on.
///
/// Deliveries must be settled on that same channel. Hand the channel back with
/// [`AckableResult::release`]: it goes back to its pool if every delivery was settled.
/// Otherwise the channel is flagged dead and closed, so that the broker requeues the
/// deliveries left unsettled; a pooled channel never carries them over to its next borrower.
///
/// Dropping the result has the same effect as releasing it. The channel is then flagged
/// dead on a background task.
pub struct AckableResult<T: Transport> {
    pool: PoolManager<T>,
    channel: Option<ChannelPair<T>>,
    deliveries: Vec<Delivery>,
    unsettled: Vec<DeliveryTag>,
}

impl<T: Transport> AckableResult<T> {
    pub(crate) fn new(
        pool: PoolManager<T>,
        channel: ChannelPair<T>,
        deliveries: Vec<Delivery>,
    ) -> Self {
        let unsettled = deliveries.iter().map(|d| d.delivery_tag).collect();
        Self {
            pool,
            channel: Some(channel),
            deliveries,
            unsettled,
        }
    }

    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }

    /// The first delivery, if any. Handy for single-message gets.
    pub fn first(&self) -> Option<&Delivery> {
        self.deliveries.first()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    /// Number of deliveries not acknowledged (or nacked) yet.
    pub fn unsettled(&self) -> usize {
        self.unsettled.len()
    }

    /// The channel the deliveries were received on.
    pub fn channel(&self) -> Option<&ChannelPair<T>> {
        self.channel.as_ref()
    }

    fn live_channel(&self) -> Result<&ChannelPair<T>, TransportError> {
        self.channel
            .as_ref()
            .ok_or_else(|| TransportError::closed("The ackable channel was released"))
    }

    pub async fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        self.live_channel()?.ack(delivery.delivery_tag, false).await?;
        self.settled(delivery.delivery_tag);
        Ok(())
    }

    pub async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        self.live_channel()?.nack(delivery.delivery_tag, requeue).await?;
        self.settled(delivery.delivery_tag);
        Ok(())
    }

    /// Acknowledge every delivery of this result still unsettled, one by one.
    ///
    /// Deliveries received on the channel by anyone else are left untouched.
    pub async fn ack_all(&mut self) -> Result<(), TransportError> {
        while let Some(&delivery_tag) = self.unsettled.first() {
            self.live_channel()?.ack(delivery_tag, false).await?;
            self.settled(delivery_tag);
        }
        Ok(())
    }

    fn settled(&mut self, delivery_tag: DeliveryTag) {
        self.unsettled.retain(|tag| *tag != delivery_tag);
    }

    /// Hand the channel back: to its pool if every delivery was settled, flagged dead
    /// otherwise.
    pub async fn release(mut self) {
        if let Some(channel) = self.channel.take() {
            if self.unsettled.is_empty() {
                self.pool.return_channel(channel);
            } else {
                tracing::warn!(
                    channel_id = channel.id(),
                    unsettled = self.unsettled.len(),
                    "Releasing an ackable channel with unsettled deliveries"
                );
                self.pool.flag_dead(channel).await;
            }
        }
    }
}

impl<T: Transport> Drop for AckableResult<T> {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        if self.unsettled.is_empty() {
            self.pool.return_channel(channel);
            return;
        }
        tracing::warn!(
            channel_id = channel.id(),
            unsettled = self.unsettled.len(),
            "Dropped an ackable result with unsettled deliveries"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let pool = self.pool.clone();
                runtime.spawn(async move { pool.flag_dead(channel).await });
            }
            Err(_) => tracing::error!(
                channel_id = channel.id(),
                "No runtime to close an ackable channel with unsettled deliveries"
            ),
        }
    }
}
