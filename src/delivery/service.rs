use super::{AckableResult, DeliveryError};
use crate::amqp::ConnectionFactory;
use crate::configuration::{DeliverySettings, Settings};
use crate::pool::{ChannelPair, PoolManager};
use crate::transport::{Delivery, PublishOptions, Transport, TransportChannel, TransportError};
use std::time::Duration;

/// A high-level interface to publish and pull messages through the pools of a
/// [`PoolManager`].
///
/// # Failure handling
///
/// A broker call failing because its channel was closed flags that channel dead: the pool
/// opens a replacement on the next acquire. Any other failure leaves the channel in
/// circulation. Failing to check out a channel (e.g. the connection could not be
/// re-established in time) is always returned as an error.
///
/// Single-item operations report a failed broker call as `false`/`None`, unless
/// [`DeliverySettings::propagate_errors`] is set. Multi-message publishes report the
/// zero-based positions of the payloads that could not be published; nothing is retried.
pub struct DeliveryService<T: Transport = ConnectionFactory> {
    pool: PoolManager<T>,
    settings: DeliverySettings,
}

impl<T: Transport> Clone for DeliveryService<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl DeliveryService<ConnectionFactory> {
    /// Initialise the pools against the RabbitMq broker described by `settings`.
    pub async fn connect(settings: &Settings) -> Result<Self, DeliveryError> {
        let pool = PoolManager::connect(settings).await?;
        Ok(Self::new(pool, settings.delivery.clone()))
    }
}

impl<T: Transport> DeliveryService<T> {
    pub fn new(pool: PoolManager<T>, settings: DeliverySettings) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> &PoolManager<T> {
        &self.pool
    }

    /// Shut the underlying pools down. See [`PoolManager::shutdown`].
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    fn batch_size(&self, batch_size: Option<usize>) -> usize {
        batch_size.unwrap_or(self.settings.default_batch_size).max(1)
    }

    fn failed<V>(&self, error: TransportError, fallback: V) -> Result<V, DeliveryError> {
        if self.settings.propagate_errors {
            Err(error.into())
        } else {
            Ok(fallback)
        }
    }

    /// Hand back a channel whose last broker call failed with `error`.
    async fn release_failed(&self, channel: ChannelPair<T>, error: &TransportError) {
        if error.kind().should_flag_dead() {
            self.pool.flag_dead(channel).await;
        } else {
            self.pool.return_channel(channel);
        }
    }

    /// Publish a single persistent message.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<bool, DeliveryError> {
        self.publish_with_options(exchange, routing_key, payload, &PublishOptions::default())
            .await
    }

    /// Publish a single message with explicit options.
    #[tracing::instrument(level = "debug", skip(self, payload, options))]
    pub async fn publish_with_options(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<bool, DeliveryError> {
        let channel = self.pool.acquire_standard().await?;
        match channel.send(exchange, routing_key, payload, options).await {
            Ok(()) => {
                self.pool.return_channel(channel);
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(error = ?e, "Failed to publish message");
                self.release_failed(channel, &e).await;
                self.failed(e, false)
            }
        }
    }

    /// Publish `payloads` in order, on a single channel.
    ///
    /// Every payload is attempted exactly once. Returns the positions of the payloads that
    /// could not be published.
    #[tracing::instrument(level = "debug", skip(self, payloads), fields(count = payloads.len()))]
    pub async fn publish_many<P>(
        &self,
        exchange: &str,
        routing_key: &str,
        payloads: &[P],
    ) -> Result<Vec<usize>, DeliveryError>
    where
        P: AsRef<[u8]> + Sync,
    {
        let mut failures = Vec::new();
        if payloads.is_empty() {
            return Ok(failures);
        }
        let mut channel = Some(self.pool.acquire_standard().await?);
        let pace = self.settings.throttle_interval();
        self.publish_run(&mut channel, exchange, routing_key, payloads, 0, pace, &mut failures)
            .await;
        if let Some(channel) = channel {
            self.pool.return_channel(channel);
        }
        Ok(failures)
    }

    /// Publish `payloads` in order, in batches of `batch_size` (or
    /// [`DeliverySettings::default_batch_size`]), on a single channel.
    ///
    /// Returns the positions of the payloads that could not be published.
    #[tracing::instrument(level = "debug", skip(self, payloads), fields(count = payloads.len()))]
    pub async fn publish_many_as_batches<P>(
        &self,
        exchange: &str,
        routing_key: &str,
        payloads: &[P],
        batch_size: Option<usize>,
    ) -> Result<Vec<usize>, DeliveryError>
    where
        P: AsRef<[u8]> + Sync,
    {
        let mut failures = Vec::new();
        if payloads.is_empty() {
            return Ok(failures);
        }
        let batch_size = self.batch_size(batch_size);
        let mut channel = Some(self.pool.acquire_standard().await?);
        for (n, batch) in payloads.chunks(batch_size).enumerate() {
            if n > 0 {
                self.throttle().await;
            }
            let offset = n * batch_size;
            self.publish_run(&mut channel, exchange, routing_key, batch, offset, None, &mut failures)
                .await;
        }
        if let Some(channel) = channel {
            self.pool.return_channel(channel);
        }
        Ok(failures)
    }

    /// Publish `payloads` in batches running concurrently, each on its own channel.
    ///
    /// Order is preserved within a batch, not across batches. Returns the positions of the
    /// payloads that could not be published, including whole batches that could not check
    /// out a channel.
    #[tracing::instrument(level = "debug", skip(self, payloads), fields(count = payloads.len()))]
    pub async fn publish_many_as_batches_in_parallel<P>(
        &self,
        exchange: &str,
        routing_key: &str,
        payloads: &[P],
        batch_size: Option<usize>,
    ) -> Result<Vec<usize>, DeliveryError>
    where
        P: AsRef<[u8]> + Sync,
    {
        let batch_size = self.batch_size(batch_size);
        let batches = payloads
            .chunks(batch_size)
            .enumerate()
            .map(|(n, batch)| async move {
                let offset = n * batch_size;
                let mut failures = Vec::new();
                match self.pool.acquire_standard().await {
                    Ok(channel) => {
                        let mut channel = Some(channel);
                        self.publish_run(
                            &mut channel,
                            exchange,
                            routing_key,
                            batch,
                            offset,
                            None,
                            &mut failures,
                        )
                        .await;
                        if let Some(channel) = channel {
                            self.pool.return_channel(channel);
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, batch = n, "Failed to check out a channel for a batch");
                        failures.extend(offset..offset + batch.len());
                    }
                }
                failures
            });
        let failures = futures_util::future::join_all(batches)
            .await
            .into_iter()
            .flatten()
            .collect();
        Ok(failures)
    }

    /// Publish `payloads` one after the other on `channel`, recording failed positions
    /// (shifted by `offset`) into `failures`.
    ///
    /// A channel that dies is flagged dead and replaced before the next payload. If no
    /// replacement can be checked out, every remaining payload is recorded as failed and
    /// `channel` is left empty.
    #[allow(clippy::too_many_arguments)]
    async fn publish_run<P: AsRef<[u8]>>(
        &self,
        channel: &mut Option<ChannelPair<T>>,
        exchange: &str,
        routing_key: &str,
        payloads: &[P],
        offset: usize,
        pace: Option<Duration>,
        failures: &mut Vec<usize>,
    ) {
        let options = PublishOptions::default();
        for (i, payload) in payloads.iter().enumerate() {
            let index = offset + i;
            if let Some(pace) = pace.filter(|_| i > 0) {
                tokio::time::sleep(pace).await;
            }
            let current = match channel.take() {
                Some(current) => current,
                None => match self.pool.acquire_standard().await {
                    Ok(replacement) => replacement,
                    Err(e) => {
                        tracing::error!(error = ?e, index, "No replacement channel could be checked out");
                        failures.extend(index..offset + payloads.len());
                        return;
                    }
                },
            };
            match current
                .send(exchange, routing_key, payload.as_ref(), &options)
                .await
            {
                Ok(()) => *channel = Some(current),
                Err(e) => {
                    tracing::warn!(error = ?e, index, "Failed to publish message");
                    failures.push(index);
                    if e.kind().should_flag_dead() {
                        self.pool.flag_dead(current).await;
                    } else {
                        *channel = Some(current);
                    }
                }
            }
        }
    }

    async fn throttle(&self) {
        if let Some(interval) = self.settings.throttle_interval() {
            tokio::time::sleep(interval).await;
        }
    }

    /// Pull a single message from `queue`, acknowledged on receipt.
    /// `None` means the queue is empty (or the get failed, see the type-level docs).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get(&self, queue: &str) -> Result<Option<Delivery>, DeliveryError> {
        let channel = self.pool.acquire_standard().await?;
        match channel.receive(queue, true).await {
            Ok(delivery) => {
                self.pool.return_channel(channel);
                Ok(delivery)
            }
            Err(e) => {
                tracing::warn!(error = ?e, "Failed to get a message");
                self.release_failed(channel, &e).await;
                self.failed(e, None)
            }
        }
    }

    /// Pull up to `max_count` messages from `queue`, acknowledged on receipt, in queue order.
    ///
    /// Never returns more messages than the queue held when the call started; stops early
    /// once the queue is drained, e.g. by a concurrent consumer.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_many(
        &self,
        queue: &str,
        max_count: usize,
    ) -> Result<Vec<Delivery>, DeliveryError> {
        let channel = self.pool.acquire_standard().await?;
        let (deliveries, failure) = drain(&channel, queue, max_count, true).await;
        match failure {
            None => {
                self.pool.return_channel(channel);
                Ok(deliveries)
            }
            Some(e) => {
                self.release_failed(channel, &e).await;
                if deliveries.is_empty() {
                    self.failed(e, deliveries)
                } else {
                    Ok(deliveries)
                }
            }
        }
    }

    /// Pull every message `queue` held when the call started.
    pub async fn get_all(&self, queue: &str) -> Result<Vec<Delivery>, DeliveryError> {
        self.get_many(queue, usize::MAX).await
    }

    /// The number of messages ready for delivery in `queue`.
    pub async fn message_count(&self, queue: &str) -> Result<u32, DeliveryError> {
        let channel = self.pool.acquire_standard().await?;
        match channel.message_count(queue).await {
            Ok(count) => {
                self.pool.return_channel(channel);
                Ok(count)
            }
            Err(e) => {
                self.release_failed(channel, &e).await;
                Err(e.into())
            }
        }
    }

    /// Pull a single message from `queue` on an ackable channel.
    ///
    /// The caller must settle the delivery and hand the channel back, see [`AckableResult`].
    /// If the channel is closed while pulling, it is flagged dead and an error is returned.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_with_ack(&self, queue: &str) -> Result<AckableResult<T>, DeliveryError> {
        let channel = self.pool.acquire_ackable().await?;
        match channel.receive(queue, false).await {
            Ok(delivery) => Ok(AckableResult::new(
                self.pool.clone(),
                channel,
                delivery.into_iter().collect(),
            )),
            Err(e) => {
                tracing::warn!(error = ?e, "Failed to get a message");
                self.ackable_failure(channel, e).await
            }
        }
    }

    /// Pull up to `max_count` messages from `queue` on an ackable channel.
    ///
    /// Same bounds as [`DeliveryService::get_many`]; same contract as
    /// [`DeliveryService::get_with_ack`].
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_many_with_ack(
        &self,
        queue: &str,
        max_count: usize,
    ) -> Result<AckableResult<T>, DeliveryError> {
        let channel = self.pool.acquire_ackable().await?;
        let (deliveries, failure) = drain(&channel, queue, max_count, false).await;
        match failure {
            Some(e) if e.is_closed() || deliveries.is_empty() => {
                self.ackable_failure(channel, e).await
            }
            _ => Ok(AckableResult::new(self.pool.clone(), channel, deliveries)),
        }
    }

    async fn ackable_failure(
        &self,
        channel: ChannelPair<T>,
        error: TransportError,
    ) -> Result<AckableResult<T>, DeliveryError> {
        if error.is_closed() {
            self.pool.flag_dead(channel).await;
            return Err(error.into());
        }
        match self.failed(error, ()) {
            Ok(()) => Ok(AckableResult::new(self.pool.clone(), channel, Vec::new())),
            Err(e) => {
                self.pool.return_channel(channel);
                Err(e)
            }
        }
    }
}

/// Pull messages from `queue` until `max_count` or the depth observed up front is reached,
/// the queue runs empty, or a call fails.
async fn drain<T: Transport>(
    channel: &ChannelPair<T>,
    queue: &str,
    max_count: usize,
    auto_ack: bool,
) -> (Vec<Delivery>, Option<TransportError>) {
    let depth = match channel.message_count(queue).await {
        Ok(depth) => depth as usize,
        Err(e) => {
            tracing::warn!(error = ?e, "Failed to read the queue depth");
            return (Vec::new(), Some(e));
        }
    };
    let bound = depth.min(max_count);
    let mut deliveries = Vec::with_capacity(bound);
    while deliveries.len() < bound {
        match channel.receive(queue, auto_ack).await {
            Ok(Some(delivery)) => deliveries.push(delivery),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = ?e, received = deliveries.len(), "Failed to get a message");
                return (deliveries, Some(e));
            }
        }
    }
    (deliveries, None)
}
