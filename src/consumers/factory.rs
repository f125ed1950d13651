use super::consumer::Dispatch;
use super::{Consumer, ConsumerError, Handler, SyncHandler};
use crate::amqp::ConnectionFactory;
use crate::configuration::ConsumerSettings;
use crate::pool::PoolManager;
use crate::transport::{Transport, TransportChannel};
use std::sync::Arc;
use uuid::Uuid;

/// Per-consumer options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumerOptions {
    /// Overrides [`ConsumerSettings::qos_prefetch_count`] for this consumer.
    pub prefetch_count: Option<u16>,
    /// Let the broker consider messages acknowledged as soon as they are pushed.
    /// Handler failures are then only logged.
    pub auto_ack: bool,
}

/// Creates [`Consumer`]s, each on a dedicated channel opened outside the pools.
///
/// Whether consumers run synchronous or asynchronous handlers is decided once per process by
/// [`ConsumerSettings::dispatch_consumers_async`]: asking for the other kind fails with
/// [`ConsumerError::DispatchMode`].
pub struct ConsumerFactory<T: Transport = ConnectionFactory> {
    pool: PoolManager<T>,
    settings: ConsumerSettings,
}

impl<T: Transport> Clone for ConsumerFactory<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<T: Transport> ConsumerFactory<T> {
    pub fn new(pool: PoolManager<T>, settings: ConsumerSettings) -> Self {
        Self { pool, settings }
    }

    /// Create a consumer processing messages one at a time with a synchronous handler.
    pub async fn create_consumer<H: SyncHandler>(
        &self,
        queue_name: &str,
        options: ConsumerOptions,
        handler: H,
    ) -> Result<Consumer<T>, ConsumerError> {
        if self.settings.dispatch_consumers_async {
            return Err(ConsumerError::DispatchMode {
                dispatch_consumers_async: true,
            });
        }
        self.create(queue_name, options, Dispatch::Sync(Arc::new(handler)))
            .await
    }

    /// Create a consumer processing messages concurrently (up to the prefetch count) with an
    /// asynchronous handler.
    pub async fn create_async_consumer<H: Handler>(
        &self,
        queue_name: &str,
        options: ConsumerOptions,
        handler: H,
    ) -> Result<Consumer<T>, ConsumerError> {
        if !self.settings.dispatch_consumers_async {
            return Err(ConsumerError::DispatchMode {
                dispatch_consumers_async: false,
            });
        }
        self.create(queue_name, options, Dispatch::Async(Arc::new(handler)))
            .await
    }

    #[tracing::instrument(name = "consumer_new", skip(self, dispatch))]
    async fn create(
        &self,
        queue_name: &str,
        options: ConsumerOptions,
        dispatch: Dispatch,
    ) -> Result<Consumer<T>, ConsumerError> {
        let channel = self.pool.acquire_transient(!options.auto_ack).await?;
        let prefetch_count = options
            .prefetch_count
            .unwrap_or(self.settings.qos_prefetch_count);
        if let Err(e) = channel
            .set_qos(self.settings.qos_prefetch_size, prefetch_count)
            .await
        {
            if let Err(close_error) = channel.close().await {
                tracing::warn!(error = ?close_error, "Failed to close the consumer channel");
            }
            return Err(e.into());
        }
        Ok(Consumer::new(
            channel,
            queue_name,
            Uuid::new_v4().to_string(),
            options.auto_ack,
            prefetch_count,
            dispatch,
        ))
    }
}
