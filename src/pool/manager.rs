use super::channel::{ChannelKind, ChannelPair, ChannelPool, KindStatus, ManagedChannel};
use super::connection::ConnectionPool;
use super::Error;
use crate::amqp::ConnectionFactory;
use crate::configuration::{PoolSettings, Settings};
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Occupancy of both channel pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub standard: KindStatus,
    pub ackable: KindStatus,
}

/// `PoolManager` owns a [`ConnectionPool`] and the [`ChannelPool`] built on top of it.
///
/// It is cheap to clone: clones share the same pools. Call [`PoolManager::shutdown`] once,
/// at process teardown, to close every channel and connection.
pub struct PoolManager<T: Transport = ConnectionFactory> {
    inner: Arc<Inner<T>>,
}

struct Inner<T: Transport> {
    connections: Arc<ConnectionPool<T>>,
    channels: ChannelPool<T>,
    shut_down: AtomicBool,
}

impl<T: Transport> Clone for PoolManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl PoolManager<ConnectionFactory> {
    /// Connect to the RabbitMq broker described by `settings`.
    pub async fn connect(settings: &Settings) -> Result<Self, Error> {
        let factory = ConnectionFactory::new_from_config(&settings.rabbit_mq)?;
        Self::initialize(factory, &settings.pool).await
    }
}

impl<T: Transport> PoolManager<T> {
    /// Establish the connections and pre-warm the standard channel pool.
    #[tracing::instrument(
        name = "pool_manager_initialize",
        skip_all,
        fields(
            connections = settings.connection_pool_count,
            channels = settings.channel_pool_count,
            ackable_channels = settings.ackable_channel_pool_count
        )
    )]
    pub async fn initialize(transport: T, settings: &PoolSettings) -> Result<Self, Error> {
        let connections = Arc::new(ConnectionPool::new(transport, settings).await?);
        let channels = match ChannelPool::new(connections.clone(), settings).await {
            Ok(channels) => channels,
            Err(e) => {
                connections.close_all().await;
                return Err(e);
            }
        };
        Ok(Self {
            inner: Arc::new(Inner {
                connections,
                channels,
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    fn ensure_running(&self) -> Result<(), Error> {
        if self.is_shut_down() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Check out a standard channel, waiting for one to be returned if the pool is at
    /// capacity.
    pub async fn acquire_standard(&self) -> Result<ChannelPair<T>, Error> {
        self.ensure_running()?;
        self.inner.channels.acquire(ChannelKind::Standard).await
    }

    /// Check out an ackable channel, waiting for one to be returned if the pool is at
    /// capacity.
    pub async fn acquire_ackable(&self) -> Result<ChannelPair<T>, Error> {
        self.ensure_running()?;
        self.inner.channels.acquire(ChannelKind::Ackable).await
    }

    pub fn return_channel(&self, pair: ChannelPair<T>) {
        self.inner.channels.return_channel(pair);
    }

    /// Remove a channel from circulation. Its pool opens a replacement on the next acquire.
    pub async fn flag_dead(&self, pair: ChannelPair<T>) {
        self.inner.channels.flag_dead(pair).await;
    }

    /// Mark a connection slot as dead: it is reconnected the next time it is selected.
    pub fn flag_dead_connection(&self, connection_id: usize) {
        self.inner.connections.flag_dead(connection_id);
    }

    /// Open a channel outside the pools, for a long-lived consumer.
    /// The caller is responsible for closing it.
    pub async fn acquire_transient(
        &self,
        ackable: bool,
    ) -> Result<ManagedChannel<T::Channel>, Error> {
        self.ensure_running()?;
        let kind = if ackable {
            ChannelKind::Ackable
        } else {
            ChannelKind::Standard
        };
        self.inner.channels.acquire_transient(kind).await
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            standard: self.inner.channels.status(ChannelKind::Standard),
            ackable: self.inner.channels.status(ChannelKind::Ackable),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Close every channel and connection. Calling it more than once is a no-op.
    ///
    /// Channels still checked out are reported, then closed along with their connection.
    #[tracing::instrument(name = "pool_manager_shutdown", skip(self))]
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let status = self.status();
        for (kind, status) in [
            (ChannelKind::Standard, status.standard),
            (ChannelKind::Ackable, status.ackable),
        ] {
            if status.checked_out > 0 {
                tracing::error!(
                    %kind,
                    checked_out = status.checked_out,
                    "Channels were never returned to the pool before shutdown"
                );
            }
        }
        self.inner.channels.close();
        self.inner.connections.close_all().await;
    }
}
