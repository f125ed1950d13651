//! Implements [`Manager`] for pooled channels.
use super::connection::{ConnectionLease, ConnectionPool};
use super::Error;
use crate::configuration::PoolSettings;
use crate::transport::{ChannelOptions, Transport, TransportChannel, TransportConnection};
use deadpool::managed::{self, Manager, Object, Pool};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The acknowledgment mode of a channel, fixed when the channel is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Auto-ack friendly channels, for publishing and plain gets.
    Standard,
    /// Channels whose deliveries are acknowledged manually.
    Ackable,
}

impl ChannelKind {
    pub fn is_ackable(self) -> bool {
        matches!(self, Self::Ackable)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => f.write_str("standard"),
            Self::Ackable => f.write_str("ackable"),
        }
    }
}

/// A channel opened by a [`ChannelManager`], together with its bookkeeping.
///
/// It dereferences to the underlying transport channel.
pub struct ManagedChannel<C> {
    id: u64,
    kind: ChannelKind,
    connection_id: usize,
    _lease: ConnectionLease,
    channel: C,
}

impl<C> ManagedChannel<C> {
    /// Identifier of the channel, unique within a [`PoolManager`](super::PoolManager).
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn is_ackable(&self) -> bool {
        self.kind.is_ackable()
    }

    /// The connection slot this channel was opened on.
    pub fn connection_id(&self) -> usize {
        self.connection_id
    }
}

impl<C> Deref for ManagedChannel<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.channel
    }
}

impl<C> fmt::Debug for ManagedChannel<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedChannel")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

/// `ChannelManager` implements [`Manager`] to manage a pool of channels of one [`ChannelKind`].
///
/// Channels are opened on connections obtained from a shared [`ConnectionPool`].
pub struct ChannelManager<T: Transport> {
    connection_pool: Arc<ConnectionPool<T>>,
    kind: ChannelKind,
    publisher_confirms: bool,
    next_id: Arc<AtomicU64>,
}

impl<T: Transport> ChannelManager<T> {
    fn new(
        connection_pool: Arc<ConnectionPool<T>>,
        kind: ChannelKind,
        publisher_confirms: bool,
        next_id: Arc<AtomicU64>,
    ) -> Self {
        Self {
            connection_pool,
            kind,
            publisher_confirms,
            next_id,
        }
    }

    #[tracing::instrument(name = "open_channel", skip(self), fields(kind = %self.kind))]
    async fn open(&self) -> Result<ManagedChannel<T::Channel>, Error> {
        let connection = self.connection_pool.get_connection().await?;
        let options = ChannelOptions {
            ackable: self.kind.is_ackable(),
            publisher_confirms: self.publisher_confirms,
        };
        match connection.open_channel(options).await {
            Ok(channel) => Ok(ManagedChannel {
                id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
                kind: self.kind,
                connection_id: connection.id(),
                _lease: connection.lease(),
                channel,
            }),
            Err(e) => {
                if e.kind().should_flag_dead() {
                    self.connection_pool.flag_dead(connection.id());
                }
                Err(e.into())
            }
        }
    }
}

#[async_trait::async_trait]
impl<T: Transport> Manager for ChannelManager<T> {
    type Type = ManagedChannel<T::Channel>;
    type Error = Error;

    async fn create(&self) -> Result<Self::Type, Error> {
        self.open().await
    }

    async fn recycle(&self, channel: &mut Self::Type) -> managed::RecycleResult<Error> {
        if channel.is_open() {
            Ok(())
        } else {
            Err(managed::RecycleError::Message(format!(
                "Channel {} is not open anymore",
                channel.id
            )))
        }
    }
}

/// A channel checked out of a [`ChannelPool`].
///
/// The caller owns it exclusively until it is handed back, either with
/// [`ChannelPool::return_channel`] or with [`ChannelPool::flag_dead`]. Dropping a pair
/// returns it to the pool it was acquired from.
pub struct ChannelPair<T: Transport> {
    object: Object<ChannelManager<T>>,
}

impl<T: Transport> Deref for ChannelPair<T> {
    type Target = ManagedChannel<T::Channel>;

    fn deref(&self) -> &Self::Target {
        &self.object
    }
}

impl<T: Transport> fmt::Debug for ChannelPair<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChannelPair").field(&**self).finish()
    }
}

/// Occupancy of one channel pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindStatus {
    /// Maximum number of channels.
    pub capacity: usize,
    /// Channels currently alive, idle or checked out.
    pub size: usize,
    pub idle: usize,
    pub checked_out: usize,
}

impl From<deadpool::Status> for KindStatus {
    fn from(status: deadpool::Status) -> Self {
        let idle = status.available.max(0) as usize;
        Self {
            capacity: status.max_size,
            size: status.size,
            idle,
            checked_out: status.size.saturating_sub(idle),
        }
    }
}

/// Two disjoint pools of channels: standard and ackable.
///
/// The standard pool is filled up to its capacity at creation; ackable channels are only
/// opened on demand.
pub struct ChannelPool<T: Transport> {
    connection_pool: Arc<ConnectionPool<T>>,
    standard: Pool<ChannelManager<T>>,
    ackable: Pool<ChannelManager<T>>,
    publisher_confirms: bool,
    next_id: Arc<AtomicU64>,
}

impl<T: Transport> ChannelPool<T> {
    pub async fn new(
        connection_pool: Arc<ConnectionPool<T>>,
        settings: &PoolSettings,
    ) -> Result<Self, Error> {
        if settings.channel_pool_count == 0 || settings.ackable_channel_pool_count == 0 {
            return Err(Error::Misconfigured(
                "channel pools must have a capacity of at least 1".into(),
            ));
        }
        let next_id = Arc::new(AtomicU64::new(0));
        let manager = |kind| {
            ChannelManager::new(
                connection_pool.clone(),
                kind,
                settings.publisher_confirms,
                next_id.clone(),
            )
        };
        let standard = Pool::builder(manager(ChannelKind::Standard))
            .max_size(settings.channel_pool_count)
            .build()?;
        let ackable = Pool::builder(manager(ChannelKind::Ackable))
            .max_size(settings.ackable_channel_pool_count)
            .build()?;

        let pool = Self {
            connection_pool,
            standard,
            ackable,
            publisher_confirms: settings.publisher_confirms,
            next_id,
        };
        pool.prewarm(settings.channel_pool_count).await?;
        Ok(pool)
    }

    async fn prewarm(&self, count: usize) -> Result<(), Error> {
        let channels =
            futures_util::future::try_join_all((0..count).map(|_| self.standard.get())).await?;
        drop(channels);
        Ok(())
    }

    fn pool(&self, kind: ChannelKind) -> &Pool<ChannelManager<T>> {
        match kind {
            ChannelKind::Standard => &self.standard,
            ChannelKind::Ackable => &self.ackable,
        }
    }

    /// Check out a channel of the given kind.
    ///
    /// An idle channel is reused if there is one; otherwise a new channel is opened, unless
    /// the pool is at capacity, in which case the caller waits until a channel is handed back.
    pub async fn acquire(&self, kind: ChannelKind) -> Result<ChannelPair<T>, Error> {
        let object = self.pool(kind).get().await?;
        Ok(ChannelPair { object })
    }

    /// Hand a channel back to the pool it was acquired from.
    pub fn return_channel(&self, pair: ChannelPair<T>) {
        drop(pair);
    }

    /// Remove a channel from circulation for good.
    ///
    /// The capacity of its pool drops by one until the next acquire opens a replacement.
    pub async fn flag_dead(&self, pair: ChannelPair<T>) {
        let channel = Object::take(pair.object);
        tracing::warn!(
            channel_id = channel.id,
            connection_id = channel.connection_id,
            kind = %channel.kind,
            "Channel flagged as dead"
        );
        if channel.is_open() {
            if let Err(e) = channel.close().await {
                tracing::debug!(channel_id = channel.id, error = ?e, "Failed to close a dead channel");
            }
        }
    }

    /// Open a channel that does not belong to any pool. The caller closes it when done.
    pub async fn acquire_transient(
        &self,
        kind: ChannelKind,
    ) -> Result<ManagedChannel<T::Channel>, Error> {
        ChannelManager::new(
            self.connection_pool.clone(),
            kind,
            self.publisher_confirms,
            self.next_id.clone(),
        )
        .open()
        .await
    }

    pub fn status(&self, kind: ChannelKind) -> KindStatus {
        self.pool(kind).status().into()
    }

    /// Close both pools: idle channels are dropped and every pending or future acquire fails.
    pub fn close(&self) {
        self.standard.close();
        self.ackable.close();
    }
}
