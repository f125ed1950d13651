//! A fixed set of long-lived connections, shared by every channel of the pool.
use super::Error;
use crate::configuration::{ConnectionSelection, PoolSettings};
use crate::transport::{Transport, TransportConnection, TransportError};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

/// `ConnectionPool` owns `connection_pool_count` connection slots.
///
/// Connections are established eagerly when the pool is created. A slot whose connection is
/// flagged dead (or found closed) is reconnected in place by the next caller that selects it;
/// reconnects are serialized per slot, so concurrent callers never race to open duplicates.
pub struct ConnectionPool<T: Transport> {
    transport: T,
    slots: Vec<ConnectionSlot<T::Connection>>,
    cursor: AtomicUsize,
    selection: ConnectionSelection,
    reconnect_timeout: Duration,
    closed: AtomicBool,
}

struct ConnectionSlot<C> {
    id: usize,
    live: RwLock<Option<Arc<C>>>,
    /// Number of live channels opened on this slot.
    channels: Arc<AtomicUsize>,
    dead: AtomicBool,
    reconnecting: Mutex<()>,
}

impl<C: TransportConnection> ConnectionSlot<C> {
    fn new(id: usize, connection: Option<C>) -> Self {
        Self {
            id,
            dead: AtomicBool::new(connection.is_none()),
            live: RwLock::new(connection.map(Arc::new)),
            channels: Arc::new(AtomicUsize::new(0)),
            reconnecting: Mutex::new(()),
        }
    }

    async fn healthy(&self) -> Option<Arc<C>> {
        if self.dead.load(Ordering::Acquire) {
            return None;
        }
        self.live
            .read()
            .await
            .as_ref()
            .filter(|connection| connection.is_open())
            .cloned()
    }

    fn checkout(&self, connection: Arc<C>) -> PooledConnection<C> {
        PooledConnection {
            id: self.id,
            connection,
            channels: self.channels.clone(),
        }
    }
}

impl<T: Transport> ConnectionPool<T> {
    /// Establish every connection of the pool.
    ///
    /// Fails if not a single connection could be established: an unreachable broker at
    /// start-up is not something the pool can recover from. Slots that failed to connect
    /// are reconnected lazily, on first use.
    #[tracing::instrument(name = "connection_pool_create", skip_all, fields(count = settings.connection_pool_count))]
    pub async fn new(transport: T, settings: &PoolSettings) -> Result<Self, Error> {
        let count = settings.connection_pool_count;
        if count == 0 {
            return Err(Error::Misconfigured(
                "connection_pool_count must be at least 1".into(),
            ));
        }
        let reconnect_timeout = settings.reconnect_timeout();
        let attempts = futures_util::future::join_all(
            (0..count).map(|_| timeout(reconnect_timeout, transport.open_connection())),
        )
        .await;

        let mut last_error = None;
        let mut slots = Vec::with_capacity(count);
        for (id, attempt) in attempts.into_iter().enumerate() {
            let connection = match attempt {
                Ok(Ok(connection)) => Some(connection),
                Ok(Err(e)) => {
                    tracing::warn!(connection_id = id, error = ?e, "Failed to establish connection");
                    last_error = Some(e);
                    None
                }
                Err(_) => {
                    tracing::warn!(connection_id = id, "Timed out while establishing connection");
                    last_error = Some(TransportError::transient(format!(
                        "Timed out after {reconnect_timeout:?} while connecting"
                    )));
                    None
                }
            };
            slots.push(ConnectionSlot::new(id, connection));
        }

        if let Some(source) = last_error.filter(|_| slots.iter().all(|s| s.dead.load(Ordering::Acquire))) {
            return Err(Error::BrokerUnreachable {
                attempted: count,
                source,
            });
        }

        Ok(Self {
            transport,
            slots,
            cursor: AtomicUsize::new(0),
            selection: settings.connection_selection,
            reconnect_timeout,
            closed: AtomicBool::new(false),
        })
    }

    /// Number of connection slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Get a live connection, reconnecting the selected slot if its connection is dead.
    ///
    /// Reconnecting never takes longer than the configured reconnect timeout: past it,
    /// [`Error::ConnectionUnavailable`] is returned.
    pub async fn get_connection(&self) -> Result<PooledConnection<T::Connection>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let slot = self.select();
        match slot.healthy().await {
            Some(connection) => Ok(slot.checkout(connection)),
            None => self.reconnect(slot).await,
        }
    }

    fn select(&self) -> &ConnectionSlot<T::Connection> {
        match self.selection {
            ConnectionSelection::RoundRobin => {
                let next = self.cursor.fetch_add(1, Ordering::Relaxed);
                &self.slots[next % self.slots.len()]
            }
            ConnectionSelection::LeastLoaded => self
                .slots
                .iter()
                .min_by_key(|slot| slot.channels.load(Ordering::Relaxed))
                .unwrap_or(&self.slots[0]),
        }
    }

    #[tracing::instrument(name = "connection_pool_reconnect", skip_all, fields(connection_id = slot.id))]
    async fn reconnect(
        &self,
        slot: &ConnectionSlot<T::Connection>,
    ) -> Result<PooledConnection<T::Connection>, Error> {
        let _reconnecting = slot.reconnecting.lock().await;
        // Someone else may have reconnected the slot while we were waiting for the lock.
        if let Some(connection) = slot.healthy().await {
            return Ok(slot.checkout(connection));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let connection = timeout(self.reconnect_timeout, self.transport.open_connection())
            .await
            .map_err(|_| Error::ConnectionUnavailable {
                connection_id: slot.id,
                source: anyhow::anyhow!(
                    "Timed out after {:?} while reconnecting",
                    self.reconnect_timeout
                ),
            })?
            .map_err(|e| Error::ConnectionUnavailable {
                connection_id: slot.id,
                source: e.into(),
            })?;
        let connection = Arc::new(connection);
        let previous = slot.live.write().await.replace(connection.clone());
        slot.dead.store(false, Ordering::Release);
        tracing::info!("Connection re-established");

        // Channels still derived from the previous connection are detected as dead by the
        // next operation that uses them.
        if let Some(previous) = previous.filter(|c| c.is_open()) {
            if let Err(e) = previous.close().await {
                tracing::warn!(error = ?e, "Failed to close the replaced connection");
            }
        }
        Ok(slot.checkout(connection))
    }

    /// Mark a connection as dead: the next caller selecting its slot reconnects it.
    pub fn flag_dead(&self, connection_id: usize) {
        match self.slots.get(connection_id) {
            Some(slot) => {
                slot.dead.store(true, Ordering::Release);
                tracing::warn!(connection_id, "Connection flagged as dead");
            }
            None => tracing::warn!(connection_id, "Cannot flag an unknown connection as dead"),
        }
    }

    /// Close every connection. Further calls to [`ConnectionPool::get_connection`] fail with
    /// [`Error::Closed`].
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        for slot in &self.slots {
            let _reconnecting = slot.reconnecting.lock().await;
            let connection = slot.live.write().await.take();
            slot.dead.store(true, Ordering::Release);
            if let Some(connection) = connection.filter(|c| c.is_open()) {
                if let Err(e) = connection.close().await {
                    tracing::error!(connection_id = slot.id, error = ?e, "Failed to close connection");
                }
            }
        }
    }
}

/// A connection handed out by [`ConnectionPool::get_connection`].
pub struct PooledConnection<C> {
    id: usize,
    connection: Arc<C>,
    channels: Arc<AtomicUsize>,
}

impl<C> PooledConnection<C> {
    /// The identifier of the slot this connection lives in.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of live channels currently derived from this connection slot.
    pub fn channel_count(&self) -> usize {
        self.channels.load(Ordering::Relaxed)
    }

    /// Register a channel derived from this connection. The count is decremented when the
    /// lease is dropped.
    pub fn lease(&self) -> ConnectionLease {
        self.channels.fetch_add(1, Ordering::Relaxed);
        ConnectionLease {
            channels: self.channels.clone(),
        }
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

/// Keeps a channel accounted for in the load of its connection slot.
#[derive(Debug)]
pub struct ConnectionLease {
    channels: Arc<AtomicUsize>,
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.channels.fetch_sub(1, Ordering::Relaxed);
    }
}
