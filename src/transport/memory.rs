//! A process-local broker implementing [`Transport`], for tests and local development.
//!
//! `InMemoryBroker` follows the AMQP semantics the pools rely on: the default exchange
//! routes to the queue named after the routing key, unacknowledged deliveries are requeued
//! when their channel (or its connection) closes, and a closed channel rejects every
//! operation with [`TransportError::Closed`].
//!
//! Faults can be injected to exercise recovery paths:
//! - [`InMemoryBroker::fail_sends_matching`] fails publishes whose payload matches a predicate;
//! - [`InMemoryBroker::fail_receives_matching`] fails gets when the message at the head of the
//!   queue matches a predicate;
//! - [`InMemoryBroker::close_all_channels`] and [`InMemoryBroker::close_all_connections`]
//!   simulate a broker hiccup;
//! - [`InMemoryBroker::set_reachable`] and [`InMemoryBroker::set_connect_delay`] make new
//!   connections fail or hang.
use super::{
    ChannelOptions, Delivery, DeliveryStream, PublishOptions, Transport, TransportChannel,
    TransportConnection, TransportError, TransportErrorKind,
};
use amq_protocol_types::DeliveryTag;
use futures_util::StreamExt;
use lapin::BasicProperties;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

type PayloadPredicate = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// An in-memory message broker. Cloning it gives another handle to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    /// Woken whenever a queue receives a message or a channel changes state.
    notify: Notify,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    /// (exchange, routing key) -> bound queues.
    bindings: HashMap<(String, String), Vec<String>>,
    /// (channel id, delivery tag) -> delivery waiting for an acknowledgment.
    unacked: HashMap<(u64, DeliveryTag), Unacked>,
    connections: HashMap<u64, Arc<AtomicBool>>,
    channels: HashMap<u64, ChannelRecord>,
    cancelled_consumers: HashSet<String>,
    send_failures: Vec<(TransportErrorKind, PayloadPredicate)>,
    receive_failures: Vec<(TransportErrorKind, PayloadPredicate)>,
    unreachable: bool,
    connect_delay: Option<Duration>,
    next_id: u64,
    connections_opened: usize,
    channels_opened: usize,
}

struct ChannelRecord {
    connection_id: u64,
    open: Arc<AtomicBool>,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    data: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a queue. Declaring an existing queue leaves its messages untouched.
    pub fn declare_queue(&self, queue: &str) {
        self.state().queues.entry(queue.to_owned()).or_default();
    }

    /// Delete a queue and its messages. Returns `false` if the queue did not exist.
    pub fn delete_queue(&self, queue: &str) -> bool {
        let mut state = self.state();
        state.bindings.values_mut().for_each(|q| q.retain(|q| q != queue));
        state.queues.remove(queue).is_some()
    }

    /// Route messages published on `exchange` with `routing_key` to `queue`.
    pub fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) {
        self.state()
            .bindings
            .entry((exchange.to_owned(), routing_key.to_owned()))
            .or_default()
            .push(queue.to_owned());
    }

    /// Number of messages ready for delivery, `None` if the queue does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state().queues.get(queue).map(VecDeque::len)
    }

    /// Number of deliveries waiting for an acknowledgment, across all channels.
    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    /// Fail every publish whose payload matches `predicate` with an error of the given kind.
    ///
    /// A [`TransportErrorKind::Closed`] failure also closes the publishing channel, as a
    /// broker-side channel exception would. `predicate` runs outside the broker lock: it may
    /// call back into the broker, e.g. to simulate an outage in the middle of a publish.
    pub fn fail_sends_matching<F>(&self, kind: TransportErrorKind, predicate: F)
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.state().send_failures.push((kind, Arc::new(predicate)));
    }

    pub fn clear_send_failures(&self) {
        self.state().send_failures.clear();
    }

    /// Fail every get (and consumer push) while the message at the head of the queue matches
    /// `predicate`. The message stays in the queue.
    ///
    /// A [`TransportErrorKind::Closed`] failure also closes the receiving channel, requeueing
    /// its unacknowledged deliveries. `predicate` runs under the broker lock and must not
    /// call back into the broker.
    pub fn fail_receives_matching<F>(&self, kind: TransportErrorKind, predicate: F)
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.state().receive_failures.push((kind, Arc::new(predicate)));
    }

    pub fn clear_receive_failures(&self) {
        self.state().receive_failures.clear();
    }

    /// Close every open channel, requeueing their unacknowledged deliveries.
    pub fn close_all_channels(&self) {
        let mut state = self.state();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id);
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Close every open connection (and therefore every channel).
    pub fn close_all_connections(&self) {
        let mut state = self.state();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id);
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// When unreachable, every attempt to open a connection fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    /// Delay every new connection by `delay`.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state().connect_delay = delay;
    }

    /// Total number of connections opened since the broker was created.
    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    /// Total number of channels opened since the broker was created.
    pub fn channels_opened(&self) -> usize {
        self.state().channels_opened
    }

    /// Number of channels currently open.
    pub fn open_channels(&self) -> usize {
        self.state()
            .channels
            .values()
            .filter(|c| c.open.load(Ordering::Acquire))
            .count()
    }
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn close_channel(&mut self, channel_id: u64) {
        if let Some(record) = self.channels.remove(&channel_id) {
            record.open.store(false, Ordering::Release);
        }
        let mut tags: Vec<(u64, DeliveryTag)> = self
            .unacked
            .keys()
            .filter(|(id, _)| *id == channel_id)
            .copied()
            .collect();
        // Pushed to the front in reverse, so the queue ends up in delivery order.
        tags.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        for key in tags {
            if let Some(unacked) = self.unacked.remove(&key) {
                self.requeue(unacked);
            }
        }
    }

    fn close_connection(&mut self, connection_id: u64) {
        if let Some(open) = self.connections.remove(&connection_id) {
            open.store(false, Ordering::Release);
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in channels {
            self.close_channel(id);
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            queue.push_front(StoredMessage {
                redelivered: true,
                ..unacked.message
            });
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default();
        }
        self.bindings
            .get(&(exchange.to_owned(), routing_key.to_owned()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Transport for InMemoryBroker {
    type Connection = MemoryConnection;
    type Channel = MemoryChannel;

    async fn open_connection(&self) -> Result<MemoryConnection, TransportError> {
        let delay = self.state().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if state.unreachable {
            return Err(TransportError::transient("Connection refused by the broker"));
        }
        let id = state.next_id();
        let open = Arc::new(AtomicBool::new(true));
        state.connections.insert(id, open.clone());
        state.connections_opened += 1;
        Ok(MemoryConnection {
            id,
            open,
            broker: self.clone(),
        })
    }
}

/// A connection to an [`InMemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    open: Arc<AtomicBool>,
    broker: InMemoryBroker,
}

#[async_trait::async_trait]
impl TransportConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self, options: ChannelOptions) -> Result<MemoryChannel, TransportError> {
        let mut state = self.broker.state();
        if !self.is_open() {
            return Err(TransportError::closed(format!(
                "Connection {} is closed",
                self.id
            )));
        }
        let id = state.next_id();
        let open = Arc::new(AtomicBool::new(true));
        state.channels.insert(
            id,
            ChannelRecord {
                connection_id: self.id,
                open: open.clone(),
            },
        );
        state.channels_opened += 1;
        Ok(MemoryChannel {
            inner: Arc::new(ChannelInner {
                id,
                ackable: options.ackable,
                open,
                connection_open: self.open.clone(),
                next_delivery_tag: AtomicU64::new(1),
                broker: self.broker.clone(),
            }),
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.state().close_connection(self.id);
        self.broker.inner.notify.notify_waiters();
        Ok(())
    }
}

/// A channel opened on a [`MemoryConnection`].
#[derive(Clone)]
pub struct MemoryChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.inner.id)
            .field("ackable", &self.inner.ackable)
            .field("open", &self.is_open())
            .finish()
    }
}

struct ChannelInner {
    id: u64,
    ackable: bool,
    open: Arc<AtomicBool>,
    connection_open: Arc<AtomicBool>,
    next_delivery_tag: AtomicU64,
    broker: InMemoryBroker,
}

impl MemoryChannel {
    /// The broker-assigned identifier of this channel.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_ackable(&self) -> bool {
        self.inner.ackable
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::closed(format!(
                "Channel {} is closed",
                self.inner.id
            )))
        }
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let predicates = self.inner.broker.state().send_failures.clone();
        let failure = predicates
            .iter()
            .find(|(_, predicate)| predicate(payload))
            .map(|(kind, _)| *kind);
        let mut state = self.inner.broker.state();
        match failure {
            Some(TransportErrorKind::Closed) => {
                state.close_channel(self.inner.id);
                return Err(TransportError::closed(format!(
                    "Channel {} was closed by the broker",
                    self.inner.id
                )));
            }
            Some(TransportErrorKind::Transient) => {
                return Err(TransportError::transient("Injected publish failure"));
            }
            None => {}
        }

        let queues = state.route(exchange, routing_key);
        if queues.is_empty() && options.mandatory {
            return Err(TransportError::transient(format!(
                "The message could not be routed: exchange '{exchange}', routing key '{routing_key}'"
            )));
        }
        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: options.properties.clone(),
            data: payload.to_vec(),
            redelivered: false,
        };
        for queue in queues {
            if let Some(queue) = state.queues.get_mut(&queue) {
                queue.push_back(message.clone());
            }
        }
        drop(state);
        self.inner.broker.inner.notify.notify_waiters();
        Ok(())
    }

    fn pop(&self, queue: &str, auto_ack: bool) -> Result<Option<Delivery>, TransportError> {
        self.ensure_open()?;
        let mut state = self.inner.broker.state();
        let head = state
            .queues
            .get(queue)
            .ok_or_else(|| TransportError::transient(format!("NOT_FOUND - no queue '{queue}'")))?
            .front();
        let failure = head.and_then(|message| {
            state
                .receive_failures
                .iter()
                .find(|(_, predicate)| predicate(&message.data))
                .map(|(kind, _)| *kind)
        });
        match failure {
            Some(TransportErrorKind::Closed) => {
                state.close_channel(self.inner.id);
                drop(state);
                self.inner.broker.inner.notify.notify_waiters();
                return Err(TransportError::closed(format!(
                    "Channel {} was closed by the broker",
                    self.inner.id
                )));
            }
            Some(TransportErrorKind::Transient) => {
                return Err(TransportError::transient("Injected get failure"));
            }
            None => {}
        }
        let message = state.queues.get_mut(queue).and_then(VecDeque::pop_front);
        let Some(message) = message else {
            return Ok(None);
        };
        let delivery_tag = self.inner.next_delivery_tag.fetch_add(1, Ordering::Relaxed);
        let delivery = Delivery {
            delivery_tag,
            exchange: message.exchange.clone().into(),
            routing_key: message.routing_key.clone().into(),
            redelivered: message.redelivered,
            properties: message.properties.clone(),
            data: message.data.clone(),
        };
        if !auto_ack {
            state.unacked.insert(
                (self.inner.id, delivery_tag),
                Unacked {
                    queue: queue.to_owned(),
                    message,
                },
            );
        }
        Ok(Some(delivery))
    }

    fn settle(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.inner.broker.state();
        let mut tags: Vec<DeliveryTag> = state
            .unacked
            .keys()
            .filter(|(id, tag)| {
                *id == self.inner.id && (*tag == delivery_tag || (multiple && *tag < delivery_tag))
            })
            .map(|(_, tag)| *tag)
            .collect();
        if !tags.contains(&delivery_tag) {
            return Err(TransportError::transient(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )));
        }
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = state.unacked.remove(&(self.inner.id, tag)) {
                if requeue {
                    state.requeue(unacked);
                }
            }
        }
        drop(state);
        if requeue {
            self.inner.broker.inner.notify.notify_waiters();
        }
        Ok(())
    }

    fn is_cancelled(&self, consumer_tag: &str) -> bool {
        self.inner
            .broker
            .state()
            .cancelled_consumers
            .contains(consumer_tag)
    }
}

struct ConsumerState {
    channel: MemoryChannel,
    queue: String,
    consumer_tag: String,
    auto_ack: bool,
    finished: bool,
}

#[async_trait::async_trait]
impl TransportChannel for MemoryChannel {
    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), TransportError> {
        self.publish(exchange, routing_key, payload, options)
    }

    async fn receive(
        &self,
        queue: &str,
        auto_ack: bool,
    ) -> Result<Option<Delivery>, TransportError> {
        self.pop(queue, auto_ack)
    }

    async fn message_count(&self, queue: &str) -> Result<u32, TransportError> {
        self.ensure_open()?;
        self.inner
            .broker
            .queue_depth(queue)
            .map(|depth| depth as u32)
            .ok_or_else(|| TransportError::transient(format!("NOT_FOUND - no queue '{queue}'")))
    }

    async fn set_qos(&self, _prefetch_size: u32, _prefetch_count: u16) -> Result<(), TransportError> {
        self.ensure_open()
    }

    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), TransportError> {
        self.settle(delivery_tag, multiple, false)
    }

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        self.settle(delivery_tag, false, requeue)
    }

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        self.settle(delivery_tag, false, requeue)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, TransportError> {
        self.ensure_open()?;
        if self.inner.broker.queue_depth(queue).is_none() {
            return Err(TransportError::transient(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        }
        let state = ConsumerState {
            channel: self.clone(),
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            auto_ack,
            finished: false,
        };
        let stream = futures_util::stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            let broker = state.channel.inner.broker.inner.clone();
            loop {
                // Register interest before looking at the queue, so that a publish happening
                // in between is not missed.
                let notified = broker.notify.notified();
                if state.channel.is_cancelled(&state.consumer_tag) {
                    return None;
                }
                match state.channel.pop(&state.queue, state.auto_ack) {
                    Ok(Some(delivery)) => return Some((Ok(delivery), state)),
                    Ok(None) => {}
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
                notified.await;
            }
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.inner
            .broker
            .state()
            .cancelled_consumers
            .insert(consumer_tag.to_owned());
        self.inner.broker.inner.notify.notify_waiters();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire) && self.inner.connection_open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.inner.broker.state().close_channel(self.inner.id);
        self.inner.broker.inner.notify.notify_waiters();
        Ok(())
    }
}
