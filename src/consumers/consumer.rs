use super::{ErrorType, Handler, HandlerError, Incoming, SyncHandler};
use crate::pool::ManagedChannel;
use crate::transport::{Delivery, Transport, TransportChannel};
use futures_util::{stream::FuturesUnordered, Future, FutureExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// The lifecycle of a [`Consumer`]: `Created -> Consuming -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// The channel is open and its quality of service configured.
    Created,
    /// The broker is pushing messages to the consumer.
    Consuming,
    /// The channel has been closed. A stopped consumer cannot be restarted.
    Stopped,
}

/// The action we asked the broker to take when finalising the processing of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerAction {
    /// Positive acknowledgement - the message can be removed from the queue.
    Ack,
    /// Negative acknowledgement - the message was not processed successfully and should be
    /// requeued to retry processing.
    Nack,
    /// Rejection. The message was not processed successfully and should NOT be requeued.
    /// The message will be sent to the dead letter exchange if configured.
    Reject,
}

impl BrokerAction {
    fn for_outcome(outcome: &Result<(), HandlerError>) -> Self {
        match outcome {
            Ok(()) => Self::Ack,
            Err(e) => match e.error_type {
                ErrorType::Transient => Self::Nack,
                ErrorType::Fatal => Self::Reject,
            },
        }
    }
}

pub(super) enum Dispatch {
    Sync(Arc<dyn SyncHandler>),
    Async(Arc<dyn Handler>),
}

/// A push-style consumer bound to one queue and to one transient channel it owns.
///
/// Build it with [`ConsumerFactory`](super::ConsumerFactory), then drive it with
/// [`Consumer::run_until_shutdown`] or [`Consumer::spawn`]. The channel is closed when the
/// consumer stops; it never goes back to a pool.
pub struct Consumer<T: Transport> {
    channel: ManagedChannel<T::Channel>,
    queue_name: String,
    consumer_tag: String,
    auto_ack: bool,
    prefetch_count: u16,
    dispatch: Dispatch,
    state: watch::Sender<ConsumerState>,
}

impl<T: Transport> Consumer<T> {
    pub(super) fn new(
        channel: ManagedChannel<T::Channel>,
        queue_name: &str,
        consumer_tag: String,
        auto_ack: bool,
        prefetch_count: u16,
        dispatch: Dispatch,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Created);
        Self {
            channel,
            queue_name: queue_name.to_owned(),
            consumer_tag,
            auto_ack,
            prefetch_count,
            dispatch,
            state,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Get notified of state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Run the consumer on a dedicated task. Dropping the returned handle stops it.
    pub fn spawn(self) -> ConsumerHandle {
        let (shutdown, signal) = oneshot::channel::<()>();
        let state = self.subscribe();
        let task = tokio::spawn(self.run_until_shutdown(signal.map(|_| ())));
        ConsumerHandle {
            shutdown: Some(shutdown),
            task,
            state,
        }
    }

    /// Ask the broker to start pushing messages from the queue, and process them until
    /// `shutdown` resolves or the broker stops the consumer.
    ///
    /// The channel is closed before returning, whatever the outcome. An error is returned if
    /// the consumer could not start or if its channel failed while consuming.
    #[tracing::instrument(skip_all, name = "consumer_run", fields(queue_name = %self.queue_name, consumer_tag = %self.consumer_tag))]
    pub async fn run_until_shutdown(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), anyhow::Error> {
        let result = self.consume_until(shutdown).await;
        self.stop().await;
        result
    }

    async fn consume_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), anyhow::Error> {
        let mut deliveries = self
            .channel
            .consume(&self.queue_name, &self.consumer_tag, self.auto_ack)
            .await?;
        self.state.send_replace(ConsumerState::Consuming);

        let mut in_flight = FuturesUnordered::new();
        let max_in_flight = usize::from(self.prefetch_count.max(1));

        let shutdown = shutdown.fuse();
        tokio::pin!(shutdown);

        let result = 'consume: loop {
            tokio::select! {
                // Prefer handling shutdowns before going on with processing more messages.
                biased;

                _ = &mut shutdown => {
                    tracing::info!("Consumer received shutdown signal");
                    if let Err(e) = self.channel.cancel(&self.consumer_tag).await {
                        tracing::warn!(error = ?e, "Failed to cancel the consumer");
                    }
                    break 'consume Ok(());
                }

                _ = in_flight.next(), if !in_flight.is_empty() => {}

                event = deliveries.next(), if in_flight.len() < max_in_flight => {
                    match event {
                        // The broker cancelled the consumer.
                        None => break 'consume Ok(()),
                        Some(Err(e)) => {
                            tracing::error!(error = ?e, "Consumer error");
                            break 'consume Err(e.into());
                        }
                        Some(Ok(delivery)) => match &self.dispatch {
                            Dispatch::Sync(handler) => {
                                let incoming = Incoming {
                                    message: &delivery,
                                    queue_name: &self.queue_name,
                                };
                                let outcome = handler.handle(incoming);
                                self.settle(&delivery, outcome).await;
                            }
                            Dispatch::Async(handler) => {
                                in_flight.push(self.process(handler.clone(), delivery));
                            }
                        },
                    }
                }
            }
        };

        // Make sure all messages in flight are settled before returning.
        while in_flight.next().await.is_some() {}

        result
    }

    #[tracing::instrument(name = "process_message", skip_all, level = "debug", fields(delivery_tag = delivery.delivery_tag))]
    async fn process(&self, handler: Arc<dyn Handler>, delivery: Delivery) {
        let incoming = Incoming {
            message: &delivery,
            queue_name: &self.queue_name,
        };
        let outcome = handler.handle(incoming).await;
        self.settle(&delivery, outcome).await;
    }

    /// Ack, nack or reject the message according to the outcome of its processing.
    async fn settle(&self, delivery: &Delivery, outcome: Result<(), HandlerError>) {
        if let Err(e) = &outcome {
            tracing::warn!(
                error = %e,
                delivery_tag = delivery.delivery_tag,
                "Failed to process message"
            );
        }
        if self.auto_ack {
            return;
        }
        let action = BrokerAction::for_outcome(&outcome);
        let result = match action {
            BrokerAction::Ack => self.channel.ack(delivery.delivery_tag, false).await,
            BrokerAction::Nack => self.channel.nack(delivery.delivery_tag, true).await,
            BrokerAction::Reject => self.channel.reject(delivery.delivery_tag, false).await,
        };
        if let Err(e) = result {
            tracing::error!(
                error = ?e,
                ?action,
                delivery_tag = delivery.delivery_tag,
                "Failed to settle message with the broker"
            );
        }
    }

    async fn stop(&self) {
        if self.channel.is_open() {
            if let Err(e) = self.channel.close().await {
                tracing::warn!(error = ?e, "Failed to close the consumer channel");
            }
        }
        self.state.send_replace(ConsumerState::Stopped);
    }
}

/// A handle on a consumer running on its own task, see [`Consumer::spawn`].
pub struct ConsumerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), anyhow::Error>>,
    state: watch::Receiver<ConsumerState>,
}

impl ConsumerHandle {
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Wait until the consumer reaches `state`, or stops.
    pub async fn wait_for(&mut self, state: ConsumerState) -> ConsumerState {
        loop {
            let current = *self.state.borrow_and_update();
            if current == state || current == ConsumerState::Stopped {
                return current;
            }
            if self.state.changed().await.is_err() {
                return ConsumerState::Stopped;
            }
        }
    }

    /// Signal the consumer to stop and wait for it to settle its messages in flight and close
    /// its channel.
    pub async fn stop(mut self) -> Result<(), anyhow::Error> {
        if let Some(shutdown) = self.shutdown.take() {
            // The consumer may already be gone, there is nobody to notify then.
            let _ = shutdown.send(());
        }
        self.task.await?
    }
}
