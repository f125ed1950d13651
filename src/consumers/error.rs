use crate::pool;
use crate::transport::TransportError;
use std::fmt;

/// The error type returned by message handlers.
///
/// Its [`ErrorType`] decides what happens to the message on an ackable consumer.
#[derive(Debug)]
pub struct HandlerError {
    /// The underlying error returned by the message handler.
    pub inner_error: anyhow::Error,
    pub error_type: ErrorType,
}

impl HandlerError {
    /// Processing may succeed if retried: the message is nacked and requeued.
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner_error: error.into(),
            error_type: ErrorType::Transient,
        }
    }

    /// Processing will never succeed: the message is rejected without requeueing.
    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        Self {
            inner_error: error.into(),
            error_type: ErrorType::Fatal,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        Self::transient(error)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner_error.as_ref())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handling of a message failed due to a {} issue.\n{}",
            self.error_type, self.inner_error
        )
    }
}

/// Types of failure when handling a message.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorType {
    /// Message processing might succeed if retried after a short delay.
    ///
    /// E.g. the message handler timed out calling an API it depends on.
    Transient,
    /// Message processing will never succeed, no matter how many times you retry.
    ///
    /// E.g. the message payload is malformed and cannot be deserialized.
    Fatal,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Error returned when creating a consumer.
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("{}", dispatch_mode_hint(.dispatch_consumers_async))]
    DispatchMode { dispatch_consumers_async: bool },
    #[error("Failed to open a channel for the consumer")]
    Pool(#[from] pool::Error),
    #[error("Failed to configure the consumer channel")]
    Transport(#[from] TransportError),
}

fn dispatch_mode_hint(dispatch_consumers_async: &bool) -> &'static str {
    if *dispatch_consumers_async {
        "Consumers are dispatched asynchronously in this process: use `create_async_consumer`"
    } else {
        "Consumers are dispatched synchronously in this process: use `create_consumer`"
    }
}
