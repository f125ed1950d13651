//! Long-running, push-style consumers. Check out [`ConsumerFactory`] as a starting point.
pub use consumer::{BrokerAction, Consumer, ConsumerHandle, ConsumerState};
pub use error::{ConsumerError, ErrorType, HandlerError};
pub use factory::{ConsumerFactory, ConsumerOptions};
pub use handler::{AsyncClosure, ClosureHandler, Handler, SyncHandler};
pub use incoming_message::Incoming;

mod consumer;
mod error;
mod factory;
mod handler;
mod incoming_message;
