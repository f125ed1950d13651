//! Caller-facing publish and get operations on top of the [`PoolManager`](crate::pool::PoolManager).
//!
//! Every operation borrows a channel from the pools, performs the broker call, flags the
//! channel dead if the call says it was closed, and always hands the channel back.
mod ackable;
mod service;

pub use ackable::AckableResult;
pub use service::DeliveryService;

use crate::pool;
use crate::transport::TransportError;

/// Error returned by [`DeliveryService`] operations.
#[derive(thiserror::Error, Debug)]
pub enum DeliveryError {
    #[error("Failed to check out a channel")]
    Pool(#[from] pool::Error),
    #[error("The broker operation failed")]
    Transport(#[from] TransportError),
}
