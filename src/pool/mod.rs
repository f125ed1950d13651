//! Pooling of connections and channels, built on [`deadpool`].
//!
//! This module provides three key guarantees:
//! - a checked out channel is never handed to two callers at once;
//! - broken channels are disposed of and recreated on demand, on the next acquire;
//! - connections are reused across channels and reconnected in place when they die.
//!
//! ```rust,no_run
//! use warren::configuration::Settings;
//! use warren::pool::PoolManager;
//! use warren::transport::{PublishOptions, TransportChannel};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let manager = PoolManager::connect(&Settings::default()).await?;
//!
//!     // Check out a standard channel, use it, hand it back.
//!     let channel = manager.acquire_standard().await?;
//!     channel
//!         .send("", "my-queue", b"hello", &PublishOptions::default())
//!         .await?;
//!     manager.return_channel(channel);
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;
mod manager;

pub use channel::{ChannelKind, ChannelManager, ChannelPair, ChannelPool, KindStatus, ManagedChannel};
pub use connection::{ConnectionLease, ConnectionPool, PooledConnection};
pub use error::Error;
pub use manager::{PoolManager, PoolStatus};
