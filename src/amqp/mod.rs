//! Helpers for connecting to a rabbitmq broker

pub mod configuration;
mod factory;
pub use factory::ConnectionFactory;

pub use lapin::{options, types, BasicProperties};
