//! NATS change notifier for fastci.

pub mod config;
mod notifier;

pub use config::NatsConfig;
pub use notifier::NatsNotifier;
