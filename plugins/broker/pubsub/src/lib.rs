//! Google Cloud Pub/Sub over its REST API.

pub mod client;
pub mod config;
mod lease;
pub mod subscription;

pub use client::{PubSubClient, status_error};
pub use config::PubSubConfig;
pub use subscription::PubSubSubscription;

/// Permission checked before the receive loop starts.
pub const CONSUME_PERMISSION: &str = "pubsub.subscriptions.consume";
