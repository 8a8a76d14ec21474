// src/platforms/mod.rs - Platform adapter trait

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::types::{Delivery, InboundEvent};

pub mod telegram;

/// Trait defining the interface all platform connections must implement
#[async_trait]
pub trait PlatformConnection: Send + Sync {
    /// Connect to the platform and start receiving events
    async fn connect(&mut self) -> Result<()>;

    /// Execute one outbound delivery: a rendered notice or a relayed payload
    async fn deliver(&self, delivery: &Delivery) -> Result<()>;

    /// Get the platform identifier (e.g., "telegram")
    fn platform_name(&self) -> &str;

    /// Check if the connection is healthy
    async fn is_connected(&self) -> bool;

    /// Get a receiver for inbound events
    fn event_receiver(&self) -> Option<broadcast::Receiver<InboundEvent>>;

    /// Gracefully disconnect
    async fn disconnect(&mut self) -> Result<()>;
}
