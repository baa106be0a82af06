//! Abstract interface for bootable services.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome of a service health probe.
///
/// Ordered worst-last so two probe results can be folded with [`HealthStatus::combine`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Service is functioning normally.
    Healthy,

    /// Service is operational with reduced capability.
    Degraded(String),

    /// Service is not functioning.
    Failed(String),
}

impl HealthStatus {
    /// Check if the probe found the service operational (healthy or degraded).
    #[must_use]
    pub const fn is_operational(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded(_))
    }

    /// Combine two probe results, returning the worse one.
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        std::cmp::max(self, other)
    }
}

/// Trait for bootable services.
#[async_trait]
pub trait Bootable
where
    Self: Send + Sync + 'static,
{
    /// Get the name of the bootable service.
    fn name(&self) -> &str;

    /// Start the bootable service.
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Shutdown the bootable service.
    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Probe the health of the bootable service.
    ///
    /// Services without a meaningful probe report healthy whenever they are running.
    async fn check_health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}
