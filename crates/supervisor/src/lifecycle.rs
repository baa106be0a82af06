use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a supervised service.
///
/// Owned exclusively by the supervisor; every mutation goes through the
/// transition table below and leaves an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Not running. The initial state.
    Stopped,

    /// Startup factory in flight.
    Initializing,

    /// Running and passing health checks.
    Healthy,

    /// Running with reduced capability.
    Degraded,

    /// Not usable; recovery may retry it.
    Failed,

    /// Forced into a safe state; leaving requires explicit operator action.
    SafeShutdown,

    /// Taken offline by an operator; leaving requires explicit operator action.
    Maintenance,
}

impl LifecycleState {
    /// States that require explicit operator action to leave.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::SafeShutdown | Self::Maintenance)
    }

    /// States in which the service is able to do work.
    #[must_use]
    pub const fn is_operational(self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Whether the transition table allows moving from `self` to `to`.
    pub(crate) const fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (Self::Stopped, Self::Initializing)
            | (Self::Initializing, Self::Healthy | Self::Failed)
            | (Self::Healthy, Self::Degraded | Self::Failed | Self::Maintenance)
            | (Self::Degraded, Self::Healthy | Self::Failed | Self::Maintenance)
            | (Self::Failed, Self::Initializing) => true,
            (from, Self::SafeShutdown) => !from.is_terminal(),
            (_, Self::Stopped) => true,
            _ => false,
        }
    }
}

/// One committed lifecycle transition.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// State before the transition.
    pub previous: LifecycleState,

    /// State after the transition.
    pub next: LifecycleState,

    /// Why the transition happened.
    pub cause: String,

    /// Who asked for it, when the trigger was an operator.
    pub actor: Option<String>,

    /// When the transition was committed.
    pub at: DateTime<Utc>,
}
