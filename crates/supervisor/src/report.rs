use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::descriptor::SafetyClass;
use crate::lifecycle::LifecycleState;

/// Terminal outcome of one service's startup attempt.
#[derive(Debug, Clone, Serialize)]
pub enum StartOutcome {
    /// Started and passed its startup probe.
    Healthy,

    /// Started healthy against the declared fallback of an absent optional
    /// dependency.
    HealthyViaFallback {
        /// The fallback service in use.
        fallback: String,
    },

    /// Started, but entered degraded operation immediately.
    Degraded {
        /// Why the service is degraded.
        reason: String,
    },

    /// Startup factory or startup probe failed.
    Failed {
        /// Why startup failed.
        reason: String,
    },

    /// Never attempted because a required dependency did not come up.
    Skipped {
        /// Why startup was skipped.
        reason: String,
    },
}

impl StartOutcome {
    /// Whether the service ended up running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Healthy | Self::HealthyViaFallback { .. } | Self::Degraded { .. }
        )
    }
}

/// Startup record for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStartReport {
    /// Service name.
    pub service: String,

    /// Stage the service was started in.
    pub stage: usize,

    /// How startup ended.
    pub outcome: StartOutcome,

    /// Wall-clock time the startup attempt took.
    pub duration: Duration,
}

/// Structured result of a full startup sequence.
#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    /// When the sequence began.
    pub started_at: DateTime<Utc>,

    /// Wall-clock time for the whole sequence.
    pub duration: Duration,

    /// Per-service outcomes, in realized completion order.
    pub services: Vec<ServiceStartReport>,

    /// Runtime dependencies found missing after all stages completed.
    pub missing_runtime: BTreeMap<String, Vec<String>>,
}

/// Terminal outcome of one service's shutdown attempt.
#[derive(Debug, Clone, Serialize)]
pub enum ShutdownOutcome {
    /// Shutdown routine completed.
    Stopped,

    /// The service was already stopped.
    AlreadyStopped,

    /// Shutdown routine failed; later shutdowns still ran.
    Failed {
        /// Why the shutdown routine failed.
        reason: String,
    },

    /// Abandoned because the global shutdown deadline passed.
    Abandoned,
}

/// Shutdown record for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceShutdownReport {
    /// Service name.
    pub service: String,

    /// Stage the service had been started in, when known.
    pub stage: Option<usize>,

    /// How shutdown ended.
    pub outcome: ShutdownOutcome,

    /// Wall-clock time the shutdown attempt took.
    pub duration: Duration,
}

/// Structured result of a full shutdown sequence.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// When the sequence began.
    pub started_at: DateTime<Utc>,

    /// Wall-clock time for the whole sequence.
    pub duration: Duration,

    /// Per-service outcomes, in reverse realized start order.
    pub services: Vec<ServiceShutdownReport>,

    /// Whether the global shutdown deadline was exceeded.
    pub deadline_exceeded: bool,
}

/// Outcome of one service's recovery workflow.
#[derive(Debug, Clone, Serialize)]
pub enum RecoveryOutcome {
    /// The service came back up.
    Recovered {
        /// Attempts used, including the successful one.
        attempts: u32,
    },

    /// Every attempt failed.
    ExhaustedRetries {
        /// Attempts used.
        attempts: u32,

        /// The last failure reason.
        reason: String,
    },
}

/// Recovery record for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRecoveryReport {
    /// Service name.
    pub service: String,

    /// How recovery ended.
    pub outcome: RecoveryOutcome,
}

/// Structured result of a recovery pass over failed services.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    /// Per-service outcomes, in dependency order.
    pub services: Vec<ServiceRecoveryReport>,
}

/// Summary row for `list_services`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    /// Service name.
    pub name: String,

    /// Human-readable description.
    pub description: String,

    /// Safety classification.
    pub safety_class: SafetyClass,

    /// Current lifecycle state.
    pub state: LifecycleState,

    /// Free-form tags.
    pub tags: BTreeSet<String>,
}
