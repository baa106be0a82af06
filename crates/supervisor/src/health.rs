use std::collections::BTreeMap;

use serde::Serialize;

use crate::lifecycle::LifecycleState;

/// Aggregate counts across all supervised services.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HealthSummary {
    /// Total registered services.
    pub total: usize,

    /// Services currently healthy.
    pub healthy: usize,

    /// Services currently degraded.
    pub degraded: usize,

    /// Services currently failed.
    pub failed: usize,

    /// Services currently stopped.
    pub stopped: usize,

    /// Services currently initializing.
    pub initializing: usize,

    /// Services forced into safe shutdown.
    pub safe_shutdown: usize,

    /// Services in maintenance.
    pub maintenance: usize,
}

impl HealthSummary {
    fn count(&mut self, state: LifecycleState) {
        self.total += 1;
        match state {
            LifecycleState::Stopped => self.stopped += 1,
            LifecycleState::Initializing => self.initializing += 1,
            LifecycleState::Healthy => self.healthy += 1,
            LifecycleState::Degraded => self.degraded += 1,
            LifecycleState::Failed => self.failed += 1,
            LifecycleState::SafeShutdown => self.safe_shutdown += 1,
            LifecycleState::Maintenance => self.maintenance += 1,
        }
    }
}

/// Point-in-time liveness view of the whole fleet, cheap to produce: it only
/// reads committed lifecycle states, never the services themselves.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Lifecycle state per service.
    pub services: BTreeMap<String, LifecycleState>,

    /// Aggregate counts.
    pub summary: HealthSummary,
}

impl HealthReport {
    pub(crate) fn new(services: BTreeMap<String, LifecycleState>) -> Self {
        let mut summary = HealthSummary::default();
        for state in services.values() {
            summary.count(*state);
        }
        Self { services, summary }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts_every_state_once() {
        let report = HealthReport::new(
            [
                ("a".to_string(), LifecycleState::Healthy),
                ("b".to_string(), LifecycleState::Healthy),
                ("c".to_string(), LifecycleState::Degraded),
                ("d".to_string(), LifecycleState::Failed),
                ("e".to_string(), LifecycleState::SafeShutdown),
            ]
            .into_iter()
            .collect(),
        );

        assert_eq!(report.summary.total, 5);
        assert_eq!(report.summary.healthy, 2);
        assert_eq!(report.summary.degraded, 1);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.safe_shutdown, 1);
        assert_eq!(report.summary.stopped, 0);
    }
}
