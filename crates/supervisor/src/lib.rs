//! Control-plane supervisor for the coach-node service fleet.
//!
//! Owns every registered service's lifecycle: plans startup stages from the
//! declared dependency graph, starts each stage concurrently, polls health
//! and propagates degradation across dependents, supervises heartbeats, and
//! tears everything down in the reverse of the realized start order.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod descriptor;
mod error;
mod health;
mod lifecycle;
mod report;
mod resolver;
mod supervisor;

pub use descriptor::{
    Dependency, DependencyKind, SafetyClass, ServiceDescriptor, ServiceDescriptorOptions,
};
pub use error::{Error, Result};
pub use health::{HealthReport, HealthSummary};
pub use lifecycle::{AuditRecord, LifecycleState};
pub use report::{
    RecoveryOutcome, RecoveryReport, ServiceInfo, ServiceRecoveryReport, ServiceShutdownReport,
    ServiceStartReport, ShutdownOutcome, ShutdownReport, StartOutcome, StartupReport,
};
pub use resolver::StagePlan;
pub use supervisor::{Supervisor, SupervisorOptions};
