use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use coach_bootable::Bootable;
use serde::{Deserialize, Serialize};

/// Safety classification of a service.
///
/// Ordered least to most safety-sensitive. The ordering is what the resolver
/// checks when a service requires a target classified below itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SafetyClass {
    /// Background tooling; failures never gate bring-up.
    Maintenance,

    /// Normal operational service.
    Operational,

    /// Participates in safety decisions (interlock inputs, monitoring).
    SafetyRelated,

    /// Commands physical position: slides, jacks, awnings.
    PositionCritical,

    /// The system cannot run without it.
    Critical,
}

impl SafetyClass {
    /// Whether a startup failure of a service with this classification aborts
    /// the whole bring-up.
    #[must_use]
    pub const fn startup_failure_is_fatal(self) -> bool {
        matches!(self, Self::Critical | Self::SafetyRelated)
    }

    /// Whether services with this classification are forced into safe
    /// shutdown when an emergency stop is raised.
    #[must_use]
    pub const fn forced_on_emergency_stop(self) -> bool {
        matches!(self, Self::Critical | Self::PositionCritical)
    }

    /// Whether commands against services with this classification are gated
    /// by interlocks.
    #[must_use]
    pub const fn interlock_gated(self) -> bool {
        matches!(self, Self::PositionCritical | Self::SafetyRelated)
    }
}

/// How a dependency participates in startup ordering and health propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyKind {
    /// The service cannot reach healthy without it. Gates startup ordering
    /// and propagates degradation.
    Required,

    /// Absence allows degraded operation or a fallback. Never gates ordering.
    Optional,

    /// Needed only after startup completes. Validated post-startup, never
    /// propagated.
    Runtime,
}

/// A declared edge from a service to one of its dependencies.
#[derive(Debug, Clone)]
pub struct Dependency {
    /// Name of the dependency target.
    pub target: String,

    /// How the dependency participates in ordering and propagation.
    pub kind: DependencyKind,

    /// Service to substitute when an optional target is unavailable.
    pub fallback: Option<String>,

    /// Whether the dependent cannot operate at all without this target.
    /// Load-bearing required edges propagate failure instead of degradation.
    pub load_bearing: bool,

    /// Acknowledges that the dependent is classified above the target.
    pub class_inversion_acknowledged: bool,
}

impl Dependency {
    /// A required dependency on `target`.
    pub fn required(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            kind: DependencyKind::Required,
            fallback: None,
            load_bearing: false,
            class_inversion_acknowledged: false,
        }
    }

    /// An optional dependency on `target`.
    pub fn optional(target: impl Into<String>) -> Self {
        Self {
            kind: DependencyKind::Optional,
            ..Self::required(target)
        }
    }

    /// A runtime-only dependency on `target`.
    pub fn runtime(target: impl Into<String>) -> Self {
        Self {
            kind: DependencyKind::Runtime,
            ..Self::required(target)
        }
    }

    /// Declare a fallback service for an optional dependency.
    #[must_use]
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    /// Mark the dependency as load-bearing: its failure fails the dependent
    /// outright rather than degrading it.
    #[must_use]
    pub const fn load_bearing(mut self) -> Self {
        self.load_bearing = true;
        self
    }

    /// Acknowledge that the dependent is classified above this target.
    #[must_use]
    pub const fn acknowledge_class_inversion(mut self) -> Self {
        self.class_inversion_acknowledged = true;
        self
    }
}

/// Options for constructing a [`ServiceDescriptor`].
pub struct ServiceDescriptorOptions {
    /// Unique service name.
    pub name: String,

    /// The service body driven through its lifecycle.
    pub body: Arc<dyn Bootable>,

    /// Declared dependencies.
    pub dependencies: Vec<Dependency>,

    /// Free-form tags for grouping and queries.
    pub tags: Vec<String>,

    /// Safety classification.
    pub safety_class: SafetyClass,

    /// Human-readable description.
    pub description: String,

    /// Heartbeat interval for watchdog supervision, if any.
    pub heartbeat: Option<Duration>,
}

/// Immutable description of one supervised service.
#[derive(Clone)]
pub struct ServiceDescriptor {
    name: String,
    body: Arc<dyn Bootable>,
    dependencies: Vec<Dependency>,
    tags: BTreeSet<String>,
    safety_class: SafetyClass,
    description: String,
    heartbeat: Option<Duration>,
}

impl ServiceDescriptor {
    /// Creates a new `ServiceDescriptor`.
    #[must_use]
    pub fn new(
        ServiceDescriptorOptions {
            name,
            body,
            dependencies,
            tags,
            safety_class,
            description,
            heartbeat,
        }: ServiceDescriptorOptions,
    ) -> Self {
        Self {
            name,
            body,
            dependencies,
            tags: tags.into_iter().collect(),
            safety_class,
            description,
            heartbeat,
        }
    }

    /// The unique service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The service body.
    #[must_use]
    pub const fn body(&self) -> &Arc<dyn Bootable> {
        &self.body
    }

    /// Declared dependencies.
    #[must_use]
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Free-form tags.
    #[must_use]
    pub const fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Safety classification.
    #[must_use]
    pub const fn safety_class(&self) -> SafetyClass {
        self.safety_class
    }

    /// Human-readable description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Declared heartbeat interval, if any.
    #[must_use]
    pub const fn heartbeat(&self) -> Option<Duration> {
        self.heartbeat
    }

    /// The declared fallback for an optional dependency on `target`, if any.
    pub(crate) fn fallback_for(&self, target: &str) -> Option<&str> {
        self.dependencies
            .iter()
            .find(|d| d.kind == DependencyKind::Optional && d.target == target)
            .and_then(|d| d.fallback.as_deref())
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("tags", &self.tags)
            .field("safety_class", &self.safety_class)
            .field("description", &self.description)
            .field("heartbeat", &self.heartbeat)
            .finish_non_exhaustive()
    }
}
