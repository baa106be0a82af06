use thiserror::Error;

use crate::descriptor::SafetyClass;
use crate::lifecycle::LifecycleState;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Service name is already registered.
    #[error("service `{0}` is already registered")]
    DuplicateService(String),

    /// A required dependency targets an unregistered service.
    #[error("service `{service}` requires unregistered service `{dependency}`")]
    UnknownDependency {
        /// The dependent service.
        service: String,

        /// The missing dependency target.
        dependency: String,
    },

    /// A cycle exists among required dependencies.
    #[error("required-dependency cycle: {}", cycle.join(" -> "))]
    DependencyCycle {
        /// The services forming the cycle, in edge order, first repeated last.
        cycle: Vec<String>,
    },

    /// A service requires a target with a lower safety classification without
    /// acknowledging the inversion.
    #[error(
        "service `{service}` ({service_class:?}) requires lower-classified `{dependency}` ({dependency_class:?}) without acknowledgment"
    )]
    ClassInversion {
        /// The dependent service.
        service: String,

        /// The dependent's safety classification.
        service_class: SafetyClass,

        /// The dependency target.
        dependency: String,

        /// The target's safety classification.
        dependency_class: SafetyClass,
    },

    /// Startup of a safety-relevant service failed, aborting bring-up.
    #[error("startup of `{service}` failed: {reason}")]
    StartupFailure {
        /// The service that failed to start.
        service: String,

        /// Why it failed.
        reason: String,
    },

    /// Startup was already performed.
    #[error("already started")]
    AlreadyStarted,

    /// The requested lifecycle transition is not allowed.
    #[error("invalid lifecycle transition for `{service}`: {from:?} -> {to:?}")]
    InvalidTransition {
        /// The service whose transition was rejected.
        service: String,

        /// Current state.
        from: LifecycleState,

        /// Requested state.
        to: LifecycleState,
    },

    /// No service is registered under the given name.
    #[error("unknown service `{0}`")]
    UnknownService(String),

    /// The service still has dependents that would lose a required dependency.
    #[error("service `{service}` has active dependents: {}", dependents.join(", "))]
    ActiveDependents {
        /// The service that was asked to go into maintenance.
        service: String,

        /// Dependents currently relying on it.
        dependents: Vec<String>,
    },
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
