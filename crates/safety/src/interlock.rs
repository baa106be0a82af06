use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use coach_supervisor::{SafetyClass, Supervisor};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::state::{StateValue, StateView, SystemState, keys};

type Predicate = Arc<dyn Fn(&StateView<'_>) -> bool + Send + Sync>;

/// A named safety precondition guarding commands against services of one
/// safety classification.
///
/// Stateless aside from its predicate; re-evaluated on every relevant
/// system-state update and before every gated command.
#[derive(Clone)]
pub struct Interlock {
    name: String,
    guards: SafetyClass,
    message: String,
    predicate: Predicate,
}

impl Interlock {
    /// Creates a new `Interlock`. The predicate must hold for guarded
    /// commands to be allowed.
    pub fn new(
        name: impl Into<String>,
        guards: SafetyClass,
        message: impl Into<String>,
        predicate: impl Fn(&StateView<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            guards,
            message: message.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// The interlock name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The safety classification this interlock guards.
    #[must_use]
    pub const fn guards(&self) -> SafetyClass {
        self.guards
    }

    /// The human-readable violation message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn holds(&self, view: &StateView<'_>) -> bool {
        (self.predicate)(view)
    }
}

impl fmt::Debug for Interlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interlock")
            .field("name", &self.name)
            .field("guards", &self.guards)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// The interlocks every position-critical deployment starts from: parked,
/// stationary, slides retracted.
#[must_use]
pub fn standard_interlocks() -> Vec<Interlock> {
    vec![
        Interlock::new(
            "parking-brake-engaged",
            SafetyClass::PositionCritical,
            "parking brake must be engaged",
            |view| view.flag(keys::PARKING_BRAKE_ENGAGED) == Some(true),
        ),
        Interlock::new(
            "vehicle-stationary",
            SafetyClass::PositionCritical,
            "vehicle must be stationary",
            |view| view.number(keys::VEHICLE_SPEED).is_some_and(|speed| speed < 0.5),
        ),
        Interlock::new(
            "slides-retracted",
            SafetyClass::PositionCritical,
            "all slide-outs must be retracted",
            |view| view.flag(keys::SLIDES_RETRACTED) == Some(true),
        ),
    ]
}

/// Details of an engaged emergency stop.
#[derive(Debug, Clone, Serialize)]
pub struct EmergencyStopInfo {
    /// Why the emergency stop was raised.
    pub cause: String,

    /// When it engaged.
    pub engaged_at: DateTime<Utc>,
}

/// Record captured at the moment an emergency stop engages.
#[derive(Debug, Clone, Serialize)]
pub struct ForensicSnapshot {
    /// Snapshot id.
    pub id: Uuid,

    /// When the snapshot was captured.
    pub captured_at: DateTime<Utc>,

    /// Why the emergency stop was raised.
    pub cause: String,

    /// Interlocks violated at the moment of capture.
    pub violated: Vec<String>,

    /// Full copy of the system state at the moment of capture.
    pub system_state: BTreeMap<String, StateValue>,

    /// Services forced into safe shutdown.
    pub forced_services: Vec<String>,
}

/// Options for configuring an [`InterlockEngine`].
pub struct InterlockEngineOptions {
    /// Distinct simultaneous interlock violations that trigger an emergency
    /// stop.
    pub emergency_stop_threshold: usize,

    /// Token required to clear an emergency stop.
    pub authorization_token: String,

    /// Forensic snapshots retained, oldest dropped first.
    pub forensic_retention: usize,
}

struct EngineInner {
    supervisor: Supervisor,
    system_state: SystemState,
    options: InterlockEngineOptions,
    interlocks: RwLock<Vec<Interlock>>,
    violated: RwLock<BTreeSet<String>>,
    emergency_stop: RwLock<Option<EmergencyStopInfo>>,
    forensics: RwLock<VecDeque<ForensicSnapshot>>,
}

/// Evaluates interlocks against the system state, gates commands to guarded
/// services, and escalates to an emergency stop when too many interlocks are
/// violated at once.
#[derive(Clone)]
pub struct InterlockEngine {
    inner: Arc<EngineInner>,
}

impl InterlockEngine {
    /// Creates a new `InterlockEngine` over the given supervisor, with the
    /// system state initialized to the safe baseline.
    #[must_use]
    pub fn new(supervisor: Supervisor, options: InterlockEngineOptions) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                supervisor,
                system_state: SystemState::safe_baseline(),
                options,
                interlocks: RwLock::new(Vec::new()),
                violated: RwLock::new(BTreeSet::new()),
                emergency_stop: RwLock::new(None),
                forensics: RwLock::new(VecDeque::new()),
            }),
        }
    }

    /// The shared system-state snapshot.
    #[must_use]
    pub fn system_state(&self) -> &SystemState {
        &self.inner.system_state
    }

    /// Register an interlock and re-evaluate the violation set.
    pub fn register_interlock(&self, interlock: Interlock) {
        debug!("registered interlock {}", interlock.name());
        self.inner.interlocks.write().push(interlock);
        self.reevaluate();
    }

    /// Ingest one system-state update. Fire-and-forget; triggers interlock
    /// re-evaluation and possibly an emergency stop.
    pub fn update_system_state(&self, key: impl Into<String>, value: StateValue) {
        self.inner.system_state.set(key, value);
        self.reevaluate();
    }

    /// Decide whether `command` may be executed against `service`.
    ///
    /// # Errors
    ///
    /// Rejects with the violated interlock's message, with
    /// [`Error::EmergencyStopActive`] while an emergency stop is engaged, and
    /// with the supervisor's error when the service is unknown.
    pub fn evaluate_command(&self, service: &str, command: &str) -> Result<()> {
        let class = self.inner.supervisor.safety_class(service)?;

        if class.forced_on_emergency_stop() {
            let stop = self.inner.emergency_stop.read();
            if let Some(info) = stop.as_ref() {
                warn!("rejecting `{command}` against {service}: emergency stop active");
                return Err(Error::EmergencyStopActive {
                    cause: info.cause.clone(),
                });
            }
        }

        if !class.interlock_gated() {
            return Ok(());
        }

        let interlocks = self.inner.interlocks.read();
        let violation = self.inner.system_state.read(|view| {
            interlocks
                .iter()
                .filter(|interlock| interlock.guards() == class)
                .find(|interlock| !interlock.holds(view))
                .map(|interlock| (interlock.name().to_string(), interlock.message().to_string()))
        });

        if let Some((interlock, message)) = violation {
            warn!("rejecting `{command}` against {service}: interlock {interlock} violated");
            return Err(Error::InterlockViolation {
                service: service.to_string(),
                command: command.to_string(),
                interlock,
                message,
            });
        }
        Ok(())
    }

    /// Raise an emergency stop: force every guarded service into safe
    /// shutdown, latch command rejection, and capture a forensic snapshot.
    /// Idempotent while already engaged.
    pub fn trigger_emergency_stop(&self, cause: &str) {
        {
            let mut stop = self.inner.emergency_stop.write();
            if stop.is_some() {
                debug!("emergency stop already active");
                return;
            }
            *stop = Some(EmergencyStopInfo {
                cause: cause.to_string(),
                engaged_at: Utc::now(),
            });
        }

        error!("EMERGENCY STOP: {cause}");
        let forced = self
            .inner
            .supervisor
            .force_safe_shutdown(&format!("emergency stop: {cause}"));

        let snapshot = ForensicSnapshot {
            id: Uuid::new_v4(),
            captured_at: Utc::now(),
            cause: cause.to_string(),
            violated: self.violated_interlocks(),
            system_state: self.inner.system_state.snapshot(),
            forced_services: forced,
        };
        let mut forensics = self.inner.forensics.write();
        if forensics.len() >= self.inner.options.forensic_retention {
            forensics.pop_front();
        }
        forensics.push_back(snapshot);
    }

    /// Clear an engaged emergency stop.
    ///
    /// # Errors
    ///
    /// Rejects an invalid authorization token (the attempt is logged) and
    /// clearing when no emergency stop is engaged.
    pub fn clear_emergency_stop(&self, token: &str) -> Result<()> {
        let mut stop = self.inner.emergency_stop.write();
        if stop.is_none() {
            return Err(Error::NotActive);
        }
        if token != self.inner.options.authorization_token {
            warn!("rejected emergency stop clear: invalid authorization token");
            return Err(Error::Authorization);
        }
        *stop = None;
        drop(stop);

        info!("emergency stop cleared");
        let released = self
            .inner
            .supervisor
            .release_safe_shutdown("emergency stop cleared", None);
        debug!("released from safe shutdown: {}", released.join(", "));
        Ok(())
    }

    /// Whether an emergency stop is engaged.
    #[must_use]
    pub fn emergency_stop_active(&self) -> bool {
        self.inner.emergency_stop.read().is_some()
    }

    /// Details of the engaged emergency stop, if any.
    #[must_use]
    pub fn emergency_stop(&self) -> Option<EmergencyStopInfo> {
        self.inner.emergency_stop.read().clone()
    }

    /// Names of the currently violated interlocks.
    #[must_use]
    pub fn violated_interlocks(&self) -> Vec<String> {
        self.inner.violated.read().iter().cloned().collect()
    }

    /// The most recent forensic snapshot, if any.
    #[must_use]
    pub fn last_forensic_snapshot(&self) -> Option<ForensicSnapshot> {
        self.inner.forensics.read().back().cloned()
    }

    /// Every retained forensic snapshot, oldest first.
    #[must_use]
    pub fn forensic_snapshots(&self) -> Vec<ForensicSnapshot> {
        self.inner.forensics.read().iter().cloned().collect()
    }

    /// Recompute the violation set against the current system state and
    /// escalate when the threshold is reached.
    fn reevaluate(&self) {
        let interlocks = self.inner.interlocks.read();
        let violated: BTreeSet<String> = self.inner.system_state.read(|view| {
            interlocks
                .iter()
                .filter(|interlock| !interlock.holds(view))
                .map(|interlock| interlock.name().to_string())
                .collect()
        });
        drop(interlocks);

        let count = violated.len();
        *self.inner.violated.write() = violated;

        if count >= self.inner.options.emergency_stop_threshold && !self.emergency_stop_active() {
            let names = self.violated_interlocks().join(", ");
            self.trigger_emergency_stop(&format!(
                "{count} interlocks violated simultaneously: {names}"
            ));
        }
    }
}
