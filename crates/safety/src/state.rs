use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Well-known system-state keys, shared between state reporters and interlock
/// predicates so both sides agree on spelling.
pub mod keys {
    /// Parking brake engaged.
    pub const PARKING_BRAKE_ENGAGED: &str = "parking_brake_engaged";

    /// Vehicle speed in km/h.
    pub const VEHICLE_SPEED: &str = "vehicle_speed";

    /// All slide-outs fully retracted.
    pub const SLIDES_RETRACTED: &str = "slides_retracted";

    /// Any leveling jack deployed.
    pub const JACKS_DEPLOYED: &str = "jacks_deployed";

    /// Engine running.
    pub const ENGINE_RUNNING: &str = "engine_running";
}

/// One named fact about the controlled vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    /// A boolean fact, e.g. parking brake engaged.
    Bool(bool),

    /// A numeric fact, e.g. vehicle speed.
    Number(f64),
}

/// Consistent view of the system state for one predicate evaluation.
///
/// Borrowed from under the state lock, so every key read through one view
/// observes the same snapshot.
pub struct StateView<'a> {
    values: &'a HashMap<String, StateValue>,
}

impl StateView<'_> {
    /// A boolean fact, if present and boolean.
    #[must_use]
    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(StateValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    /// A numeric fact, if present and numeric.
    #[must_use]
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.values.get(key) {
            Some(StateValue::Number(value)) => Some(*value),
            _ => None,
        }
    }
}

/// Shared snapshot of named facts about the controlled vehicle.
///
/// Mutated by external state reporters, read by interlock evaluation. Writers
/// and readers may run concurrently; a predicate evaluating through
/// [`SystemState::read`] never observes a torn multi-key state.
#[derive(Clone)]
pub struct SystemState {
    values: Arc<RwLock<HashMap<String, StateValue>>>,
}

impl SystemState {
    /// The safe baseline: stationary, braked, stabilized, nothing deployed.
    ///
    /// This is the mandatory initial state. An empty or all-false snapshot
    /// would itself read as a violation before the first reporter update.
    #[must_use]
    pub fn safe_baseline() -> Self {
        let values = HashMap::from([
            (keys::PARKING_BRAKE_ENGAGED.to_string(), StateValue::Bool(true)),
            (keys::VEHICLE_SPEED.to_string(), StateValue::Number(0.0)),
            (keys::SLIDES_RETRACTED.to_string(), StateValue::Bool(true)),
            (keys::JACKS_DEPLOYED.to_string(), StateValue::Bool(false)),
            (keys::ENGINE_RUNNING.to_string(), StateValue::Bool(false)),
        ]);
        Self {
            values: Arc::new(RwLock::new(values)),
        }
    }

    /// Set one fact.
    pub fn set(&self, key: impl Into<String>, value: StateValue) {
        self.values.write().insert(key.into(), value);
    }

    /// Get one fact.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<StateValue> {
        self.values.read().get(key).copied()
    }

    /// Evaluate `f` against a consistent view of the whole state.
    pub fn read<R>(&self, f: impl FnOnce(&StateView<'_>) -> R) -> R {
        let values = self.values.read();
        f(&StateView { values: &values })
    }

    /// Copy of the full state, for forensic capture.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, StateValue> {
        self.values
            .read()
            .iter()
            .map(|(key, value)| (key.clone(), *value))
            .collect()
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::safe_baseline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_is_safe_not_all_false() {
        let state = SystemState::safe_baseline();
        assert_eq!(
            state.get(keys::PARKING_BRAKE_ENGAGED),
            Some(StateValue::Bool(true))
        );
        assert_eq!(state.get(keys::VEHICLE_SPEED), Some(StateValue::Number(0.0)));
        assert_eq!(state.get(keys::SLIDES_RETRACTED), Some(StateValue::Bool(true)));
    }

    #[test]
    fn test_view_reads_are_typed() {
        let state = SystemState::safe_baseline();
        state.set(keys::VEHICLE_SPEED, StateValue::Number(12.5));
        state.read(|view| {
            assert_eq!(view.number(keys::VEHICLE_SPEED), Some(12.5));
            assert_eq!(view.flag(keys::VEHICLE_SPEED), None);
            assert_eq!(view.flag("unknown"), None);
        });
    }
}
