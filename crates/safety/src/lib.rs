//! Safety interlock engine for the coach-node control plane.
//!
//! Evaluates named safety preconditions against a shared snapshot of vehicle
//! state, blocks commands against position-critical services while any
//! matching interlock is violated, and escalates to a system-wide emergency
//! stop when too many interlocks are violated at once.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod interlock;
mod state;

pub use error::{Error, Result};
pub use interlock::{
    EmergencyStopInfo, ForensicSnapshot, Interlock, InterlockEngine, InterlockEngineOptions,
    standard_interlocks,
};
pub use state::{StateValue, StateView, SystemState, keys};
