use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A command was blocked by an interlock.
    #[error("command `{command}` against `{service}` blocked by interlock `{interlock}`: {message}")]
    InterlockViolation {
        /// The service the command targeted.
        service: String,

        /// The command that was blocked.
        command: String,

        /// The violated interlock.
        interlock: String,

        /// Why the interlock rejected the command.
        message: String,
    },

    /// An emergency stop is engaged; commands against guarded services are
    /// disabled until it is cleared.
    #[error("emergency stop active: {cause}")]
    EmergencyStopActive {
        /// Why the emergency stop was raised.
        cause: String,
    },

    /// The supplied emergency-stop authorization token is invalid.
    #[error("invalid emergency stop authorization token")]
    Authorization,

    /// No emergency stop is engaged.
    #[error("emergency stop is not active")]
    NotActive,

    /// An error occurred in the supervisor.
    #[error(transparent)]
    Supervisor(#[from] coach_supervisor::Error),
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
