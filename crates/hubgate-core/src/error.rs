//! Errors for the admission engine.

use crate::api::Priority;

/// Errors raised while building a [`Limiter`](crate::Limiter).
///
/// `acquire` never fails; every error here is a construction-time problem.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A bucket capacity of zero would never admit anything.
    #[error("invalid capacity for {scope}: {capacity}. Capacity must be greater than zero.")]
    InvalidCapacity {
        /// Which bucket was misconfigured (`shared` or a priority).
        scope: String,
        /// The rejected capacity.
        capacity: u32,
    },

    /// A window must be a finite, positive number of seconds.
    #[error("invalid window for {scope}: {seconds}s. Window must be finite and positive.")]
    InvalidWindow {
        /// Which window was misconfigured.
        scope: String,
        /// The rejected length in seconds.
        seconds: f64,
    },

    /// Floor policy is inconsistent (e.g. `floor_window` without `min_calls`).
    #[error("invalid floor policy for {priority}: {reason}")]
    InvalidFloor {
        /// Priority carrying the policy.
        priority: Priority,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// An environment override could not be parsed.
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Raw value found in the environment.
        value: String,
    },

    /// The dispatcher thread could not be started.
    #[error("failed to spawn dispatcher thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Faults found while evaluating a single priority during a dispatch cycle.
///
/// These never escape the dispatcher; they are logged and the priority is
/// skipped until the next cycle.
#[derive(Debug, thiserror::Error)]
pub(crate) enum DispatchError {
    #[error("ticket {ticket} of {priority} carries generation {found}, ahead of current {current}")]
    GenerationAhead {
        priority: Priority,
        ticket: u64,
        found: u64,
        current: u64,
    },
}
