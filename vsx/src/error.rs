//! Error types for vsx operations.

use crate::transport::Endpoint;

/// Alias for `Result<T, vsx::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by vsx lifecycle and configuration operations.
///
/// Command execution never fails with an `Error`: transport problems during
/// a command are reported through [`Outcome`](crate::Outcome) status codes.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The VM launcher failed and the guest process is not running.
    #[error("failed to start guest: {0}")]
    Launch(String),

    /// The readiness poller ran out of attempts.
    #[error("no command server on {endpoint} after {attempts} attempts")]
    NotReady {
        /// The guest endpoint that was probed.
        endpoint: Endpoint,
        /// Number of failed probes.
        attempts: u32,
    },

    /// The guest booted but its command server never became reachable.
    /// The guest has been stopped.
    #[error("bootstrap failed: no command server on {endpoint} after {attempts} attempts; is the guest command server running?")]
    Bootstrap {
        /// The guest endpoint that was probed.
        endpoint: Endpoint,
        /// Number of failed probes.
        attempts: u32,
    },

    /// A configuration file could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// An I/O error from the launcher, transport, or filesystem.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
