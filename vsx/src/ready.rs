//! Readiness polling: wait for a freshly booted guest's command server.

use std::thread;
use std::time::Duration;

use crate::transport::{Connector, Endpoint};
use crate::{Error, Result};

/// Tunables for [`Poller`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PollConfig {
    /// Probes before giving up.
    pub max_attempts: u32,
    /// Timeout handed to the connector for each probe.
    pub probe_timeout: Duration,
    /// Pause after each failed probe.
    pub interval: Duration,
    /// Log progress every this many failed probes (`0` disables it).
    pub progress_every: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: 90,
            probe_timeout: Duration::from_secs(1),
            interval: Duration::from_secs(1),
            progress_every: 10,
        }
    }
}

/// Probes an endpoint until it accepts a connection.
#[derive(Debug, Clone, Default)]
pub struct Poller {
    /// Attempt budget and pacing.
    config: PollConfig,
}

impl Poller {
    /// Creates a poller with the given budget.
    pub const fn new(config: PollConfig) -> Self {
        Self { config }
    }

    /// The poller configuration.
    pub const fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Blocks until `endpoint` accepts a connection.
    ///
    /// Returns the 1-based attempt that succeeded. The probe connection is
    /// closed right away. Fails with [`Error::NotReady`] once
    /// `max_attempts` probes have failed.
    pub fn await_ready<C: Connector>(&self, connector: &C, endpoint: Endpoint) -> Result<u32> {
        tracing::info!("Waiting for command server on {endpoint}...");

        let mut attempts = 0;
        while attempts < self.config.max_attempts {
            match connector.connect(endpoint, self.config.probe_timeout) {
                Ok(probe) => {
                    drop(probe);
                    tracing::info!(attempt = attempts + 1, "command server is ready");
                    return Ok(attempts + 1);
                }
                Err(e) => tracing::trace!(attempt = attempts + 1, error = %e, "probe failed"),
            }

            attempts += 1;
            thread::sleep(self.config.interval);
            let every = self.config.progress_every;
            if every != 0 && attempts % every == 0 {
                tracing::info!("Still waiting for command server... ({attempts} attempts)");
            }
        }

        tracing::error!(%endpoint, attempts, "command server not ready");
        Err(Error::NotReady { endpoint, attempts })
    }
}
