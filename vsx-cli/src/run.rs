//! `vsx run` and `vsx wait`: talk to a guest that is already up.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use colored::Colorize;
use vsx::{Category, Connector, Outcome, Poller, Session, TargetConfig, UnixConnector};

/// Where to reach the guest. Flags override the configuration file.
#[derive(clap::Args)]
pub struct TargetArgs {
    /// Guest context identifier.
    #[arg(long)]
    cid: Option<u32>,

    /// Guest command server port.
    #[arg(long)]
    port: Option<u32>,

    /// Reach the guest through a Unix socket mapped to its port instead of vsock.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,
}

impl TargetArgs {
    fn apply(&self, config: &mut TargetConfig) {
        if let Some(cid) = self.cid {
            config.cid = cid;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}

/// Arguments for `vsx run`.
///
/// Usage: `vsx run [OPTIONS] COMMAND [ARG...]`
#[derive(clap::Args)]
#[command(trailing_var_arg = true)]
pub struct RunArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Command timeout in seconds; values below the configured floor are raised.
    #[arg(short = 't', long)]
    timeout: Option<u64>,

    /// Command line to run in the guest shell.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

impl RunArgs {
    /// The command as the guest shell will see it.
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    pub fn run(self, mut config: TargetConfig) -> Result<i32> {
        self.target.apply(&mut config);
        let timeout = self.timeout.map(Duration::from_secs);
        let command = self.command_line();

        let outcome = match &self.target.socket {
            Some(path) => session(&config, UnixConnector::new(path)).run(&command, timeout),
            None => session(&config, vsock(&config)?).run(&command, timeout),
        };
        Ok(print_outcome(&outcome))
    }
}

/// Arguments for `vsx wait`.
#[derive(clap::Args)]
pub struct WaitArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Probes before giving up, one per second.
    #[arg(long)]
    attempts: Option<u32>,
}

impl WaitArgs {
    pub fn run(self, mut config: TargetConfig) -> Result<i32> {
        self.target.apply(&mut config);
        if let Some(attempts) = self.attempts {
            config.ready_attempts = attempts;
        }

        let poller = Poller::new(config.poll_config());
        let endpoint = config.endpoint();
        let attempts = match &self.target.socket {
            Some(path) => poller.await_ready(&UnixConnector::new(path), endpoint)?,
            None => poller.await_ready(&vsock(&config)?, endpoint)?,
        };
        println!("{} after {attempts} attempt(s)", "ready".green());
        Ok(0)
    }
}

fn session<C: Connector>(config: &TargetConfig, connector: C) -> Session<C> {
    Session::new(config.endpoint(), connector, config.session_config())
}

#[cfg(target_os = "linux")]
pub(crate) fn vsock(config: &TargetConfig) -> Result<vsx::VsockConnector> {
    Ok(vsx::VsockConnector::new(config.connect_floor()))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn vsock(_config: &TargetConfig) -> Result<UnixConnector> {
    anyhow::bail!("vsock requires Linux; pass --socket to use a mapped Unix socket")
}

/// Writes the guest output to stdout, transport errors to stderr, and
/// returns the status to exit with.
pub(crate) fn print_outcome(outcome: &Outcome) -> i32 {
    match outcome.category {
        Category::TransportLost | Category::TransportUnreachable => {
            eprintln!("{}", outcome.output.red());
        }
        _ if !outcome.output.is_empty() => println!("{}", outcome.output),
        _ => {}
    }
    outcome.status
}
