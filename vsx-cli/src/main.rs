//! CLI for running commands in a guest VM over vsock.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod boot;
mod run;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;
use vsx::TargetConfig;

#[derive(Parser)]
#[command(name = "vsx", version, about = "Run commands in a guest VM over vsock")]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file [default: <config dir>/vsx/config.json].
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command in a running guest and exit with its status.
    Run(run::RunArgs),

    /// Block until a guest's command server accepts connections.
    Wait(run::WaitArgs),

    /// Boot a guest under QEMU, run commands in it, then shut it down.
    Boot(boot::BootArgs),

    /// Print the effective configuration as JSON.
    Config,

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.dispatch() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("vsx: {e:#}");
            std::process::exit(1);
        }
    }
}

impl Cli {
    /// Runs the subcommand and returns the process exit code.
    fn dispatch(self) -> Result<i32> {
        match self.command {
            Command::Run(args) => args.run(load_config(self.config.as_deref())?),
            Command::Wait(args) => args.run(load_config(self.config.as_deref())?),
            Command::Boot(args) => args.run(load_config(self.config.as_deref())?),
            Command::Config => {
                let config = load_config(self.config.as_deref())?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(0)
            }
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "vsx", &mut std::io::stdout());
                Ok(0)
            }
        }
    }
}

/// Installs the stderr log subscriber.
fn init_logging(verbose: bool) {
    let fallback = if verbose { "vsx=debug" } else { "vsx=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Loads `path`, or the per-user config file when it exists, or defaults.
fn load_config(path: Option<&Path>) -> Result<TargetConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match dirs::config_dir().map(|d| d.join("vsx").join("config.json")) {
            Some(p) if p.is_file() => p,
            _ => return Ok(TargetConfig::default()),
        },
    };
    tracing::debug!(path = %path.display(), "loading configuration");
    TargetConfig::load(&path).with_context(|| format!("failed to load {}", path.display()))
}
