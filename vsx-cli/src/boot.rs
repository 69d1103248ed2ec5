//! `vsx boot`: start a guest under QEMU, run commands in it, shut it down.

use std::path::PathBuf;

use anyhow::Result;
use vsx::TargetConfig;

/// Arguments for `vsx boot`.
///
/// Usage: `vsx boot [OPTIONS] COMMAND...`, one shell command per argument.
#[derive(clap::Args)]
pub struct BootArgs {
    /// Kernel image.
    #[arg(long)]
    kernel: Option<PathBuf>,

    /// Root filesystem image (raw).
    #[arg(long)]
    rootfs: Option<PathBuf>,

    /// Enable KVM acceleration.
    #[arg(long)]
    kvm: bool,

    /// Guest memory in MiB.
    #[arg(short = 'm', long)]
    memory: Option<u32>,

    /// Guest context identifier.
    #[arg(long)]
    cid: Option<u32>,

    /// Extra kernel command line.
    #[arg(long, value_name = "ARGS")]
    append: Option<String>,

    /// Extra QEMU arguments, split on whitespace.
    #[arg(long, value_name = "ARGS", allow_hyphen_values = true)]
    qemu_args: Option<String>,

    /// Per-command timeout in seconds.
    #[arg(short = 't', long)]
    timeout: Option<u64>,

    /// Commands to run, in order.
    #[arg(required = true)]
    commands: Vec<String>,
}

impl BootArgs {
    fn apply(&self, config: &mut TargetConfig) {
        let vm = &mut config.vm;
        if let Some(kernel) = &self.kernel {
            vm.kernel = Some(kernel.clone());
        }
        if let Some(rootfs) = &self.rootfs {
            vm.rootfs = Some(rootfs.clone());
        }
        if let Some(memory) = self.memory {
            vm.memory_mib = memory;
        }
        vm.kvm |= self.kvm;
        if let Some(cid) = self.cid {
            config.cid = cid;
        }
    }

    #[cfg(target_os = "linux")]
    pub fn run(self, mut config: TargetConfig) -> Result<i32> {
        use std::sync::atomic::Ordering;
        use std::time::Duration;

        use anyhow::Context;
        use colored::Colorize;
        use vsx::{Guest, QemuLauncher, StartParams};

        self.apply(&mut config);

        let stop = stop_flag().context("failed to install signal handler")?;

        let launcher = QemuLauncher::new(config.vm.clone(), config.cid);
        let connector = crate::run::vsock(&config)?;
        let mut guest = Guest::from_config(&config, launcher, connector)?;

        let mut start = StartParams::default();
        start.extra_bootparams.clone_from(&self.append);
        if let Some(args) = &self.qemu_args {
            start.runqemuparams.clone_from(args);
        }
        guest.start(&start).context("failed to boot guest")?;

        let timeout = self.timeout.map(Duration::from_secs);
        let mut code = 0;
        for command in &self.commands {
            if stop.load(Ordering::Relaxed) {
                tracing::warn!("interrupted, skipping remaining commands");
                code = INTERRUPTED;
                break;
            }
            let outcome = guest.run(command, timeout);
            let status = crate::run::print_outcome(&outcome);
            let tag = if outcome.is_success() {
                "[ok]".green()
            } else {
                format!("[exit {status}]").red()
            };
            eprintln!("{tag} {command}");
            if code == 0 {
                code = status;
            }
        }

        guest.stop().context("failed to stop guest")?;
        Ok(code)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn run(self, _config: TargetConfig) -> Result<i32> {
        anyhow::bail!("booting a guest requires Linux with vhost-vsock")
    }
}

/// Exit code after SIGINT or SIGTERM, whether the guest was stopped cleanly
/// or a second signal forced the exit.
#[cfg(target_os = "linux")]
const INTERRUPTED: i32 = 130;

/// Returns a flag raised by the first SIGINT or SIGTERM.
///
/// The first signal only raises the flag, so the guest is stopped after the
/// current step. A second one exits immediately; QEMU then receives its
/// parent-death signal.
#[cfg(target_os = "linux")]
fn stop_flag() -> std::io::Result<std::sync::Arc<std::sync::atomic::AtomicBool>> {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::flag;

    let stop = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM] {
        // Registered first so it sees the flag before this signal sets it.
        flag::register_conditional_shutdown(sig, INTERRUPTED, Arc::clone(&stop))?;
        flag::register(sig, Arc::clone(&stop))?;
    }
    Ok(stop)
}
