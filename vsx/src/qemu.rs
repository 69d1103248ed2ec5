//! QEMU launcher with a `vhost-vsock-pci` device for the guest.
//!
//! The serial console goes to the boot log; [`QemuLauncher::start`] watches
//! that file for the boot prompt pattern to decide whether the guest came up.

#![allow(unsafe_code)]

use std::fs;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::config::{BootPatterns, VmParams};
use crate::guest::{Launcher, StartParams};
use crate::{Error, Result};

/// How often the boot log is re-read while waiting for the prompt.
const BOOT_POLL: Duration = Duration::from_millis(200);

/// Grace period between `SIGTERM` and `SIGKILL` on stop.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Launches a guest under QEMU.
///
/// QEMU gets `SIGTERM` when the thread that started it exits, so start and
/// stop the guest from a thread that outlives it.
#[derive(Debug)]
pub struct QemuLauncher {
    /// Machine parameters; boot patterns already carry the vsock overrides.
    params: VmParams,
    /// Guest CID assigned to the vsock device.
    cid: u32,
    /// Guest address reported to callers.
    ip: Option<String>,
    /// The running QEMU process.
    child: Option<Child>,
}

impl QemuLauncher {
    /// Creates a launcher for a guest with vsock context id `cid`.
    pub fn new(mut params: VmParams, cid: u32) -> Self {
        params.boot_patterns = params.boot_patterns.for_vsock();
        Self {
            params,
            cid,
            ip: None,
            child: None,
        }
    }

    /// Machine parameters in effect.
    pub const fn params(&self) -> &VmParams {
        &self.params
    }

    /// The guest address set through [`Launcher::set_ip`].
    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    /// Builds the QEMU argument list.
    pub fn args(&self, start: &StartParams) -> Vec<String> {
        let p = &self.params;
        let mut args: Vec<String> = Vec::new();
        let mut push = |a: &str, b: String| {
            args.push(a.to_owned());
            args.push(b);
        };

        if !p.machine.is_empty() {
            push("-machine", p.machine.clone());
        }
        push("-m", format!("{}M", p.memory_mib));
        if let Some(kernel) = &p.kernel {
            push("-kernel", kernel.display().to_string());
        }
        if let Some(rootfs) = &p.rootfs {
            push(
                "-drive",
                format!("file={},if=virtio,format=raw", rootfs.display()),
            );
        }
        if let Some(ovmf) = &p.ovmf {
            push("-bios", ovmf.display().to_string());
        }
        push("-display", p.display.clone());
        match &p.bootlog {
            Some(log) => push("-serial", format!("file:{}", log.display())),
            None => push("-serial", "null".into()),
        }
        for _ in 1..p.serial_ports {
            push("-serial", "null".into());
        }
        if p.slirp {
            push("-netdev", "user,id=net0".into());
            push("-device", "virtio-net-pci,netdev=net0".into());
        } else {
            push("-nic", "none".into());
        }
        push("-device", format!("vhost-vsock-pci,guest-cid={}", self.cid));
        if let Some(append) = start.extra_bootparams.as_deref().filter(|s| !s.is_empty()) {
            push("-append", append.to_owned());
        }

        if p.kvm {
            args.push("-enable-kvm".into());
        }
        args.push("-no-reboot".into());
        for extra in [start.params.as_deref().unwrap_or(""), &start.runqemuparams] {
            args.extend(extra.split_whitespace().map(str::to_owned));
        }
        args
    }

    /// Waits for the boot prompt in the boot log.
    ///
    /// Without a boot log or prompt pattern there is nothing to watch, and a
    /// running process counts as booted.
    fn wait_for_boot(&mut self) -> Result<bool> {
        let pattern = self
            .params
            .boot_patterns
            .get(BootPatterns::REACHED_PROMPT)
            .unwrap_or_default()
            .to_owned();
        let log = self.params.bootlog.clone();
        let deadline = Instant::now() + self.params.boottime();

        loop {
            if let Some(child) = &mut self.child {
                if let Some(status) = child.try_wait()? {
                    tracing::warn!(%status, "QEMU exited during boot");
                    self.child = None;
                    return Ok(false);
                }
            }
            let Some(log) = log.as_deref().filter(|_| !pattern.is_empty()) else {
                return Ok(true);
            };
            if log_contains(log, &pattern) {
                tracing::info!(pattern = %pattern, "reached boot prompt");
                return Ok(true);
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    pattern = %pattern,
                    boottime_secs = self.params.boottime_secs,
                    "boot prompt not seen"
                );
                return Ok(false);
            }
            thread::sleep(BOOT_POLL);
        }
    }
}

/// Returns `true` if `path` exists and contains `pattern`.
fn log_contains(path: &Path, pattern: &str) -> bool {
    fs::read(path).is_ok_and(|data| {
        data.windows(pattern.len())
            .any(|w| w == pattern.as_bytes())
    })
}

impl Launcher for QemuLauncher {
    fn set_ip(&mut self, ip: &str) {
        self.ip = Some(ip.to_owned());
    }

    fn start(&mut self, start: &StartParams) -> Result<bool> {
        if self.child.is_some() {
            return Err(Error::Launch("QEMU is already running".into()));
        }
        if let Some(log) = &self.params.bootlog {
            // Stale output from a previous boot must not match the prompt.
            fs::File::create(log)?;
        }

        let mut cmd = Command::new(&self.params.qemu);
        cmd.args(self.args(start))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &self.params.tmpdir {
            cmd.current_dir(dir);
        }
        // QEMU must not outlive a host process that exits without `stop`.
        // SAFETY: prctl(2) is async-signal-safe and runs in the child before exec.
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        tracing::info!(qemu = %self.params.qemu, cid = self.cid, "launching QEMU");
        let child = cmd
            .spawn()
            .map_err(|e| Error::Launch(format!("failed to spawn {}: {e}", self.params.qemu)))?;
        tracing::debug!(pid = child.id(), "QEMU spawned");
        self.child = Some(child);

        self.wait_for_boot()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        match terminate(&child) {
            Ok(()) => {
                let deadline = Instant::now() + STOP_GRACE;
                while Instant::now() < deadline {
                    if child.try_wait()?.is_some() {
                        return Ok(());
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                tracing::warn!(pid = child.id(), "QEMU ignored SIGTERM, killing");
            }
            Err(e) => tracing::debug!(pid = child.id(), error = %e, "SIGTERM failed, killing"),
        }
        child.kill()?;
        child.wait()?;
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }
}

/// Sends `SIGTERM` to `child`.
fn terminate(child: &Child) -> nix::Result<()> {
    let pid = i32::try_from(child.id()).map_err(|_| nix::errno::Errno::ESRCH)?;
    signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
}

impl Drop for QemuLauncher {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "failed to stop QEMU on drop");
        }
    }
}
