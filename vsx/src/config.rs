//! Target configuration and its JSON representation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::ready::PollConfig;
use crate::session::SessionConfig;
use crate::transport::Endpoint;

/// Serial-console patterns the launcher watches during boot.
///
/// Keys follow the launcher's naming (`search_reached_prompt`,
/// `search_login_succeeded`, `send_login_user`, ...). Unknown keys are kept
/// and passed through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BootPatterns(pub BTreeMap<String, String>);

impl BootPatterns {
    /// Pattern marking that the guest reached its shell prompt.
    pub const REACHED_PROMPT: &'static str = "search_reached_prompt";
    /// Pattern marking a completed login.
    pub const LOGIN_SUCCEEDED: &'static str = "search_login_succeeded";
    /// User name sent at the login prompt.
    pub const LOGIN_USER: &'static str = "send_login_user";

    /// Looks up a pattern by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns a copy with the overrides the vsock target needs: the guest
    /// has no login prompt, and its banner marks a finished boot.
    #[must_use]
    pub fn for_vsock(&self) -> Self {
        let mut patterns = self.clone();
        for (key, value) in [
            (Self::REACHED_PROMPT, "StarryOS"),
            (Self::LOGIN_SUCCEEDED, "root@starry"),
            (Self::LOGIN_USER, ""),
        ] {
            patterns.0.insert(key.to_owned(), value.to_owned());
        }
        patterns
    }
}

/// Virtualization parameters forwarded verbatim to the VM launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct VmParams {
    /// QEMU binary.
    pub qemu: String,
    /// Value for `-machine`; empty leaves QEMU's default.
    pub machine: String,
    /// Root filesystem image.
    pub rootfs: Option<PathBuf>,
    /// Kernel image.
    pub kernel: Option<PathBuf>,
    /// Guest memory in MiB.
    pub memory_mib: u32,
    /// Enable KVM acceleration.
    pub kvm: bool,
    /// Enable user-mode (slirp) networking.
    pub slirp: bool,
    /// Value for `-display`.
    pub display: String,
    /// File receiving the guest serial console.
    pub bootlog: Option<PathBuf>,
    /// How long to wait for the boot prompt, in seconds.
    pub boottime_secs: u64,
    /// Number of serial ports to create.
    pub serial_ports: u32,
    /// UEFI firmware image; `None` boots the kernel directly.
    pub ovmf: Option<PathBuf>,
    /// Working directory for the QEMU process.
    pub tmpdir: Option<PathBuf>,
    /// Directory for diagnostic dumps.
    pub dump_dir: Option<PathBuf>,
    /// Boot console patterns.
    pub boot_patterns: BootPatterns,
}

impl Default for VmParams {
    fn default() -> Self {
        Self {
            qemu: "qemu-system-x86_64".into(),
            machine: String::new(),
            rootfs: None,
            kernel: None,
            memory_mib: 512,
            kvm: false,
            slirp: false,
            display: "none".into(),
            bootlog: None,
            boottime_secs: 60,
            serial_ports: 2,
            ovmf: None,
            tmpdir: None,
            dump_dir: None,
            boot_patterns: BootPatterns::default(),
        }
    }
}

impl VmParams {
    /// Boot prompt wait as a [`Duration`].
    pub const fn boottime(&self) -> Duration {
        Duration::from_secs(self.boottime_secs)
    }

    /// Creates the dump subdirectories (`qmp`, `qemu`) when a dump directory
    /// is configured.
    pub fn prepare_dump_dirs(&self) -> Result<()> {
        if let Some(dir) = &self.dump_dir {
            for sub in ["qmp", "qemu"] {
                fs::create_dir_all(dir.join(sub))?;
            }
        }
        Ok(())
    }
}

/// Everything needed to reach, and optionally boot, a guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct TargetConfig {
    /// Guest context identifier.
    pub cid: u32,
    /// Guest command server port.
    pub port: u32,
    /// Default command timeout, in seconds.
    pub timeout_secs: u64,
    /// Floor for command timeouts, in seconds.
    pub min_timeout_secs: u64,
    /// Floor for vsock connect timeouts, in seconds.
    pub connect_floor_secs: u64,
    /// Connection attempts per command.
    pub connect_retries: u32,
    /// Readiness probes after boot (one per second).
    pub ready_attempts: u32,
    /// VM launcher parameters.
    pub vm: VmParams,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            cid: vsx_proto::DEFAULT_CID,
            port: vsx_proto::AGENT_PORT,
            timeout_secs: 300,
            min_timeout_secs: 10,
            connect_floor_secs: 5,
            connect_retries: 3,
            ready_attempts: 90,
            vm: VmParams::default(),
        }
    }
}

impl TargetConfig {
    /// Loads a configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// The guest endpoint.
    pub const fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.cid, self.port)
    }

    /// Floor for vsock connect timeouts.
    pub const fn connect_floor(&self) -> Duration {
        Duration::from_secs(self.connect_floor_secs)
    }

    /// Command session settings derived from this configuration.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            default_timeout: Duration::from_secs(self.timeout_secs),
            min_timeout: Duration::from_secs(self.min_timeout_secs),
            connect_retries: self.connect_retries,
            ..SessionConfig::default()
        }
    }

    /// Readiness poller settings derived from this configuration.
    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            max_attempts: self.ready_attempts,
            ..PollConfig::default()
        }
    }
}
