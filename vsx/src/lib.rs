//! Run shell commands inside a guest VM over vsock.
//!
//! `vsx` drives a line-oriented command server inside a guest: the host opens
//! one vsock connection per command, sends the command line, and reads the
//! output until the guest's `EXIT_CODE: <n>` terminator.
//!
//! # Quick start: an already running guest
//!
//! ```no_run
//! use vsx::{Endpoint, Session, SessionConfig, VsockConnector};
//!
//! let session = Session::new(
//!     Endpoint::new(103, 5555),
//!     VsockConnector::default(),
//!     SessionConfig::default(),
//! );
//! let (status, output) = session.run("uname -a", None).into_parts();
//! println!("{status}: {output}");
//! ```
//!
//! # Booting the guest too
//!
//! ```no_run
//! use vsx::{Guest, QemuLauncher, StartParams, TargetConfig, VsockConnector};
//!
//! let config = TargetConfig::load("target.json")?;
//! let launcher = QemuLauncher::new(config.vm.clone(), config.cid);
//! let connector = VsockConnector::new(config.connect_floor());
//! let mut guest = Guest::from_config(&config, launcher, connector)?;
//!
//! guest.start(&StartParams::default())?;
//! let outcome = guest.run("cat /proc/version", None);
//! guest.stop()?;
//! # Ok::<(), vsx::Error>(())
//! ```
//!
//! Status codes: `0` success, `1..=253` the guest command's exit status,
//! [`TRANSPORT_LOST`] when the connection broke mid-response,
//! [`TRANSPORT_UNREACHABLE`] when no connection could be made.

#![cfg(unix)]

mod config;
mod error;
mod guest;
#[cfg(target_os = "linux")]
mod qemu;
mod ready;
mod session;
mod transport;

pub use config::{BootPatterns, TargetConfig, VmParams};
pub use error::{Error, Result};
pub use guest::{Guest, Launcher, PLACEHOLDER_IP, StartParams, Target, is_pid_alive};
#[cfg(target_os = "linux")]
pub use qemu::QemuLauncher;
pub use ready::{PollConfig, Poller};
pub use session::{
    Category, Outcome, Session, SessionConfig, TRANSPORT_LOST, TRANSPORT_UNREACHABLE,
};
pub use transport::{Connector, Endpoint, Stream, UnixConnector};
#[cfg(target_os = "linux")]
pub use transport::{VsockConnector, VsockStream};
