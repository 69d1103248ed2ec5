//! Command execution against a guest command server.
//!
//! One command occupies one connection: connect (with bounded retries), send
//! the command line, accumulate the response until the `EXIT_CODE:`
//! terminator arrives or the guest closes the stream, then classify.

use std::io::{self, Read};
use std::thread;
use std::time::{Duration, Instant};

use vsx_proto::{Framed, SENTINEL, contains_sentinel, decode_text};

use crate::transport::{Connector, Endpoint, Stream};

/// Status reported when the connection died before the terminator arrived.
pub const TRANSPORT_LOST: i32 = 254;

/// Status reported when no connection could be established.
pub const TRANSPORT_UNREACHABLE: i32 = 255;

/// Tunables for [`Session`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Timeout used when the caller does not pass one.
    pub default_timeout: Duration,
    /// Floor applied to every command timeout.
    pub min_timeout: Duration,
    /// Connection attempts before giving up.
    pub connect_retries: u32,
    /// Pause between connection attempts.
    pub retry_delay: Duration,
    /// Pause after a would-block read before trying again.
    pub retry_yield: Duration,
    /// Read buffer size.
    pub chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            min_timeout: Duration::from_secs(10),
            connect_retries: 3,
            retry_delay: Duration::from_secs(1),
            retry_yield: Duration::from_millis(100),
            chunk_size: 4096,
        }
    }
}

impl SessionConfig {
    /// Applies the default and the floor to a caller-supplied timeout.
    pub fn effective_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout
            .unwrap_or(self.default_timeout)
            .max(self.min_timeout)
    }
}

/// How a command invocation ended, from the transport's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Category {
    /// The guest reported status 0.
    None,
    /// The guest reported a nonzero status.
    CommandNonzero,
    /// The connection broke before the terminator was seen.
    TransportLost,
    /// No connection could be established.
    TransportUnreachable,
}

/// Result of running one command.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Outcome {
    /// `0` on success, the guest's exit status, [`TRANSPORT_LOST`] or
    /// [`TRANSPORT_UNREACHABLE`].
    pub status: i32,
    /// Command output, or an `ERROR:` explanation for transport failures.
    pub output: String,
    /// Failure classification.
    pub category: Category,
}

impl Outcome {
    /// A response the guest finished, terminated or not.
    fn completed(status: i32, output: String) -> Self {
        let category = if status == 0 {
            Category::None
        } else {
            Category::CommandNonzero
        };
        Self {
            status,
            output,
            category,
        }
    }

    /// The connection broke mid-command.
    fn lost(detail: &str, partial: &str) -> Self {
        Self {
            status: TRANSPORT_LOST,
            output: format!("ERROR: {detail}\nPartial output: {partial}"),
            category: Category::TransportLost,
        }
    }

    /// Every connection attempt failed.
    fn unreachable(retries: u32) -> Self {
        Self {
            status: TRANSPORT_UNREACHABLE,
            output: format!("ERROR: Failed to connect to vsock after {retries} retries"),
            category: Category::TransportUnreachable,
        }
    }

    /// Returns `true` if the guest reported status 0.
    pub fn is_success(&self) -> bool {
        self.category == Category::None
    }

    /// Returns `(status, output)`.
    pub fn into_parts(self) -> (i32, String) {
        (self.status, self.output)
    }
}

/// Why the receive loop stopped.
#[derive(Debug)]
enum Ended {
    /// The sentinel showed up in the accumulated bytes.
    Sentinel,
    /// The guest closed the stream.
    Closed,
    /// The command timeout expired.
    TimedOut,
    /// The connection broke; carries a human-readable detail.
    Lost(String),
}

/// Runs commands on one guest endpoint.
#[derive(Debug)]
pub struct Session<C> {
    /// Guest command server address; fixed for the session's lifetime.
    endpoint: Endpoint,
    /// Opens a fresh stream per command.
    connector: C,
    /// Timeouts and retry policy.
    config: SessionConfig,
}

impl<C: Connector> Session<C> {
    /// Creates a session for `endpoint`.
    pub const fn new(endpoint: Endpoint, connector: C, config: SessionConfig) -> Self {
        Self {
            endpoint,
            connector,
            config,
        }
    }

    /// The guest endpoint.
    pub const fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// The connector used for every command.
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// The session configuration.
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Runs `command` in the guest and waits for its result.
    ///
    /// Never fails: transport problems come back as [`TRANSPORT_LOST`] or
    /// [`TRANSPORT_UNREACHABLE`] outcomes with an explanation in the output.
    /// A send that fails after connecting is reported as [`TRANSPORT_LOST`].
    pub fn run(&self, command: &str, timeout: Option<Duration>) -> Outcome {
        let timeout = self.config.effective_timeout(timeout);
        tracing::debug!("[Running]$ {command}");
        let start = Instant::now();

        let outcome = match self.acquire(timeout) {
            Some(mut stream) => self.exchange(&mut stream, command, timeout),
            None => Outcome::unreachable(self.config.connect_retries),
        };

        tracing::debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "[Command returned '{}' after {:.2}s]",
            outcome.status,
            start.elapsed().as_secs_f64()
        );
        outcome
    }

    /// Connects, retrying up to `connect_retries` times.
    fn acquire(&self, timeout: Duration) -> Option<C::Stream> {
        let retries = self.config.connect_retries;
        for attempt in 1..=retries {
            match self.connector.connect(self.endpoint, timeout) {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        error = %e,
                        "Connection failed, retry {attempt}/{retries}..."
                    );
                    if attempt < retries {
                        thread::sleep(self.config.retry_delay);
                    }
                }
            }
        }
        None
    }

    /// Sends the command and turns the response into an [`Outcome`].
    ///
    /// The stream is owned by the caller and closed when it drops.
    fn exchange(&self, stream: &mut C::Stream, command: &str, timeout: Duration) -> Outcome {
        if let Err(e) = vsx_proto::encode_request(stream, command) {
            let detail = format!("Connection lost: {e}");
            tracing::error!(endpoint = %self.endpoint, "{detail}");
            return Outcome::lost(&detail, "");
        }

        let (raw, ended) = self.receive(stream, timeout);

        // A broken stream without a terminator must never read as success.
        if let Ended::Lost(detail) = &ended {
            if !contains_sentinel(&raw) {
                return Outcome::lost(detail, &decode_text(&raw));
            }
        }

        let framed = Framed::decode(&raw);
        if !framed.terminated {
            tracing::debug!(endpoint = %self.endpoint, ?ended, "response had no status line, assuming success");
        }
        Outcome::completed(framed.status, framed.text)
    }

    /// Reads until the sentinel, EOF, timeout, or a transport error.
    fn receive(&self, stream: &mut C::Stream, timeout: Duration) -> (Vec<u8>, Ended) {
        let deadline = Instant::now() + timeout;
        let mut raw = Vec::new();
        let mut chunk = vec![0u8; self.config.chunk_size.max(1)];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(endpoint = %self.endpoint, "Socket timeout while receiving");
                return (raw, Ended::TimedOut);
            }
            if let Err(e) = stream.set_read_timeout(Some(remaining)) {
                return (raw, self.lost(&e));
            }

            match stream.read(&mut chunk) {
                Ok(0) => return (raw, Ended::Closed),
                Ok(n) => {
                    raw.extend_from_slice(&chunk[..n]);
                    // Only the new bytes plus a sentinel-sized overlap can match.
                    let from = raw.len().saturating_sub(n + SENTINEL.len() - 1);
                    if contains_sentinel(&raw[from..]) {
                        return (raw, Ended::Sentinel);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.config.retry_yield.min(remaining));
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    tracing::warn!(endpoint = %self.endpoint, "Socket timeout while receiving");
                    return (raw, Ended::TimedOut);
                }
                Err(e) => return (raw, self.lost(&e)),
            }
        }
    }

    /// Classifies a fatal receive error and logs it.
    fn lost(&self, e: &io::Error) -> Ended {
        let detail = match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => format!("Connection lost: {e}"),
            _ => format!("Connection lost: unexpected error: {e}"),
        };
        tracing::error!(endpoint = %self.endpoint, "{detail}");
        Ended::Lost(detail)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::io::Write;
    use std::rc::Rc;

    use super::*;

    /// One step of a scripted guest response.
    pub(crate) enum Step {
        Data(&'static [u8]),
        Fail(io::ErrorKind),
    }

    /// In-memory stream replaying a script; EOF once the script runs out.
    pub(crate) struct Scripted {
        steps: VecDeque<Step>,
        sent: Rc<RefCell<Vec<u8>>>,
        write_error: Option<io::ErrorKind>,
        timeouts: Rc<RefCell<Vec<Duration>>>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.steps.pop_front() {
                None => Ok(0),
                Some(Step::Data(d)) => {
                    buf[..d.len()].copy_from_slice(d);
                    Ok(d.len())
                }
                Some(Step::Fail(kind)) => Err(io::Error::new(kind, "scripted")),
            }
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.write_error {
                return Err(io::Error::from(kind));
            }
            self.sent.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Stream for Scripted {
        fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            self.timeouts.borrow_mut().extend(timeout);
            Ok(())
        }
    }

    /// Connector that fails a fixed number of times, then hands out a script.
    #[derive(Default)]
    pub(crate) struct ScriptedConnector {
        pub(crate) failures: Cell<u32>,
        pub(crate) attempts: Cell<u32>,
        pub(crate) script: RefCell<Vec<Step>>,
        pub(crate) write_error: Option<io::ErrorKind>,
        pub(crate) sent: Rc<RefCell<Vec<u8>>>,
        pub(crate) timeouts: Rc<RefCell<Vec<Duration>>>,
        pub(crate) connect_timeouts: RefCell<Vec<Duration>>,
    }

    impl ScriptedConnector {
        pub(crate) fn replying(steps: Vec<Step>) -> Self {
            Self {
                script: RefCell::new(steps),
                ..Self::default()
            }
        }

        pub(crate) fn failing(times: u32) -> Self {
            Self {
                failures: Cell::new(times),
                ..Self::default()
            }
        }
    }

    impl Connector for ScriptedConnector {
        type Stream = Scripted;

        fn connect(&self, _endpoint: Endpoint, timeout: Duration) -> io::Result<Scripted> {
            self.attempts.set(self.attempts.get() + 1);
            self.connect_timeouts.borrow_mut().push(timeout);
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err(io::ErrorKind::ConnectionRefused.into());
            }
            Ok(Scripted {
                steps: self.script.take().into(),
                sent: Rc::clone(&self.sent),
                write_error: self.write_error,
                timeouts: Rc::clone(&self.timeouts),
            })
        }
    }

    fn fast() -> SessionConfig {
        SessionConfig {
            retry_delay: Duration::ZERO,
            retry_yield: Duration::from_millis(1),
            ..SessionConfig::default()
        }
    }

    fn session(connector: ScriptedConnector) -> Session<ScriptedConnector> {
        Session::new(Endpoint::default(), connector, fast())
    }

    #[test]
    fn success_strips_terminator() {
        let s = session(ScriptedConnector::replying(vec![Step::Data(
            b"hi\nEXIT_CODE: 0\n",
        )]));
        let out = s.run("echo hi", None);
        assert_eq!(out.status, 0);
        assert_eq!(out.output, "hi");
        assert_eq!(out.category, Category::None);
        assert!(out.is_success());
        assert_eq!(&*s.connector().sent.borrow(), b"echo hi\n");
    }

    #[test]
    fn guest_exit_codes_pass_through() {
        for (raw, code) in [
            (&b"x\nEXIT_CODE: 1\n"[..], 1),
            (&b"x\nEXIT_CODE: 127\n"[..], 127),
            (&b"x\nEXIT_CODE: 253\n"[..], 253),
        ] {
            let s = session(ScriptedConnector::replying(vec![Step::Data(raw)]));
            let (status, output) = s.run("false", None).into_parts();
            assert_eq!(status, code);
            assert_eq!(output, "x");
        }
    }

    #[test]
    fn nonzero_status_is_command_failure() {
        let s = session(ScriptedConnector::replying(vec![Step::Data(
            b"EXIT_CODE: 2\n",
        )]));
        let out = s.run("ls /nope", None);
        assert_eq!(out.category, Category::CommandNonzero);
        assert!(!out.is_success());
    }

    #[test]
    fn response_split_across_reads() {
        let s = session(ScriptedConnector::replying(vec![
            Step::Data(b"a\nb"),
            Step::Data(b"\nEXIT_"),
            Step::Data(b"CODE: 5\n"),
        ]));
        let out = s.run("cmd", None);
        assert_eq!(out.status, 5);
        assert_eq!(out.output, "a\nb");
    }

    #[test]
    fn unreachable_after_retries_without_sending() {
        let s = session(ScriptedConnector::failing(3));
        let out = s.run("echo hi", None);
        assert_eq!(out.status, TRANSPORT_UNREACHABLE);
        assert_eq!(out.category, Category::TransportUnreachable);
        assert!(out.output.starts_with("ERROR:"));
        assert!(out.output.contains("Failed to connect"));
        assert_eq!(s.connector().attempts.get(), 3);
        assert!(s.connector().sent.borrow().is_empty());
    }

    #[test]
    fn transient_connect_failure_is_absorbed() {
        let c = ScriptedConnector {
            failures: Cell::new(2),
            script: RefCell::new(vec![Step::Data(b"ok\nEXIT_CODE: 0\n")]),
            ..ScriptedConnector::default()
        };
        let s = session(c);
        let out = s.run("true", None);
        assert_eq!(out.status, 0);
        assert_eq!(out.output, "ok");
        assert_eq!(s.connector().attempts.get(), 3);
    }

    #[test]
    fn reset_before_terminator_is_transport_lost() {
        let s = session(ScriptedConnector::replying(vec![
            Step::Data(b"partial"),
            Step::Fail(io::ErrorKind::ConnectionReset),
        ]));
        let out = s.run("crash", None);
        assert_eq!(out.status, TRANSPORT_LOST);
        assert_eq!(out.category, Category::TransportLost);
        assert!(out.output.starts_with("ERROR: Connection lost"));
        assert!(out.output.contains("Partial output: partial"));
    }

    #[test]
    fn broken_pipe_and_unexpected_errors_are_transport_lost() {
        for kind in [io::ErrorKind::BrokenPipe, io::ErrorKind::InvalidData] {
            let s = session(ScriptedConnector::replying(vec![Step::Fail(kind)]));
            let out = s.run("crash", None);
            assert_eq!(out.status, TRANSPORT_LOST);
            assert!(out.output.contains("Connection lost"));
        }
    }

    #[test]
    fn failed_send_is_transport_lost() {
        let c = ScriptedConnector {
            write_error: Some(io::ErrorKind::BrokenPipe),
            ..ScriptedConnector::default()
        };
        let out = session(c).run("echo hi", None);
        assert_eq!(out.status, TRANSPORT_LOST);
        assert!(out.output.contains("Connection lost"));
    }

    #[test]
    fn clean_close_without_terminator_is_permissive() {
        let s = session(ScriptedConnector::replying(vec![Step::Data(
            b"no terminator here\n",
        )]));
        let out = s.run("cmd", None);
        assert_eq!(out.status, 0);
        assert_eq!(out.output, "no terminator here\n");
        assert_eq!(out.category, Category::None);
    }

    #[test]
    fn unparseable_terminator_defaults_to_zero() {
        let s = session(ScriptedConnector::replying(vec![Step::Data(
            b"out\nEXIT_CODE: ???\n",
        )]));
        let out = s.run("cmd", None);
        assert_eq!(out.status, 0);
        assert_eq!(out.output, "out\nEXIT_CODE: ???\n");
    }

    #[test]
    fn would_block_is_retried() {
        let s = session(ScriptedConnector::replying(vec![
            Step::Fail(io::ErrorKind::WouldBlock),
            Step::Fail(io::ErrorKind::Interrupted),
            Step::Data(b"late\nEXIT_CODE: 0\n"),
        ]));
        let out = s.run("sleep 1", None);
        assert_eq!(out.status, 0);
        assert_eq!(out.output, "late");
    }

    #[test]
    fn timeout_keeps_partial_output() {
        let s = session(ScriptedConnector::replying(vec![
            Step::Data(b"slow output"),
            Step::Fail(io::ErrorKind::TimedOut),
        ]));
        let out = s.run("sleep 999", None);
        assert_eq!(out.status, 0);
        assert_eq!(out.output, "slow output");
        assert_eq!(out.category, Category::None);
    }

    #[test]
    fn timeout_is_floored_and_defaulted() {
        let s = session(ScriptedConnector::replying(vec![Step::Data(
            b"EXIT_CODE: 0\n",
        )]));
        s.run("true", Some(Duration::from_secs(1)));
        assert_eq!(
            s.connector().connect_timeouts.borrow()[0],
            Duration::from_secs(10)
        );
        let read_timeout = s.connector().timeouts.borrow()[0];
        assert!(read_timeout <= Duration::from_secs(10));
        assert!(read_timeout > Duration::from_secs(9));

        let config = SessionConfig::default();
        assert_eq!(config.effective_timeout(None), Duration::from_secs(300));
        assert_eq!(
            config.effective_timeout(Some(Duration::ZERO)),
            Duration::from_secs(10)
        );
    }
}
