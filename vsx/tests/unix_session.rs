//! End-to-end command sessions against stub guest servers on Unix sockets.

#![allow(clippy::unwrap_used, missing_docs)]

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use vsx::{
    Category, Endpoint, Session, SessionConfig, TRANSPORT_LOST, TRANSPORT_UNREACHABLE,
    UnixConnector,
};

/// What the stub guest does after reading the command line.
#[derive(Clone, Copy)]
enum Reply {
    /// Write the bytes and close.
    Close(&'static [u8]),
    /// Write the bytes and keep the connection open until the host leaves.
    Hang(&'static [u8]),
    /// Write the bytes, then close with the command still unread so the
    /// host sees a reset.
    Reset(&'static [u8]),
}

/// Binds a stub server answering one connection per reply, in order.
/// Returns the commands it received.
fn serve(replies: Vec<Reply>) -> (TempDir, PathBuf, JoinHandle<Vec<String>>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guest.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let handle = thread::spawn(move || {
        let mut received = Vec::new();
        for reply in replies {
            let (mut stream, _) = listener.accept().unwrap();
            if let Reply::Reset(bytes) = reply {
                stream.write_all(bytes).unwrap();
                // Let the command land in our receive queue before closing.
                thread::sleep(Duration::from_millis(200));
                drop(stream);
                received.push(String::new());
                continue;
            }
            let mut line = String::new();
            BufReader::new(stream.try_clone().unwrap())
                .read_line(&mut line)
                .unwrap();
            received.push(line);
            match reply {
                Reply::Close(bytes) => stream.write_all(bytes).unwrap(),
                Reply::Hang(bytes) => {
                    stream.write_all(bytes).unwrap();
                    // Returns once the host closes its end.
                    let _ = stream.read_to_end(&mut Vec::new());
                }
                Reply::Reset(_) => unreachable!(),
            }
        }
        received
    });
    (dir, path, handle)
}

fn session(path: &PathBuf, config: SessionConfig) -> Session<UnixConnector> {
    Session::new(Endpoint::default(), UnixConnector::new(path), config)
}

fn fast_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.retry_delay = Duration::ZERO;
    config
}

#[test]
fn echo_hi() {
    let (_dir, path, server) = serve(vec![Reply::Close(b"hi\nEXIT_CODE: 0\n")]);
    let out = session(&path, fast_config()).run("echo hi", None);

    assert_eq!(out.status, 0);
    assert_eq!(out.output, "hi");
    assert_eq!(out.category, Category::None);
    assert_eq!(server.join().unwrap(), vec!["echo hi\n".to_owned()]);
}

#[test]
fn guest_crash_mid_response_is_transport_lost() {
    let (_dir, path, server) = serve(vec![Reply::Reset(b"partial")]);
    let out = session(&path, fast_config()).run("crash", None);

    assert_eq!(out.status, TRANSPORT_LOST);
    assert_eq!(out.category, Category::TransportLost);
    assert!(out.output.starts_with("ERROR: Connection lost"));
    assert!(out.output.ends_with("Partial output: partial"));
    server.join().unwrap();
}

#[test]
fn each_command_gets_its_own_connection() {
    let (_dir, path, server) = serve(vec![
        Reply::Close(b"one\nEXIT_CODE: 0\n"),
        Reply::Close(b"ls: /nope: No such file or directory\nEXIT_CODE: 2\n"),
    ]);
    let s = session(&path, fast_config());

    let first = s.run("echo one", None);
    let second = s.run("ls /nope", Some(Duration::from_secs(30)));

    assert_eq!(first.into_parts(), (0, "one".to_owned()));
    assert_eq!(second.status, 2);
    assert_eq!(second.output, "ls: /nope: No such file or directory");
    assert_eq!(second.category, Category::CommandNonzero);
    assert_eq!(server.join().unwrap().len(), 2);
}

#[test]
fn close_without_terminator_returns_everything() {
    let (_dir, path, server) = serve(vec![Reply::Close(b"server gave up\n")]);
    let out = session(&path, fast_config()).run("weird", None);

    assert_eq!(out.status, 0);
    assert_eq!(out.output, "server gave up\n");
    server.join().unwrap();
}

#[test]
fn receive_timeout_keeps_partial_output() {
    let (_dir, path, server) = serve(vec![Reply::Hang(b"still running")]);
    let mut config = fast_config();
    config.min_timeout = Duration::from_millis(200);
    config.retry_yield = Duration::from_millis(10);

    let start = Instant::now();
    let out = session(&path, config).run("sleep 100", Some(Duration::from_millis(200)));

    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(out.status, 0);
    assert_eq!(out.output, "still running");
    server.join().unwrap();
}

#[test]
fn missing_server_is_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let s = session(&dir.path().join("nobody.sock"), fast_config());
    let out = s.run("echo hi", None);

    assert_eq!(out.status, TRANSPORT_UNREACHABLE);
    assert_eq!(out.category, Category::TransportUnreachable);
    assert!(out.output.contains("Failed to connect"));
    assert!(out.output.contains("after 3 retries"));
}
