//! Line protocol for vsx host↔guest command execution.
//!
//! The host writes one command line per connection. The guest streams the
//! command output back and finishes with a terminator line of the form
//! `EXIT_CODE: <status>`, then closes the connection. Any reliable byte
//! stream carries it (vsock, Unix socket, TCP).

mod codec;
mod message;

pub use codec::{Framed, contains_sentinel, decode_text, encode_request};
pub use message::{AGENT_PORT, DEFAULT_CID, SENTINEL, StatusParse, parse_status};
