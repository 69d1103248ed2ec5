//! Request framing and response decoding over any `Write` stream.
//!
//! A request is `<command>\n`. A response is free-form UTF-8 whose last line,
//! when present, is `<text>EXIT_CODE:<status>`.

use std::io::{self, Write};

use crate::message::{SENTINEL, parse_status};

/// Writes `command` as a single newline-terminated request frame.
pub fn encode_request<W: Write>(w: &mut W, command: &str) -> io::Result<()> {
    let mut frame = Vec::with_capacity(command.len() + 1);
    frame.extend_from_slice(command.as_bytes());
    frame.push(b'\n');
    w.write_all(&frame)?;
    w.flush()
}

/// Returns `true` once the sentinel appears anywhere in `raw`.
pub fn contains_sentinel(raw: &[u8]) -> bool {
    raw.windows(SENTINEL.len()).any(|w| w == SENTINEL.as_bytes())
}

/// Decodes `raw` as UTF-8, dropping invalid sequences instead of replacing them.
pub fn decode_text(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    for chunk in raw.utf8_chunks() {
        out.push_str(chunk.valid());
    }
    out
}

/// A decoded response: guest status and the output text without the terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Framed {
    /// Status carried by the terminator line, `0` when absent or unparseable.
    pub status: i32,
    /// Output text. Excludes the terminator line only when it parsed.
    pub text: String,
    /// Whether a parseable terminator line closed the response.
    pub terminated: bool,
}

impl Framed {
    /// Splits accumulated response bytes into status and output.
    ///
    /// When the last non-blank line holds the sentinel and its status parses,
    /// the output is every preceding line. Otherwise the status is `0` and the
    /// whole decoded text is kept verbatim, terminator line included.
    pub fn decode(raw: &[u8]) -> Self {
        let text = decode_text(raw);
        let trimmed = text.trim();
        let (body, last) = trimmed.rsplit_once('\n').unwrap_or(("", trimmed));

        if last.contains(SENTINEL) {
            if let Some(status) = parse_status(last).status() {
                return Self {
                    status,
                    text: body.to_owned(),
                    terminated: true,
                };
            }
        }

        Self {
            status: 0,
            text,
            terminated: false,
        }
    }
}
