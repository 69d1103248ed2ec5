//! Protocol constants and terminator-line parsing.

/// Default vsock port the guest command server listens on.
pub const AGENT_PORT: u32 = 5555;

/// Default guest context identifier.
pub const DEFAULT_CID: u32 = 103;

/// Marker that opens the terminator line carrying the exit status.
pub const SENTINEL: &str = "EXIT_CODE:";

/// Result of parsing the status out of a terminator line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StatusParse {
    /// The line carried a base-10 integer status.
    Parsed(i32),
    /// The line had no field after the first `:`, or it was not an integer.
    Unparseable,
}

impl StatusParse {
    /// Returns the parsed status, if any.
    pub const fn status(self) -> Option<i32> {
        match self {
            Self::Parsed(code) => Some(code),
            Self::Unparseable => None,
        }
    }
}

/// Parses the status field of a terminator line.
///
/// The field is whatever sits between the first and the second `:` of the
/// line, with surrounding whitespace removed. An optional sign is accepted.
pub fn parse_status(line: &str) -> StatusParse {
    let Some(field) = line.split(':').nth(1) else {
        return StatusParse::Unparseable;
    };
    field
        .trim()
        .parse::<i32>()
        .map_or(StatusParse::Unparseable, StatusParse::Parsed)
}
