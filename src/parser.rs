//! Parser for the status lines of the beanstalkd TCP protocol.
use std::fmt;

use crate::error::Error;
use crate::types::protocol::ResponseLine;

/// The longest tube name the protocol accepts, in bytes.
pub const MAX_TUBE_NAME_LEN: usize = 200;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    BadFormat,
    UnknownResponse,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BadFormat => "bad format",
            Self::UnknownResponse => "unknown response",
        })
    }
}

fn char_is_name_safe(c: u8, is_first: bool) -> bool {
    match c {
        b'a'..=b'z' => true,
        b'A'..=b'Z' => true,
        b'0'..=b'9' => true,
        b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')' => true,
        b'-' => !is_first, // - is only name safe outside first position
        _ => false,
    }
}

fn is_valid_name(name: &[u8]) -> bool {
    !name.is_empty()
        && name.len() <= MAX_TUBE_NAME_LEN
        && name
            .iter()
            .enumerate()
            .all(|(i, c)| char_is_name_safe(*c, i == 0))
}

/// Checks a tube name before it's put on the wire, so a bad name fails
/// locally with `BadFormat` rather than desynchronising the connection.
pub fn validate_tube_name(name: &str) -> Result<(), Error> {
    if is_valid_name(name.as_bytes()) {
        Ok(())
    } else {
        Err(Error::BadFormat)
    }
}

/// Cursor over a status line. Tokens are borrowed from the input.
struct ParseState<'a> {
    from: &'a [u8],
}

impl<'a> ParseState<'a> {
    /// `Ok(result)` when the whole line has been consumed.
    fn expect_done_and<R>(&self, result: R) -> Result<R, ParsingError> {
        if self.from.is_empty() {
            Ok(result)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    fn is_done(&self) -> bool {
        self.from.is_empty()
    }

    /// Next token, which must not be empty.
    fn expect_next_token(&mut self) -> Result<&'a [u8], ParsingError> {
        let token = self.next_token().ok_or(ParsingError::BadFormat)?;

        if token.is_empty() {
            Err(ParsingError::BadFormat)
        } else {
            Ok(token)
        }
    }

    /// A space, then a decimal `u64` without sign or overflow.
    fn expect_next_u64(&mut self) -> Result<u64, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        let mut r = 0u64;
        for v in token {
            match v {
                b'0'..=b'9' => {
                    r = r
                        .checked_mul(10)
                        .ok_or(ParsingError::BadFormat)?
                        .checked_add((*v - b'0') as u64)
                        .ok_or(ParsingError::BadFormat)?
                },
                _ => return Err(ParsingError::BadFormat),
            };
        }

        Ok(r)
    }

    fn expect_next_u32(&mut self) -> Result<u32, ParsingError> {
        self.expect_next_u64()?
            .try_into()
            .map_err(|_| ParsingError::BadFormat)
    }

    /// Byte counts share the `u32` range of `put`.
    fn expect_next_len(&mut self) -> Result<usize, ParsingError> {
        self.expect_next_u32().map(|n| n as usize)
    }

    /// A space, then a tube name.
    fn expect_next_name(&mut self) -> Result<String, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        if is_valid_name(token) {
            // Name-safe bytes are all ASCII.
            Ok(token.iter().map(|c| *c as char).collect())
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    fn expect_space(&mut self) -> Result<(), ParsingError> {
        match self.from.first() {
            Some(b' ') => {
                self.from = &self.from[1..];
                Ok(())
            },
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Takes bytes up to the next space, or to the end. `None` once the input
    /// is exhausted; an empty slice when sitting on a space.
    fn next_token(&mut self) -> Option<&'a [u8]> {
        if self.from.is_empty() {
            return None;
        }

        let from = self.from;
        let idx = from.iter().position(|c| *c == b' ').unwrap_or(from.len());

        let token = &from[..idx];
        self.from = &from[idx..];

        Some(token)
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        Self { from }
    }
}

// Parsing is implemented to fulfil the TryFrom trait. The input is a status
// line with its trailing CRLF already removed.
impl TryFrom<&[u8]> for ResponseLine {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        use ResponseLine::*;

        let mut ps: ParseState = value.into();

        let line = match ps.expect_next_token()? {
            // <status>
            b"BAD_FORMAT" => BadFormat,
            b"DEADLINE_SOON" => DeadlineSoon,
            b"DELETED" => Deleted,
            b"DRAINING" => Draining,
            b"EXPECTED_CRLF" => ExpectedCrlf,
            b"INTERNAL_ERROR" => InternalError,
            b"JOB_TOO_BIG" => JobTooBig,
            b"NOT_FOUND" => NotFound,
            b"NOT_IGNORED" => NotIgnored,
            b"OUT_OF_MEMORY" => OutOfMemory,
            b"PAUSED" => Paused,
            b"RELEASED" => Released,
            b"TIMED_OUT" => TimedOut,
            b"TOUCHED" => Touched,
            b"UNKNOWN_COMMAND" => UnknownCommand,

            // <status> [<n>]
            b"BURIED" if ps.is_done() => Buried,
            b"BURIED" => BuriedId {
                id: ps.expect_next_u64()?,
            },
            b"KICKED" if ps.is_done() => Kicked,
            b"KICKED" => KickedCount {
                count: ps.expect_next_u64()?,
            },

            // <status> <n>
            b"INSERTED" => Inserted {
                id: ps.expect_next_u64()?,
            },
            b"WATCHING" => Watching {
                count: ps.expect_next_u32()?,
            },
            b"OK" => Ok {
                n_bytes: ps.expect_next_len()?,
            },

            // <status> <tube>
            b"USING" => Using {
                tube: ps.expect_next_name()?,
            },

            // <status> <id> <n_bytes>
            b"RESERVED" => Reserved {
                id: ps.expect_next_u64()?,
                n_bytes: ps.expect_next_len()?,
            },
            b"FOUND" => Found {
                id: ps.expect_next_u64()?,
                n_bytes: ps.expect_next_len()?,
            },

            _ => return Err(ParsingError::UnknownResponse),
        };

        ps.expect_done_and(line)
    }
}
