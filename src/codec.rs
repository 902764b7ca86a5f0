//! Framing rules for the beanstalkd protocol.
//!
//! Requests are encoded by `BeanstalkSerialisable`. Responses are decoded
//! incrementally by [`ResponseDecoder`], which never performs IO: bytes are
//! appended to its buffer as they arrive and [`ResponseDecoder::decode`] is
//! polled to pull complete responses out.
use std::mem;

use bytes::{Buf, Bytes, BytesMut};
use indexmap::IndexMap;
use itertools::Itertools;

use crate::error::Error;
use crate::types::protocol::{BeanstalkCommand, ResponseLine};
use crate::util::bytes_to_human_str;

/// Status lines longer than this without a CRLF mean the stream is not
/// speaking the protocol. The longest legitimate line is `USING` plus a
/// 200-byte tube name.
const MAX_LINE_LEN: usize = 1024;

/// A complete response: the status line plus, for `RESERVED`, `FOUND` and
/// `OK`, the data block that followed it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub line: ResponseLine,
    pub payload: Option<Bytes>,
}

#[derive(Debug)]
enum DecodeState {
    AwaitingLine,
    AwaitingPayload { line: ResponseLine, len: usize },
}

#[derive(Debug)]
pub struct ResponseDecoder {
    /// Stores data that's been read in but not yet decoded.
    buf: BytesMut,
    /// Index in buf from which a valid CRLF pair may appear (and before which
    /// a CRLF sequence hasn't been seen).
    maybe_crlf_from: usize,
    state: DecodeState,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            maybe_crlf_from: 0,
            state: DecodeState::AwaitingLine,
        }
    }
}

impl ResponseDecoder {
    /// The buffer incoming bytes should be appended to.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Whether any bytes of an incomplete (or unclaimed) response are held.
    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
            || matches!(self.state, DecodeState::AwaitingPayload { .. })
    }

    /// Takes the next CRLF-terminated line from the buffer, without its CRLF.
    pub fn next_line(&mut self) -> Option<Bytes> {
        // Scanning resumes one byte before the end of the previous scan in
        // case a \r arrived at the end of one read and its \n in the next.
        match self
            .buf
            .iter()
            .skip(self.maybe_crlf_from)
            .tuple_windows::<(_, _)>()
            .position(|x| x == (&b'\r', &b'\n'))
        {
            Some(eol) => {
                let line =
                    self.buf.split_to(self.maybe_crlf_from + eol + 2).freeze();
                self.maybe_crlf_from = 0;

                Some(line.slice(0..line.len() - 2))
            },
            None => {
                self.maybe_crlf_from = self.buf.len().saturating_sub(1);
                None
            },
        }
    }

    /// Decodes the next response to `command` from the buffer, returning
    /// `Ok(None)` if more bytes are needed.
    ///
    /// Any error means the stream can't be resynchronised: the decoder must
    /// be discarded along with its connection.
    pub fn decode(
        &mut self,
        command: &BeanstalkCommand,
    ) -> Result<Option<Response>, Error> {
        loop {
            match mem::replace(&mut self.state, DecodeState::AwaitingLine) {
                DecodeState::AwaitingLine => {
                    let Some(raw) = self.next_line() else {
                        if self.buf.len() > MAX_LINE_LEN {
                            return Err(Error::UnexpectedResponse(
                                "overlong status line".to_owned(),
                            ));
                        }
                        return Ok(None);
                    };

                    let line = ResponseLine::try_from(&raw[..]).map_err(
                        |error| {
                            Error::UnexpectedResponse(format!(
                                "{error}: {}",
                                bytes_to_human_str(&raw)
                            ))
                        },
                    )?;

                    if !command.expects_payload(&line) {
                        return Ok(Some(Response {
                            line,
                            payload: None,
                        }));
                    }

                    let len = line.payload_len().ok_or_else(|| {
                        Error::UnexpectedResponse(format!(
                            "no data length in {}",
                            bytes_to_human_str(&raw)
                        ))
                    })?;
                    self.state = DecodeState::AwaitingPayload { line, len };
                },
                DecodeState::AwaitingPayload { line, len } => {
                    if self.buf.len() < len + 2 {
                        self.state = DecodeState::AwaitingPayload { line, len };
                        return Ok(None);
                    }

                    if &self.buf[len..len + 2] != b"\r\n" {
                        return Err(Error::UnexpectedResponse(format!(
                            "{len}-byte data block not followed by CRLF"
                        )));
                    }

                    let payload = self.buf.split_to(len).freeze();
                    self.buf.advance(2);
                    self.maybe_crlf_from = 0;

                    return Ok(Some(Response {
                        line,
                        payload: Some(payload),
                    }));
                },
            }
        }
    }
}

/// Decodes the YAML-like block carried by list and stats responses. Lines of
/// the form `key: value` map the key to its value; list items (`- value`) map
/// the item to `None`. Order of appearance is preserved.
pub fn decode_block(
    data: &[u8],
) -> Result<IndexMap<String, Option<String>>, Error> {
    let text = std::str::from_utf8(data).map_err(|_| {
        Error::UnexpectedResponse(format!(
            "non-UTF-8 data block: {}",
            bytes_to_human_str(data)
        ))
    })?;

    let unquote = |s: &str| s.trim().trim_matches('"').to_owned();

    let mut block = IndexMap::new();
    for line in text.lines() {
        if line.is_empty() || line == "---" {
            continue;
        }

        if let Some(item) = line.strip_prefix("- ") {
            block.insert(unquote(item), None);
        } else if let Some((key, value)) = line.split_once(':') {
            block.insert(key.trim().to_owned(), Some(unquote(value)));
        } else {
            return Err(Error::UnexpectedResponse(format!(
                "malformed data block line: {line}"
            )));
        }
    }

    Ok(block)
}
