use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::codec::{Response, ResponseDecoder};
use crate::error::{Error, Result};
use crate::types::protocol::BeanstalkCommand;

/// Reads CRLF-terminated lines and complete responses from a stream, feeding
/// a [`ResponseDecoder`].
pub struct ResponseReader<T: AsyncRead + Unpin> {
    decoder: ResponseDecoder,
    reader: T,
}

impl<T: AsyncRead + Unpin> ResponseReader<T> {
    /// Performs one read from the underlying stream into the decoder's
    /// buffer, returning the number of bytes read. Zero means end-of-stream.
    ///
    /// Cancel-safe. The only await is one `read_buf`, so a cancelled call has
    /// buffered nothing and a finished one has buffered everything it read.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.reader.read_buf(self.decoder.buffer_mut()).await
    }

    /// Decodes a response to `command` from bytes already buffered, without
    /// reading.
    pub fn decode(
        &mut self,
        command: &BeanstalkCommand,
    ) -> Result<Option<Response>> {
        self.decoder.decode(command)
    }

    pub fn has_buffered(&self) -> bool {
        self.decoder.has_buffered()
    }

    /// Next CRLF-terminated line, without its terminator. `None` at the end of
    /// the stream; a trailing unterminated fragment is dropped.
    ///
    /// Cancel-safe for the same reason as [`Self::fill`].
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // The loop ensures pipelined lines that arrive in the same read
            // are handed out one by one before reading again.
            if let Some(line) = self.decoder.next_line() {
                return Ok(Some(line));
            }

            if self.fill().await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Reads until a complete response to `command` has been decoded.
    pub async fn read_response(
        &mut self,
        command: &BeanstalkCommand,
    ) -> Result<Response> {
        loop {
            if let Some(response) = self.decoder.decode(command)? {
                return Ok(response);
            }

            if self.fill().await? == 0 {
                return Err(Error::Connection(
                    "connection closed by server".to_owned(),
                ));
            }
        }
    }
}

impl<T: AsyncRead + Unpin> From<T> for ResponseReader<T> {
    fn from(value: T) -> Self {
        Self {
            decoder: ResponseDecoder::default(),
            reader: value,
        }
    }
}
