//! Codecs for the relay control channel.
//!
//! Both directions are newline-delimited text. The server-to-client direction
//! additionally carries raw file bytes after a `FILE_START_TCP <name> <size>`
//! header: the header ends at its `\n` and is followed by exactly `size` bytes,
//! after which line framing resumes. [`ServerStreamCodec`] tracks that switch
//! so a reader never has to guess where the payload starts.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::cmp;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;
use crate::reply::{Announcement, Reply};

/// Default maximum line length in bytes (one read buffer).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// Default line limit for the client side.
///
/// Relayed lines add a prefix, the sender's name, and a group name to text
/// that was itself up to [`DEFAULT_MAX_LINE_LENGTH`] bytes.
pub const DEFAULT_MAX_RELAYED_LINE_LENGTH: usize = 4 * DEFAULT_MAX_LINE_LENGTH;

/// Largest chunk of inline file data yielded by [`ServerStreamCodec`].
pub const MAX_PAYLOAD_CHUNK: usize = 64 * 1024;

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Known command with missing or malformed arguments.
    #[error("Invalid {0} format")]
    InvalidFormat(&'static str),

    /// Unrecognized command line.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Line exceeded the configured maximum.
    #[error("Line of {0} bytes exceeds maximum {1}")]
    LineTooLong(usize, usize),

    /// Announcement line with unparseable fields.
    #[error("Malformed announcement: {0}")]
    MalformedAnnouncement(String),

    /// Stream ended in the middle of an inline payload.
    #[error("Stream ended with {0} payload bytes outstanding")]
    TruncatedPayload(u64),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One inbound line as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete line, lossily decoded as UTF-8, without its terminator.
    Line(String),
    /// A line longer than the limit was discarded; carries its length.
    Oversized(usize),
}

/// Newline codec used by the server to read commands and write replies, and
/// by clients to write commands.
///
/// Lines longer than `max_length` are discarded whole and reported as
/// [`Inbound::Oversized`] instead of failing the stream.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    next_index: usize,
    discarding: Option<usize>,
}

impl LineCodec {
    /// Create a codec with the default line limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// Create a codec with a specific line limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: None,
        }
    }

    /// Get the line limit.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = Inbound;
    type Error = ProtocolError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>, ProtocolError> {
        loop {
            let read_to = cmp::min(self.max_length.saturating_add(1), buf.len());
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (Some(discarded), Some(offset)) => {
                    buf.advance(offset + 1);
                    self.discarding = None;
                    self.next_index = 0;
                    return Ok(Some(Inbound::Oversized(discarded + offset)));
                }
                (Some(discarded), None) => {
                    buf.advance(read_to);
                    self.discarding = Some(discarded + read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (None, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    return Ok(Some(Inbound::Line(decode_line(&line[..end]))));
                }
                (None, None) if buf.len() > self.max_length => {
                    self.discarding = Some(0);
                    self.next_index = 0;
                }
                (None, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>, ProtocolError> {
        if let Some(item) = self.decode(buf)? {
            return Ok(Some(item));
        }
        self.next_index = 0;
        if let Some(discarded) = self.discarding.take() {
            let len = discarded + buf.len();
            buf.clear();
            return Ok(Some(Inbound::Oversized(len)));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let line = buf.split_to(buf.len());
        Ok(Some(Inbound::Line(decode_line(&line))))
    }
}

impl Encoder<Bytes> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.reserve(line.len() + 1);
        dst.put(line);
        dst.put_u8(b'\n');
        Ok(())
    }
}

impl Encoder<&Reply> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, reply: &Reply, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        self.encode(reply.to_bytes(), dst)
    }
}

impl Encoder<Command> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        self.encode(Bytes::from(command.to_string()), dst)
    }
}

/// Decode a line, tolerating invalid UTF-8 and a trailing `\r`.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// An event on the server-to-client stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A text line. `FILE_START_TCP` headers are delivered as lines too,
    /// immediately before their payload.
    Line(String),
    /// A slice of an inline file payload.
    FileChunk(Bytes),
    /// The inline payload announced by the last header is complete.
    FileEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Lines,
    Payload(u64),
    End,
}

/// Client-side decoder that switches between line framing and raw payload.
///
/// Lines longer than the limit are dropped rather than failing the stream,
/// since relayed lines carry a prefix the sender's limit did not count. The
/// body of a `FILES_LIST` announcement is passed through as plain lines, so a
/// listed name can never be mistaken for a payload header.
#[derive(Debug, Clone)]
pub struct ServerStreamCodec {
    lines: LineCodec,
    mode: Mode,
    listing: usize,
}

impl ServerStreamCodec {
    /// Create a decoder with the given line limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LineCodec::with_max_length(max_length),
            mode: Mode::Lines,
            listing: 0,
        }
    }

    /// Bytes of inline payload still expected, if a transfer is in progress.
    #[must_use]
    pub fn payload_remaining(&self) -> Option<u64> {
        match self.mode {
            Mode::Payload(remaining) => Some(remaining),
            _ => None,
        }
    }

    /// Classify a complete line and switch modes if it opens a payload or a
    /// listing.
    fn on_line(&mut self, line: String) -> ServerEvent {
        if self.listing > 0 {
            self.listing -= 1;
            return ServerEvent::Line(line);
        }
        match Announcement::parse(&line) {
            Ok(Some(Announcement::FileStartTcp { size, .. })) => {
                self.mode = if size == 0 {
                    Mode::End
                } else {
                    Mode::Payload(size)
                };
            }
            Ok(Some(Announcement::FilesList { count })) => self.listing = count,
            // Anything else, malformed announcements included, is text.
            _ => {}
        }
        ServerEvent::Line(line)
    }
}

impl Default for ServerStreamCodec {
    fn default() -> Self {
        Self::with_max_length(DEFAULT_MAX_RELAYED_LINE_LENGTH)
    }
}

impl Decoder for ServerStreamCodec {
    type Item = ServerEvent;
    type Error = ProtocolError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ServerEvent>, ProtocolError> {
        match self.mode {
            Mode::End => {
                self.mode = Mode::Lines;
                Ok(Some(ServerEvent::FileEnd))
            }
            Mode::Payload(remaining) => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = cmp::min(
                    cmp::min(buf.len() as u64, remaining),
                    MAX_PAYLOAD_CHUNK as u64,
                ) as usize;
                let chunk = buf.split_to(take).freeze();
                let remaining = remaining - take as u64;
                self.mode = if remaining == 0 {
                    Mode::End
                } else {
                    Mode::Payload(remaining)
                };
                Ok(Some(ServerEvent::FileChunk(chunk)))
            }
            Mode::Lines => loop {
                match self.lines.decode(buf)? {
                    Some(Inbound::Line(line)) => return Ok(Some(self.on_line(line))),
                    Some(Inbound::Oversized(_)) => {
                        self.listing = self.listing.saturating_sub(1);
                    }
                    None => return Ok(None),
                }
            },
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<ServerEvent>, ProtocolError> {
        if let Some(event) = self.decode(buf)? {
            return Ok(Some(event));
        }
        match self.mode {
            Mode::Payload(remaining) => {
                self.mode = Mode::Lines;
                Err(ProtocolError::TruncatedPayload(remaining))
            }
            _ => match self.lines.decode_eof(buf)? {
                Some(Inbound::Line(line)) => Ok(Some(self.on_line(line))),
                Some(Inbound::Oversized(_)) | None => Ok(None),
            },
        }
    }
}
