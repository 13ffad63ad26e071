//! Wire framing for the message broker socket
//!
//! Inbound request frames:
//! ```text
//! SENDER SP CONNLEN ":" CONNID "," SP HEADERS-JSON SP BODYLEN ":" BODY "\n\n"
//! ```
//! Outbound reply frames:
//! ```text
//! SENDER SP CONNLEN ":" CONNID "," SP PAYLOAD "\n\n"
//! ```
//! Length prefixes are decimal byte counts and must match the field exactly.

use serde::de::IgnoredAny;
use thiserror::Error;

pub const FRAME_TERMINATOR: &[u8] = b"\n\n";

/// Longest accepted length prefix, enough for any frame under `usize::MAX`.
const MAX_LENGTH_DIGITS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("frame is incomplete")]
    Incomplete,
    #[error("{field} is empty")]
    EmptyField { field: &'static str },
    #[error("expected '{delimiter}' after {field}")]
    MissingDelimiter {
        field: &'static str,
        delimiter: &'static str,
    },
    #[error("invalid length prefix for {field}")]
    InvalidLength { field: &'static str },
    #[error("{field} does not match its declared length of {declared} bytes")]
    LengthMismatch { field: &'static str, declared: usize },
    #[error("headers are not valid JSON: {0}")]
    InvalidHeaders(String),
    #[error("frame is not terminated by a blank line")]
    MissingTerminator,
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
}

/// A request frame split into its fields. Headers are kept as raw JSON text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub sender: String,
    pub conn_id: String,
    pub headers: Vec<u8>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    pub sender: String,
    pub conn_id: String,
    pub payload: Vec<u8>,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FramingError> {
        let rest = self.rest();
        if rest.len() < len {
            return Err(FramingError::Incomplete);
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    fn delimiter(
        &mut self,
        literal: &'static [u8],
        field: &'static str,
        delimiter: &'static str,
    ) -> Result<(), FramingError> {
        let rest = self.rest();
        let available = rest.len().min(literal.len());
        if rest[..available] != literal[..available] {
            return Err(FramingError::MissingDelimiter { field, delimiter });
        }
        if available < literal.len() {
            return Err(FramingError::Incomplete);
        }
        self.pos += literal.len();
        Ok(())
    }

    /// Reads a token up to the next space. A line break before the space
    /// means the cursor sits inside the tail of some other frame.
    fn token(&mut self, field: &'static str) -> Result<String, FramingError> {
        let rest = self.rest();
        let Some(end) = rest.iter().position(|byte| matches!(*byte, b' ' | b'\n')) else {
            return Err(FramingError::Incomplete);
        };
        if rest[end] == b'\n' {
            return Err(FramingError::MissingDelimiter {
                field,
                delimiter: " ",
            });
        }
        if end == 0 {
            return Err(FramingError::EmptyField { field });
        }
        let token = utf8(&rest[..end], field)?;
        self.pos += end + 1;
        Ok(token)
    }

    /// Reads `LEN ":" DATA` and leaves the cursor right after `DATA`.
    fn netstring(&mut self, field: &'static str) -> Result<&'a [u8], FramingError> {
        let rest = self.rest();
        let digits = rest.iter().take_while(|byte| byte.is_ascii_digit()).count();
        if digits > MAX_LENGTH_DIGITS {
            return Err(FramingError::InvalidLength { field });
        }
        if digits == rest.len() {
            return Err(FramingError::Incomplete);
        }
        if digits == 0 || rest[digits] != b':' {
            return Err(FramingError::InvalidLength { field });
        }
        let declared = std::str::from_utf8(&rest[..digits])
            .ok()
            .and_then(|text| text.parse::<usize>().ok())
            .ok_or(FramingError::InvalidLength { field })?;
        self.pos += digits + 1;
        self.take(declared)
    }

    fn headers(&mut self) -> Result<&'a [u8], FramingError> {
        let rest = self.rest();
        let mut stream = serde_json::Deserializer::from_slice(rest).into_iter::<IgnoredAny>();
        match stream.next() {
            Some(Ok(_)) => {}
            Some(Err(error)) if error.is_eof() => return Err(FramingError::Incomplete),
            Some(Err(error)) => return Err(FramingError::InvalidHeaders(error.to_string())),
            None => return Err(FramingError::Incomplete),
        }
        let end = stream.byte_offset();
        self.pos += end;
        Ok(&rest[..end])
    }
}

fn utf8(bytes: &[u8], field: &'static str) -> Result<String, FramingError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| FramingError::InvalidUtf8 { field })
}

/// Decodes one request frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it occupied, or
/// `FramingError::Incomplete` when `buf` holds only a prefix of a frame.
pub fn decode_request(buf: &[u8]) -> Result<(RequestFrame, usize), FramingError> {
    let mut cursor = Cursor::new(buf);
    let sender = cursor.token("sender id")?;
    let conn_id = utf8(cursor.netstring("connection id")?, "connection id")?;
    if conn_id.is_empty() {
        return Err(FramingError::EmptyField {
            field: "connection id",
        });
    }
    let after_conn_id = cursor.rest();
    cursor
        .delimiter(b",", "connection id", ",")
        .map_err(|error| conn_id_error(error, after_conn_id, conn_id.len()))?;
    cursor.delimiter(b" ", "connection id", " ")?;
    let headers = cursor.headers()?.to_vec();
    cursor.delimiter(b" ", "headers", " ")?;
    let body = cursor.netstring("body")?.to_vec();
    cursor
        .delimiter(FRAME_TERMINATOR, "body", "\\n\\n")
        .map_err(|error| mismatch(error, "body", body.len()))?;

    Ok((
        RequestFrame {
            sender,
            conn_id,
            headers,
            body,
        },
        cursor.pos,
    ))
}

fn mismatch(error: FramingError, field: &'static str, declared: usize) -> FramingError {
    match error {
        FramingError::MissingDelimiter { .. } => FramingError::LengthMismatch { field, declared },
        other => other,
    }
}

/// A `,` ahead of the next space means the connection id ran past its
/// declared length; otherwise the delimiter itself is missing.
fn conn_id_error(error: FramingError, rest: &[u8], declared: usize) -> FramingError {
    let overran = rest
        .iter()
        .take_while(|byte| **byte != b' ')
        .any(|byte| *byte == b',');
    if overran {
        mismatch(error, "connection id", declared)
    } else {
        error
    }
}

/// Frames a reply payload for the given sender and connection.
pub fn encode_reply(sender: &str, conn_id: &str, payload: &[u8]) -> Vec<u8> {
    let header = format!("{sender} {}:{conn_id}, ", conn_id.len());
    let mut frame = Vec::with_capacity(header.len() + payload.len() + FRAME_TERMINATOR.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(FRAME_TERMINATOR);
    frame
}

/// Inverse of [`encode_reply`]. `buf` must hold exactly one reply frame.
pub fn decode_reply(buf: &[u8]) -> Result<ReplyFrame, FramingError> {
    let Some(payload_end) = buf.len().checked_sub(FRAME_TERMINATOR.len()) else {
        return Err(FramingError::MissingTerminator);
    };
    if !buf.ends_with(FRAME_TERMINATOR) {
        return Err(FramingError::MissingTerminator);
    }

    let mut cursor = Cursor::new(&buf[..payload_end]);
    let sender = cursor.token("sender id")?;
    let conn_id = utf8(cursor.netstring("connection id")?, "connection id")?;
    let after_conn_id = cursor.rest();
    cursor
        .delimiter(b",", "connection id", ",")
        .map_err(|error| conn_id_error(error, after_conn_id, conn_id.len()))?;
    cursor.delimiter(b" ", "connection id", " ")?;

    Ok(ReplyFrame {
        sender,
        conn_id,
        payload: cursor.rest().to_vec(),
    })
}

/// Offset just past the next frame terminator, used to skip a bad frame.
pub fn resync_offset(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_TERMINATOR.len())
        .position(|window| window == FRAME_TERMINATOR)
        .map(|pos| pos + FRAME_TERMINATOR.len())
}
