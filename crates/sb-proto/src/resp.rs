//! Frame grammar for the broker line protocol.
//!
//! Each frame starts with one of `+ - : $ *` and is terminated by `\r\n`.
//! Bulk strings and arrays support the `-1` null sentinel; arrays nest.
//! The decoder retains partial input: a truncated frame consumes nothing
//! and decoding resumes once more bytes arrive.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// A single decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `+text\r\n`
    Simple(String),
    /// `-text\r\n`
    Error(String),
    /// `:n\r\n`
    Integer(i64),
    /// `$len\r\nbytes\r\n`; `None` is the `$-1` null bulk.
    Bulk(Option<String>),
    /// `*len\r\nframes…`; `None` is the `*-1` null array.
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// Build the command frame for `argv`: an array of bulk strings.
    pub fn command<I, S>(argv: I) -> Frame
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Frame::Array(Some(
            argv.into_iter()
                .map(|arg| Frame::Bulk(Some(arg.into())))
                .collect(),
        ))
    }

    /// Interpret this frame as a pushed channel message.
    ///
    /// Pushed frames have the shape `["message", channel, payload]`.
    pub fn as_channel_message(&self) -> Option<(&str, &str)> {
        let Frame::Array(Some(items)) = self else {
            return None;
        };
        match items.as_slice() {
            [Frame::Bulk(Some(kind)), Frame::Bulk(Some(channel)), Frame::Bulk(Some(payload))]
                if kind == "message" =>
            {
                Some((channel, payload))
            }
            _ => None,
        }
    }
}

/// Frame-level protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown frame prefix byte {0:#04x}")]
    UnknownPrefix(u8),
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),
    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Codec implementing the frame grammar over a byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        match parse(src)? {
            None => Ok(None),
            Some((consumed, frame)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
        }
    }
}

impl Encoder<Frame> for WireCodec {
    type Error = WireError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WireError> {
        write_frame(&frame, dst);
        Ok(())
    }
}

fn write_frame(frame: &Frame, dst: &mut BytesMut) {
    match frame {
        Frame::Simple(text) => {
            dst.put_u8(b'+');
            dst.put_slice(text.as_bytes());
            dst.put_slice(b"\r\n");
        }
        Frame::Error(text) => {
            dst.put_u8(b'-');
            dst.put_slice(text.as_bytes());
            dst.put_slice(b"\r\n");
        }
        Frame::Integer(n) => {
            dst.put_slice(format!(":{n}\r\n").as_bytes());
        }
        Frame::Bulk(None) => dst.put_slice(b"$-1\r\n"),
        Frame::Bulk(Some(text)) => {
            dst.put_slice(format!("${}\r\n", text.len()).as_bytes());
            dst.put_slice(text.as_bytes());
            dst.put_slice(b"\r\n");
        }
        Frame::Array(None) => dst.put_slice(b"*-1\r\n"),
        Frame::Array(Some(items)) => {
            dst.put_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                write_frame(item, dst);
            }
        }
    }
}

/// Parse one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds only a truncated frame.
fn parse(buf: &[u8]) -> Result<Option<(usize, Frame)>, WireError> {
    let Some(header_end) = find_crlf(buf) else {
        return Ok(None);
    };
    let line = &buf[1..header_end];

    match buf[0] {
        b'+' => Ok(Some((header_end + 2, Frame::Simple(text(line)?)))),
        b'-' => Ok(Some((header_end + 2, Frame::Error(text(line)?)))),
        b':' => Ok(Some((header_end + 2, Frame::Integer(integer(line)?)))),
        b'$' => {
            let length = integer(line)?;
            if length == -1 {
                return Ok(Some((header_end + 2, Frame::Bulk(None))));
            }
            let length = to_length(length)?;
            let total = header_end + 2 + length + 2;
            if buf.len() < total {
                return Ok(None);
            }
            let payload = &buf[header_end + 2..header_end + 2 + length];
            Ok(Some((total, Frame::Bulk(Some(text(payload)?)))))
        }
        b'*' => {
            let length = integer(line)?;
            if length == -1 {
                return Ok(Some((header_end + 2, Frame::Array(None))));
            }
            let length = to_length(length)?;
            let mut items = Vec::with_capacity(length);
            let mut end = header_end + 2;
            for _ in 0..length {
                match parse(&buf[end..])? {
                    None => return Ok(None),
                    Some((used, frame)) => {
                        end += used;
                        items.push(frame);
                    }
                }
            }
            Ok(Some((end, Frame::Array(Some(items)))))
        }
        other => Err(WireError::UnknownPrefix(other)),
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

fn text(bytes: &[u8]) -> Result<String, WireError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
}

fn integer(line: &[u8]) -> Result<i64, WireError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| WireError::MalformedHeader(String::from_utf8_lossy(line).into_owned()))
}

fn to_length(value: i64) -> Result<usize, WireError> {
    usize::try_from(value).map_err(|_| WireError::MalformedHeader(format!("length {value}")))
}
