use std::num::NonZeroU32;
use std::convert::TryInto;

use bytes::{BytesMut, Buf};

use crate::pggate::{Error, Result};
use crate::pggate::pg::protocol::{Tag, Frame};

pub const MIN_MESSAGE_LEN: u32 = 5;

/// Upper bound for a single tagged message accepted by the parser. The
/// gateway never needs to hold more than one message in memory at a time,
/// so anything beyond this is treated as a framing error.
pub const MAX_MESSAGE_LEN: u32 = 32 * 1024 * 1024;

/// Upper bound for the untagged startup family. The server itself rejects
/// startup packets larger than 10000 bytes, we allow some slack.
pub const MAX_STARTUP_LEN: u32 = 16 * 1024;

pub struct Header {
    pub tag: Tag,
    pub length: NonZeroU32, // value of the length field (excludes the tag byte)
}

impl Header {
    pub fn parse(bytes: &[u8]) -> Result<Option<Self>> {
        if (bytes.len() as u32) < MIN_MESSAGE_LEN {
            return Ok(None);
        }
        let tag = Tag::new(bytes[0])?;
        let len = u32::from_be_bytes((&bytes[1..5]).try_into().unwrap());
        if len < 4 {
            return Err(Error::protocol_error("length of message frame cannot be < 4"));
        }
        if len > MAX_MESSAGE_LEN {
            return Err(Error::protocol_error(format!(
                "message frame of {} bytes exceeds the maximum of {}", len, MAX_MESSAGE_LEN)));
        }
        Ok(Some(Header{
            tag,
            length: NonZeroU32::new(len).ok_or_else(|| Error::protocol_error("length of message frame cannot be 0"))?,
        }))
    }

    /// Total length of the frame including the tag byte.
    pub fn len(&self) -> u32 {
        self.length.get() + 1
    }
}

/// Accumulates bytes read off a socket and splits complete protocol
/// messages off the front, zero-copy.
pub struct MessageParser {
    data: BytesMut,
}

impl MessageParser {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
        }
    }

    /// Returns the next complete tagged message, None if more bytes are
    /// needed (the internal buffer is grown to fit the pending message).
    pub fn next(&mut self) -> Option<Result<Frame>> {
        match Header::parse(self.data.chunk()) {
            Err(e) => Some(Err(e)),
            Ok(None) => None,
            Ok(Some(hdr)) => {
                let msg_len = hdr.len();
                if msg_len <= self.data.len() as u32 {
                    // We have the full message, split it off and return it
                    let msg = Frame::new(self.data.split_to(msg_len as usize).freeze());
                    Some(Ok(msg))
                } else {
                    // We don't have the message, make sure buffer is large enough for it
                    self.data.reserve(msg_len as usize - self.data.len());
                    None
                }
            }
        }
    }

    /// Returns the body (protocol version or special code followed by the
    /// payload) of the next untagged startup-family message, None if more
    /// bytes are needed.
    pub fn next_startup(&mut self) -> Option<Result<bytes::Bytes>> {
        if self.data.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes((&self.data.chunk()[..4]).try_into().unwrap());
        if len < 8 {
            return Some(Err(Error::protocol_error("startup message too short")));
        }
        if len > MAX_STARTUP_LEN {
            return Some(Err(Error::protocol_error(format!(
                "startup message of {} bytes exceeds the maximum of {}", len, MAX_STARTUP_LEN))));
        }
        if (self.data.len() as u32) < len {
            self.data.reserve(len as usize - self.data.len());
            return None;
        }
        let mut buf = self.data.split_to(len as usize).freeze();
        buf.advance(4); // length field
        Some(Ok(buf))
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}
