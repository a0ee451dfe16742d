use bytes::{Bytes, BytesMut, BufMut};

use crate::pggate::pg::protocol::{Tag, ServerParams};

/// Serializes one or more protocol messages into a single buffer,
/// back-patching each message's length field on completion.
pub struct MessageBuilder {
    data: BytesMut,
    start: usize, // start position of current message being built
    untagged: bool, // current message has no tag byte (startup family)
}

impl MessageBuilder {
    pub fn new(tag: Tag) -> Self {
        let mut builder = MessageBuilder {
            data: BytesMut::with_capacity(256), // typically we build short messages
            start: 0,
            untagged: false,
        };
        builder.begin(tag);
        builder
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Completes the current message and starts a new one with the given tag.
    pub fn add_new(&mut self, tag: Tag) {
        self.complete_message();
        self.start = self.data.len();
        self.begin(tag);
    }

    fn begin(&mut self, tag: Tag) {
        self.untagged = tag == Tag::UNTAGGED;
        if !self.untagged {
            self.data.put_u8(tag.as_u8());
        }
        self.data.put_i32(0); // length placeholder
    }

    fn complete_message(&mut self) {
        let end = self.data.len();
        let len_at = if self.untagged { self.start } else { self.start + 1 };
        let len = (end - len_at) as i32;
        self.data[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
    }

    pub fn finish(mut self) -> Bytes {
        self.complete_message();
        self.data.freeze()
    }

    pub fn write_byte(&mut self, b: u8) {
        self.data.put_u8(b);
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
        self.write_byte(0);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn write_i16(&mut self, i: i16) {
        self.data.put_i16(i);
    }

    pub fn write_i32(&mut self, i: i32) {
        self.data.put_i32(i);
    }

    pub fn write_params(&mut self, params: &ServerParams) {
        for (k, v) in params.iter() {
            self.write_str(k);
            self.write_str(v);
        }
    }
}
