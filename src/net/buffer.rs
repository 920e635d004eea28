//! Packet buffer implementation
//!
//! Provides a byte buffer with the protocol's primitive encodings:
//! - Unsigned 8/16/32-bit integers, multi-byte values little-endian
//! - Length-prefixed UTF-8 text (u16 length, then bytes)
//!
//! Reads are checked: running past the end of the frame yields
//! `DecodeError::Truncated` naming the field being read.

use bytes::{BufMut, BytesMut};

use crate::error::DecodeError;

/// Maximum packet size (64KB)
pub const MAX_PACKET_SIZE: usize = 65535;

/// Longest text field accepted on the wire, in bytes
pub const MAX_TEXT_LEN: usize = 1024;

/// Packet buffer for reading and writing protocol data
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    /// Internal byte buffer
    data: BytesMut,
    /// Current read position
    read_pos: usize,
}

impl PacketBuffer {
    /// Create a new empty packet buffer
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
            read_pos: 0,
        }
    }

    /// Create a packet buffer with a specific capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            read_pos: 0,
        }
    }

    /// Create a packet buffer from existing bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: BytesMut::from(bytes),
            read_pos: 0,
        }
    }

    // ============ Properties ============

    /// Get the total length of the buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the buffer is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the number of bytes remaining to read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.read_pos)
    }

    /// Check if there are bytes remaining to read
    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// Get a reference to the underlying bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the buffer into an owned byte vector
    pub fn into_vec(self) -> Vec<u8> {
        self.data.to_vec()
    }

    // ============ Reading Methods ============

    fn take(&mut self, count: usize, field: &'static str) -> Result<&[u8], DecodeError> {
        if self.remaining() < count {
            return Err(DecodeError::Truncated { field });
        }
        let start = self.read_pos;
        self.read_pos += count;
        Ok(&self.data[start..start + count])
    }

    /// Read an unsigned byte
    pub fn read_ubyte(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, field)?[0])
    }

    /// Read an unsigned little-endian short (2 bytes)
    pub fn read_ushort_le(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        let b = self.take(2, field)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read an unsigned little-endian int (4 bytes)
    pub fn read_uint_le(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let b = self.take(4, field)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read length-prefixed UTF-8 text
    pub fn read_text(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = self.read_ushort_le(field)? as usize;
        if len > MAX_TEXT_LEN {
            return Err(DecodeError::OutOfRange {
                field,
                value: len as u64,
            });
        }
        let bytes = self.take(len, field)?.to_vec();
        String::from_utf8(bytes).map_err(|_| DecodeError::OutOfRange {
            field,
            value: len as u64,
        })
    }

    /// Fail if unread bytes remain after the last field
    pub fn expect_end(&self) -> Result<(), DecodeError> {
        if self.has_remaining() {
            return Err(DecodeError::OutOfRange {
                field: "trailing",
                value: self.remaining() as u64,
            });
        }
        Ok(())
    }

    // ============ Writing Methods ============

    /// Write an unsigned byte
    pub fn write_ubyte(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    /// Write an unsigned little-endian short (2 bytes)
    pub fn write_ushort_le(&mut self, value: u16) {
        self.data.put_u16_le(value);
    }

    /// Write an unsigned little-endian int (4 bytes)
    pub fn write_uint_le(&mut self, value: u32) {
        self.data.put_u32_le(value);
    }

    /// Write length-prefixed UTF-8 text, truncated to the wire limit on a char boundary
    pub fn write_text(&mut self, value: &str) {
        let mut end = value.len().min(MAX_TEXT_LEN);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.write_ushort_le(end as u16);
        self.data.extend_from_slice(&value.as_bytes()[..end]);
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&[u8]> for PacketBuffer {
    fn from(slice: &[u8]) -> Self {
        Self::from_bytes(slice)
    }
}

impl AsRef<[u8]> for PacketBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_layout() {
        let mut buf = PacketBuffer::new();
        buf.write_ushort_le(0x1234);
        buf.write_uint_le(0x12345678);

        assert_eq!(buf.as_bytes(), &[0x34, 0x12, 0x78, 0x56, 0x34, 0x12]);

        assert_eq!(buf.read_ushort_le("a").unwrap(), 0x1234);
        assert_eq!(buf.read_uint_le("b").unwrap(), 0x12345678);
        assert!(buf.expect_end().is_ok());
    }

    #[test]
    fn test_text() {
        let mut buf = PacketBuffer::new();
        buf.write_text("héllo");

        assert_eq!(buf.as_bytes()[0..2], [6, 0]);
        assert_eq!(buf.read_text("name").unwrap(), "héllo");
    }

    #[test]
    fn test_truncated_read() {
        let mut buf = PacketBuffer::from_bytes(&[1]);
        assert_eq!(
            buf.read_ushort_le("quantity"),
            Err(DecodeError::Truncated { field: "quantity" })
        );

        let mut buf = PacketBuffer::from_bytes(&[5, 0, b'a', b'b']);
        assert_eq!(
            buf.read_text("message"),
            Err(DecodeError::Truncated { field: "message" })
        );
    }

    #[test]
    fn test_invalid_utf8_is_out_of_range() {
        let mut buf = PacketBuffer::from_bytes(&[2, 0, 0xff, 0xfe]);
        assert!(matches!(
            buf.read_text("message"),
            Err(DecodeError::OutOfRange { field: "message", .. })
        ));
    }

    #[test]
    fn test_oversized_text_rejected() {
        let mut buf = PacketBuffer::new();
        buf.write_ushort_le((MAX_TEXT_LEN + 1) as u16);
        assert!(matches!(
            buf.read_text("message"),
            Err(DecodeError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_write_text_truncates_on_char_boundary() {
        let long = "é".repeat(MAX_TEXT_LEN);
        let mut buf = PacketBuffer::new();
        buf.write_text(&long);

        let text = buf.read_text("message").unwrap();
        assert_eq!(text.len(), MAX_TEXT_LEN);
        assert!(buf.expect_end().is_ok());
    }

    #[test]
    fn test_trailing_bytes() {
        let mut buf = PacketBuffer::from_bytes(&[1, 2, 3]);
        buf.read_ubyte("kind").unwrap();
        assert_eq!(
            buf.expect_end(),
            Err(DecodeError::OutOfRange {
                field: "trailing",
                value: 2
            })
        );
    }
}
