//! Wire-level codec: variable byte integers and the Reader/Writer cursors.
//!
//! MQTT encodes the remaining-length field as 1-4 bytes carrying 7 value
//! bits each, with the high bit flagging continuation:
//! - 0..=127: 1 byte
//! - 128..=16_383: 2 bytes
//! - 16_384..=2_097_151: 3 bytes
//! - 2_097_152..=268_435_455: 4 bytes
//!
//! Each value has exactly one encoding by construction, so the decoder never
//! sees a non-minimal form for a value it accepts.

use std::io::Write;

use crate::error::{ProtocolError, Result};
use crate::packet::Command;

/// Largest value representable in four variable-length bytes.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// A remaining-length field never spans more than four bytes; this is also
/// the width of the reservation made by `Writer::start_packet`.
const MAX_LENGTH_WIDTH: usize = 4;

/// Decode a variable byte integer from a buffer.
///
/// Each byte contributes a 7-bit group, least significant first. Returns
/// `Ok(Some((value, consumed)))` on success, `Ok(None)` when the buffer
/// ends before a terminating byte, or an error when the fourth byte still
/// carries a continuation flag.
pub fn decode_variable_int(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;
    for width in 0..MAX_LENGTH_WIDTH {
        let Some(&byte) = buf.get(width) else {
            return Ok(None);
        };
        value |= ((byte & 0x7F) as usize) << (7 * width);
        if byte & 0x80 == 0 {
            return Ok(Some((value, width + 1)));
        }
    }
    // A continuation flag on the fourth byte has nowhere to go
    Err(ProtocolError::InvalidRemainingLength.into())
}

/// Encode a value as a variable byte integer into a fixed-size buffer.
///
/// Returns the number of bytes written. The buffer must hold at least 4
/// bytes.
pub fn encode_variable_int(value: usize, buf: &mut [u8]) -> usize {
    let mut rest = value;
    let mut width = 0;
    loop {
        let group = (rest & 0x7F) as u8;
        rest >>= 7;
        buf[width] = if rest == 0 { group } else { group | 0x80 };
        width += 1;
        if rest == 0 {
            return width;
        }
    }
}

/// Number of bytes `encode_variable_int` writes for a value.
#[allow(dead_code)]
pub fn variable_int_len(value: usize) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Cursor over one framed packet in a connection's read buffer.
///
/// `start` scopes the cursor to the first `length` bytes of the buffer.
/// Every read advances `pos` and remembers the pre-read position, so that
/// violation reports can point at the offending byte.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    previous_pos: usize,
    length: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            previous_pos: 0,
            length: 0,
        }
    }

    /// Begin reading a packet of `length` bytes from the start of the
    /// buffer. A packet shorter than a fixed header is malformed; a length
    /// beyond the buffer means the caller sized its buffer wrong.
    pub fn start(&mut self, length: usize) -> Result<()> {
        if length < 2 {
            return Err(ProtocolError::MalformedPacket(format!(
                "{} bytes cannot hold a fixed header",
                length
            ))
            .into());
        }
        if length > self.buf.len() {
            return Err(ProtocolError::AllocatedBufferTooSmall {
                len: length,
                capacity: self.buf.len(),
            }
            .into());
        }
        self.length = length;
        self.pos = 0;
        self.previous_pos = 0;
        Ok(())
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Position before the most recent read. Error contexts report this as
    /// the offset of the offending field.
    pub fn previous_pos(&self) -> usize {
        self.previous_pos
    }

    pub fn remaining(&self) -> usize {
        self.length - self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos == self.length
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::BufferTooSmall {
                needed: n,
                have: self.remaining(),
            }
            .into());
        }
        self.previous_pos = self.pos;
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    /// Consume the fixed-header byte; returns the command and its flag
    /// nibble.
    pub fn read_command(&mut self) -> Result<(Command, u8)> {
        let byte = self.read_byte()?;
        let command = Command::from_nibble(byte >> 4)?;
        Ok((command, byte & 0x0F))
    }

    /// Consume the remaining-length field and check the announced length
    /// fits inside this packet.
    pub fn read_remaining_length(&mut self) -> Result<usize> {
        let start = self.pos;
        match decode_variable_int(&self.buf[self.pos..self.length])? {
            Some((value, consumed)) => {
                self.previous_pos = start;
                self.pos += consumed;
                if value > self.remaining() {
                    return Err(ProtocolError::BufferTooSmall {
                        needed: value,
                        have: self.remaining(),
                    }
                    .into());
                }
                Ok(value)
            }
            None => Err(ProtocolError::InvalidRemainingLength.into()),
        }
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Big-endian two-byte integer.
    pub fn read_two_bytes(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read a length-prefixed byte field. A zero length yields `None`.
    pub fn read_binary(&mut self) -> Result<Option<&'a [u8]>> {
        let field_pos = self.pos;
        let len = self.read_two_bytes()? as usize;
        if len == 0 {
            self.previous_pos = field_pos;
            return Ok(None);
        }
        let bytes = self.take(len)?;
        self.previous_pos = field_pos;
        Ok(Some(bytes))
    }

    /// Read a length-prefixed UTF-8 string.
    ///
    /// A zero length yields `None` whatever `allow_zero` says; a caller
    /// that requires a value treats `None` as the relevant violation.
    pub fn read_utf8_string(&mut self, _allow_zero: bool) -> Result<Option<&'a str>> {
        match self.read_binary()? {
            Some(bytes) => {
                let s = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
                Ok(Some(s))
            }
            None => Ok(None),
        }
    }

    /// Skip a block preceded by a variable-byte-integer length (MQTT 5
    /// property blocks), returning the raw bytes.
    pub fn skip_variable_block(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        match decode_variable_int(&self.buf[self.pos..self.length])? {
            Some((len, consumed)) => {
                self.pos += consumed;
                let bytes = self.take(len)?;
                self.previous_pos = start;
                Ok(bytes)
            }
            None => Err(ProtocolError::InvalidRemainingLength.into()),
        }
    }
}

/// Builder for outgoing packets.
///
/// `start_packet` writes the fixed-header byte and reserves four bytes for
/// the remaining-length field (its maximum width) so the payload can be
/// serialized before its length is known; `finish_packet` encodes the real
/// length and shifts the payload down over the unused part of the
/// reservation. This avoids a length-precomputation pass per packet.
pub struct Writer {
    buf: Vec<u8>,
    packet_start: Option<usize>,
}

impl Writer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
            packet_start: None,
        }
    }

    /// Begin a packet with the given command and flag nibble.
    pub fn start_packet(&mut self, command: Command, flags: u8) {
        self.packet_start = Some(self.buf.len());
        self.buf.push(((command as u8) << 4) | (flags & 0x0F));
        self.buf.extend_from_slice(&[0u8; MAX_LENGTH_WIDTH]);
    }

    /// Encode the remaining length and close the gap left by the
    /// reservation.
    pub fn finish_packet(&mut self) -> Result<()> {
        let start = self
            .packet_start
            .take()
            .ok_or(ProtocolError::NoPacketStarted)?;
        let body_start = start + 1 + MAX_LENGTH_WIDTH;
        let body_len = self.buf.len() - body_start;
        if body_len > MAX_REMAINING_LENGTH {
            return Err(ProtocolError::InvalidRemainingLength.into());
        }

        let mut encoded = [0u8; MAX_LENGTH_WIDTH];
        let width = encode_variable_int(body_len, &mut encoded);
        self.buf[start + 1..start + 1 + width].copy_from_slice(&encoded[..width]);

        let gap = MAX_LENGTH_WIDTH - width;
        if gap > 0 {
            self.buf.copy_within(body_start.., start + 1 + width);
            self.buf.truncate(self.buf.len() - gap);
        }
        Ok(())
    }

    pub fn write_byte(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    /// Big-endian two-byte integer.
    pub fn write_two_bytes(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_utf8_string(&mut self, s: &str) {
        self.write_binary(s.as_bytes());
    }

    /// Write a length-prefixed byte field.
    pub fn write_binary(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(bytes);
    }

    /// Append raw bytes without a length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes of all finished packets.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discard everything, including a half-written packet. Called on
    /// mid-packet errors so a truncated packet is never emitted.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.packet_start = None;
    }

    /// Write all buffered bytes to the stream and clear the buffer.
    /// A short write surfaces as `io::ErrorKind::WriteZero` and is fatal
    /// for the connection.
    pub fn write_to_stream<W: Write>(&mut self, stream: &mut W) -> Result<()> {
        stream.write_all(&self.buf)?;
        self.buf.clear();
        self.packet_start = None;
        Ok(())
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn protocol_err(result: Result<Option<(usize, usize)>>) -> ProtocolError {
        match result {
            Err(Error::Protocol(e)) => e,
            other => panic!("expected protocol error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_decode_variable_int_tiers() {
        assert_eq!(decode_variable_int(&[0x00]).unwrap(), Some((0, 1)));
        assert_eq!(decode_variable_int(&[0x7F]).unwrap(), Some((127, 1)));
        assert_eq!(decode_variable_int(&[0x80, 0x01]).unwrap(), Some((128, 2)));
        assert_eq!(
            decode_variable_int(&[0xFF, 0x7F]).unwrap(),
            Some((16_383, 2))
        );
        assert_eq!(
            decode_variable_int(&[0x80, 0x80, 0x01]).unwrap(),
            Some((16_384, 3))
        );
        assert_eq!(
            decode_variable_int(&[0xFF, 0xFF, 0x7F]).unwrap(),
            Some((2_097_151, 3))
        );
        assert_eq!(
            decode_variable_int(&[0x80, 0x80, 0x80, 0x01]).unwrap(),
            Some((2_097_152, 4))
        );
        assert_eq!(
            decode_variable_int(&[0xFF, 0xFF, 0xFF, 0x7F]).unwrap(),
            Some((MAX_REMAINING_LENGTH, 4))
        );
    }

    #[test]
    fn test_decode_variable_int_incomplete() {
        assert_eq!(decode_variable_int(&[]).unwrap(), None);
        assert_eq!(decode_variable_int(&[0x80]).unwrap(), None);
        assert_eq!(decode_variable_int(&[0x80, 0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn test_decode_variable_int_too_long() {
        // A fifth continuation byte is never valid
        let err = protocol_err(decode_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF, 0x7F]));
        assert_eq!(err, ProtocolError::InvalidRemainingLength);
    }

    #[test]
    fn test_encode_variable_int_widths() {
        let mut buf = [0u8; 4];
        assert_eq!(encode_variable_int(0, &mut buf), 1);
        assert_eq!(encode_variable_int(127, &mut buf), 1);
        assert_eq!(encode_variable_int(128, &mut buf), 2);
        assert_eq!(&buf[..2], &[0x80, 0x01]);
        assert_eq!(encode_variable_int(16_383, &mut buf), 2);
        assert_eq!(encode_variable_int(16_384, &mut buf), 3);
        assert_eq!(encode_variable_int(2_097_151, &mut buf), 3);
        assert_eq!(encode_variable_int(2_097_152, &mut buf), 4);
        assert_eq!(encode_variable_int(MAX_REMAINING_LENGTH, &mut buf), 4);
    }

    #[test]
    fn test_variable_int_roundtrip() {
        for value in [
            0,
            1,
            127,
            128,
            300,
            16_383,
            16_384,
            2_097_151,
            2_097_152,
            MAX_REMAINING_LENGTH,
        ] {
            let mut buf = [0u8; 4];
            let written = encode_variable_int(value, &mut buf);
            assert_eq!(written, variable_int_len(value));
            let (decoded, consumed) = decode_variable_int(&buf[..written]).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, written);
        }
    }

    #[test]
    fn test_reader_start_rejects_short_packet() {
        let buf = [0u8; 16];
        let mut reader = Reader::new(&buf);
        assert!(matches!(
            reader.start(1),
            Err(Error::Protocol(ProtocolError::MalformedPacket(_)))
        ));
    }

    #[test]
    fn test_reader_start_rejects_oversized_length() {
        let buf = [0u8; 4];
        let mut reader = Reader::new(&buf);
        assert!(matches!(
            reader.start(8),
            Err(Error::Protocol(ProtocolError::AllocatedBufferTooSmall {
                len: 8,
                capacity: 4
            }))
        ));
    }

    #[test]
    fn test_reader_fixed_header() {
        let buf = [0x10, 0x02, 0x00, 0x00];
        let mut reader = Reader::new(&buf);
        reader.start(4).unwrap();
        let (command, flags) = reader.read_command().unwrap();
        assert_eq!(command, Command::Connect);
        assert_eq!(flags, 0);
        assert_eq!(reader.read_remaining_length().unwrap(), 2);
        assert_eq!(reader.pos(), 2);
        assert_eq!(reader.remaining(), 2);
    }

    #[test]
    fn test_reader_remaining_length_exceeds_packet() {
        // Announces 9 bytes of content but only 2 follow
        let buf = [0x10, 0x09, 0x00, 0x00];
        let mut reader = Reader::new(&buf);
        reader.start(4).unwrap();
        reader.read_command().unwrap();
        assert!(matches!(
            reader.read_remaining_length(),
            Err(Error::Protocol(ProtocolError::BufferTooSmall { .. }))
        ));
    }

    #[test]
    fn test_reader_strings() {
        // "ab", then two zero-length strings, then one trailing byte
        let buf = [0x00, 0x02, b'a', b'b', 0x00, 0x00, 0x00, 0x00, 0x07];
        let mut reader = Reader::new(&buf);
        reader.start(9).unwrap();
        assert_eq!(reader.read_utf8_string(false).unwrap(), Some("ab"));
        assert_eq!(reader.previous_pos(), 0);
        // Zero length reads as absent no matter what the caller allows
        assert_eq!(reader.read_utf8_string(true).unwrap(), None);
        assert_eq!(reader.read_utf8_string(false).unwrap(), None);
        assert_eq!(reader.read_byte().unwrap(), 0x07);
        assert!(reader.at_end());
    }

    #[test]
    fn test_reader_string_truncated() {
        let buf = [0x00, 0x05, b'a', b'b'];
        let mut reader = Reader::new(&buf);
        reader.start(4).unwrap();
        assert!(matches!(
            reader.read_utf8_string(false),
            Err(Error::Protocol(ProtocolError::BufferTooSmall {
                needed: 5,
                have: 2
            }))
        ));
    }

    #[test]
    fn test_reader_invalid_utf8() {
        let buf = [0x00, 0x02, 0xC3, 0x28];
        let mut reader = Reader::new(&buf);
        reader.start(4).unwrap();
        assert!(matches!(
            reader.read_utf8_string(false),
            Err(Error::Protocol(ProtocolError::InvalidUtf8))
        ));
    }

    #[test]
    fn test_reader_previous_pos_tracks_field_start() {
        let buf = [0x00, 0x03, b'a', b'/', b'b', 0x00];
        let mut reader = Reader::new(&buf);
        reader.start(6).unwrap();
        reader.read_utf8_string(false).unwrap();
        assert_eq!(reader.previous_pos(), 0);
        reader.read_byte().unwrap();
        assert_eq!(reader.previous_pos(), 5);
    }

    #[test]
    fn test_writer_single_byte_length() {
        let mut writer = Writer::new();
        writer.start_packet(Command::Connack, 0);
        writer.write_byte(0x00);
        writer.write_byte(0x00);
        writer.finish_packet().unwrap();
        assert_eq!(writer.as_bytes(), &[0x20, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_writer_compacts_reservation() {
        // A 200-byte body needs a two-byte length field; the payload must
        // shift down over the two unused reservation bytes.
        let mut writer = Writer::new();
        writer.start_packet(Command::Publish, 0);
        let body: Vec<u8> = (0..200u8).collect();
        writer.write_raw(&body);
        writer.finish_packet().unwrap();

        let bytes = writer.as_bytes();
        assert_eq!(bytes.len(), 1 + 2 + 200);
        assert_eq!(bytes[0], 0x30);
        assert_eq!(&bytes[1..3], &[0xC8, 0x01]); // 200 as a varint
        assert_eq!(&bytes[3..], &body[..]);
    }

    #[test]
    fn test_writer_multiple_packets() {
        let mut writer = Writer::new();
        writer.start_packet(Command::Pingresp, 0);
        writer.finish_packet().unwrap();
        writer.start_packet(Command::Connack, 0);
        writer.write_byte(0x00);
        writer.write_byte(0x00);
        writer.finish_packet().unwrap();
        assert_eq!(writer.as_bytes(), &[0xD0, 0x00, 0x20, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_writer_finish_without_start() {
        let mut writer = Writer::new();
        assert!(matches!(
            writer.finish_packet(),
            Err(Error::Protocol(ProtocolError::NoPacketStarted))
        ));
    }

    #[test]
    fn test_writer_reset_drops_partial_packet() {
        let mut writer = Writer::new();
        writer.start_packet(Command::Suback, 0);
        writer.write_two_bytes(1);
        writer.reset();
        assert!(writer.is_empty());
        assert!(matches!(
            writer.finish_packet(),
            Err(Error::Protocol(ProtocolError::NoPacketStarted))
        ));
    }

    #[test]
    fn test_writer_write_to_stream() {
        let mut writer = Writer::new();
        writer.start_packet(Command::Pingresp, 0);
        writer.finish_packet().unwrap();
        let mut out = Vec::new();
        writer.write_to_stream(&mut out).unwrap();
        assert_eq!(out, vec![0xD0, 0x00]);
        assert!(writer.is_empty());
    }

    #[test]
    fn test_writer_string_fields() {
        let mut writer = Writer::new();
        writer.start_packet(Command::Publish, 0);
        writer.write_utf8_string("a/b");
        writer.write_two_bytes(0x1234);
        writer.finish_packet().unwrap();
        assert_eq!(
            writer.as_bytes(),
            &[0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', 0x12, 0x34]
        );
    }
}
