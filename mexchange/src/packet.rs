//! Binary message envelope.
//!
//! A packet lives in one of two modes. [`PacketWriter`] is the append-only
//! write mode backed by a growable [`BytesMut`]; [`PacketWriter::finish`]
//! freezes it into a read-mode [`Packet`], which pairs reference-counted
//! [`Bytes`] with a private cursor.
//!
//! Cloning a [`Packet`] is cheap: the bytes are shared, the cursor is not.
//! Because the shared bytes are immutable, one holder can never disturb what
//! another holder reads. Getting a mutable copy goes through
//! [`Packet::into_writer`], which copies.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::varint;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("packet exhausted: need {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },

    #[error("string is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("character {0:?} cannot be encoded as an ANSI string")]
    NonAnsiChar(char),

    #[error("invalid bool byte {0:#04x}")]
    InvalidBool(u8),

    #[error("JSON blob: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write-mode packet.
#[derive(Debug, Default, Clone)]
pub struct PacketWriter {
    buf: BytesMut,
    no_local_bypass: bool,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            no_local_bypass: false,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    /// Writes an unsigned integer as a 1-9 byte varint.
    pub fn write_uint(&mut self, value: u64) -> &mut Self {
        varint::put_u64(&mut self.buf, value);
        self
    }

    /// Writes a signed integer, zigzag mapped, as a 1-9 byte varint.
    pub fn write_int(&mut self, value: i64) -> &mut Self {
        self.write_uint(varint::zigzag_encode(value))
    }

    pub fn write_float(&mut self, value: f64) -> &mut Self {
        self.buf.put_f64_le(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(u8::from(value))
    }

    /// Writes a varint byte length followed by UTF-8.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.write_buffer(value.as_bytes())
    }

    /// Writes one byte per character. Fails without writing anything if a
    /// character falls outside Latin-1.
    pub fn write_ansi_string(&mut self, value: &str) -> Result<&mut Self, PacketError> {
        let mut encoded = Vec::with_capacity(value.len());
        for ch in value.chars() {
            let code = u32::from(ch);
            if code > 0xFF {
                return Err(PacketError::NonAnsiChar(ch));
            }
            encoded.push(code as u8);
        }
        Ok(self.write_buffer(&encoded))
    }

    /// Writes a varint length followed by the raw bytes.
    pub fn write_buffer(&mut self, value: &[u8]) -> &mut Self {
        self.write_uint(value.len() as u64);
        self.buf.put_slice(value);
        self
    }

    /// Appends bytes with no length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_slice(value);
        self
    }

    pub fn write_json<T: Serialize>(&mut self, value: &T) -> Result<&mut Self, PacketError> {
        let encoded = serde_json::to_string(value)?;
        Ok(self.write_string(&encoded))
    }

    /// Marks the packet so a local-bypass exchange always forwards it to the
    /// real transport.
    pub fn no_local_bypass(&mut self) -> &mut Self {
        self.no_local_bypass = true;
        self
    }

    pub fn finish(self) -> Packet {
        Packet {
            data: self.buf.freeze(),
            cursor: 0,
            no_local_bypass: self.no_local_bypass,
        }
    }
}

/// Read-mode packet.
#[derive(Debug, Clone)]
pub struct Packet {
    data: Bytes,
    cursor: usize,
    no_local_bypass: bool,
}

impl Packet {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            cursor: 0,
            no_local_bypass: false,
        }
    }

    /// Shorthand for a packet holding a single string.
    pub fn from_string(value: &str) -> Self {
        let mut writer = PacketWriter::with_capacity(value.len() + varint::MAX_LEN);
        writer.write_string(value);
        writer.finish()
    }

    /// Every byte of the packet, regardless of the cursor.
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    pub fn no_local_bypass(&self) -> bool {
        self.no_local_bypass
    }

    /// Moves the cursor back to the first byte.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Copies the whole packet into a fresh writer positioned at the end.
    pub fn into_writer(self) -> PacketWriter {
        PacketWriter {
            buf: BytesMut::from(&self.data[..]),
            no_local_bypass: self.no_local_bypass,
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, PacketError> {
        let mut bytes = self.take(1)?;
        Ok(bytes.get_u8())
    }

    pub fn read_uint(&mut self) -> Result<u64, PacketError> {
        let rest = &self.data[self.cursor..];
        match varint::decode_u64(rest) {
            Some((value, used)) => {
                self.cursor += used;
                Ok(value)
            }
            None => Err(PacketError::UnexpectedEnd {
                needed: rest.first().map_or(1, |first| varint_width(*first)),
                remaining: rest.len(),
            }),
        }
    }

    pub fn read_int(&mut self) -> Result<i64, PacketError> {
        self.read_uint().map(varint::zigzag_decode)
    }

    pub fn read_float(&mut self) -> Result<f64, PacketError> {
        let mut bytes = self.take(8)?;
        Ok(bytes.get_f64_le())
    }

    pub fn read_bool(&mut self) -> Result<bool, PacketError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(PacketError::InvalidBool(other)),
        }
    }

    pub fn read_string(&mut self) -> Result<String, PacketError> {
        let bytes = self.read_buffer()?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    pub fn read_ansi_string(&mut self) -> Result<String, PacketError> {
        let bytes = self.read_buffer()?;
        Ok(bytes.iter().map(|byte| char::from(*byte)).collect())
    }

    /// Reads a length-prefixed span. The result shares the packet's buffer.
    pub fn read_buffer(&mut self) -> Result<Bytes, PacketError> {
        let start = self.cursor;
        let len = self.read_uint()?;
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        match self.take(len) {
            Ok(bytes) => Ok(bytes),
            Err(err) => {
                self.cursor = start;
                Err(err)
            }
        }
    }

    /// Reads every unread byte.
    pub fn read_remaining(&mut self) -> Bytes {
        let bytes = self.data.slice(self.cursor..);
        self.cursor = self.data.len();
        bytes
    }

    pub fn read_json<T: DeserializeOwned>(&mut self) -> Result<T, PacketError> {
        let encoded = self.read_string()?;
        Ok(serde_json::from_str(&encoded)?)
    }

    fn take(&mut self, len: usize) -> Result<Bytes, PacketError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(PacketError::UnexpectedEnd {
                needed: len,
                remaining,
            });
        }
        let bytes = self.data.slice(self.cursor..self.cursor + len);
        self.cursor += len;
        Ok(bytes)
    }
}

impl PartialEq for Packet {
    /// Packets compare by content; cursors and flags are ignored.
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Packet {}

impl From<PacketWriter> for Packet {
    fn from(writer: PacketWriter) -> Self {
        writer.finish()
    }
}

fn varint_width(first: u8) -> usize {
    match first {
        0..=240 => 1,
        241..=248 => 2,
        249 => 3,
        _ => 1 + usize::from(first - 247),
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Move {
        unit: String,
        x: i32,
        y: i32,
    }

    #[test]
    fn reads_values_back_in_write_order() {
        let mut writer = PacketWriter::new();
        writer
            .write_u8(7)
            .write_int(-42)
            .write_uint(1 << 40)
            .write_float(1.5)
            .write_bool(true)
            .write_string("héllo")
            .write_buffer(&[1, 2, 3]);
        writer.write_ansi_string("chan.1").expect("ansi id");
        writer
            .write_json(&Move {
                unit: "archer".into(),
                x: 3,
                y: -4,
            })
            .expect("json");

        let mut packet = writer.finish();
        assert_eq!(packet.read_u8().unwrap(), 7);
        assert_eq!(packet.read_int().unwrap(), -42);
        assert_eq!(packet.read_uint().unwrap(), 1 << 40);
        assert_eq!(packet.read_float().unwrap(), 1.5);
        assert!(packet.read_bool().unwrap());
        assert_eq!(packet.read_string().unwrap(), "héllo");
        assert_eq!(&packet.read_buffer().unwrap()[..], &[1, 2, 3]);
        assert_eq!(packet.read_ansi_string().unwrap(), "chan.1");
        assert_eq!(
            packet.read_json::<Move>().unwrap(),
            Move {
                unit: "archer".into(),
                x: 3,
                y: -4
            }
        );
        assert!(packet.is_exhausted());
    }

    #[test]
    fn reading_past_the_end_fails_without_moving() {
        let mut writer = PacketWriter::new();
        writer.write_uint(10).write_raw(b"abc");
        let mut packet = writer.finish();

        let err = packet.read_buffer().unwrap_err();
        assert!(matches!(
            err,
            PacketError::UnexpectedEnd {
                needed: 10,
                remaining: 3
            }
        ));
        assert_eq!(packet.position(), 0);
        assert!(packet.read_float().is_err());
    }

    #[test]
    fn ansi_strings_reject_wide_characters() {
        let mut writer = PacketWriter::new();
        let err = writer.write_ansi_string("snow☃").unwrap_err();
        assert!(matches!(err, PacketError::NonAnsiChar('☃')));
        assert!(writer.is_empty());

        writer.write_ansi_string("café").expect("latin-1 fits");
        let mut packet = writer.finish();
        assert_eq!(packet.len(), 5);
        assert_eq!(packet.read_ansi_string().unwrap(), "café");
    }

    #[test]
    fn clones_have_independent_cursors() {
        let packet = Packet::from_string("shared");
        let mut first = packet.clone();
        let mut second = packet.clone();

        assert_eq!(first.read_string().unwrap(), "shared");
        assert!(first.is_exhausted());
        assert_eq!(second.position(), 0);
        assert_eq!(second.read_string().unwrap(), "shared");
    }

    #[test]
    fn mutating_a_copy_leaves_other_holders_untouched() {
        let original = Packet::from_string("base");
        let mut other = original.clone();

        let mut writer = original.into_writer();
        writer.write_string("extra");
        let mut grown = writer.finish();

        assert_eq!(other.len(), 5);
        assert_eq!(other.read_string().unwrap(), "base");
        assert!(other.is_exhausted());
        assert_eq!(grown.read_string().unwrap(), "base");
        assert_eq!(grown.read_string().unwrap(), "extra");
    }

    #[test]
    fn rejects_bad_bool_bytes() {
        let mut packet = Packet::from_bytes(vec![2u8]);
        assert!(matches!(packet.read_bool(), Err(PacketError::InvalidBool(2))));
    }

    #[test]
    fn no_local_bypass_flag_survives_finish() {
        let mut writer = PacketWriter::new();
        writer.write_u8(1).no_local_bypass();
        let packet = writer.finish();
        assert!(packet.no_local_bypass());
        assert!(!Packet::from_string("x").no_local_bypass());
    }
}
