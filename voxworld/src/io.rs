//! Wire primitives: little-endian read/write extension traits and the
//! length-prefixed frame format shared by the server and the client
//! simulator.
//!
//! A frame is `len_lo, len_hi, cmd, payload…` where the length counts the
//! whole frame including the three header bytes.

use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use thiserror::Error;

/// The smallest legal frame: two length bytes plus the command byte.
pub const FRAME_HEADER_LEN: usize = 3;
/// Initial per-connection cap on frame length, grown as needed.
pub const FRAME_INITIAL_CAP: usize = 50;

/// Error produced when a frame cannot be read; any of these is fatal for the
/// session that produced it.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("frame length {0} below header size")]
    TooShort(usize),
}

/// A complete decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The command id byte.
    pub cmd: u8,
    /// The payload after the command byte.
    pub payload: Vec<u8>,
}

/// Read one complete frame. The `cap` is the current buffer cap of the
/// connection and is grown to fit larger frames, mirroring the read buffer
/// the original session loop reused between commands.
pub fn read_frame(read: &mut impl Read, cap: &mut usize) -> Result<Frame, FrameError> {

    let mut head = [0u8; 2];
    read.read_exact(&mut head)?;
    let length = u16::from_le_bytes(head) as usize;

    if length < FRAME_HEADER_LEN {
        return Err(FrameError::TooShort(length));
    }
    if length > *cap {
        *cap = length;
    }

    let mut cmd = [0u8; 1];
    read.read_exact(&mut cmd)?;

    let mut payload = vec![0u8; length - FRAME_HEADER_LEN];
    read.read_exact(&mut payload)?;

    Ok(Frame { cmd: cmd[0], payload })

}

/// Compose a frame from a command id and payload.
pub fn compose_frame(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let length = payload.len() + FRAME_HEADER_LEN;
    debug_assert!(length <= u16::MAX as usize);
    let mut buf = Vec::with_capacity(length);
    buf.extend_from_slice(&(length as u16).to_le_bytes());
    buf.push(cmd);
    buf.extend_from_slice(payload);
    buf
}

/// Extension trait with little-endian wire read methods.
pub trait ReadWireExt: Read {

    #[inline]
    fn read_wire_u8(&mut self) -> io::Result<u8> {
        ReadBytesExt::read_u8(self)
    }

    #[inline]
    fn read_wire_u16(&mut self) -> io::Result<u16> {
        ReadBytesExt::read_u16::<LE>(self)
    }

    #[inline]
    fn read_wire_u32(&mut self) -> io::Result<u32> {
        ReadBytesExt::read_u32::<LE>(self)
    }

    #[inline]
    fn read_wire_u64(&mut self) -> io::Result<u64> {
        ReadBytesExt::read_u64::<LE>(self)
    }

    #[inline]
    fn read_wire_i16(&mut self) -> io::Result<i16> {
        ReadBytesExt::read_i16::<LE>(self)
    }

    #[inline]
    fn read_wire_i32(&mut self) -> io::Result<i32> {
        ReadBytesExt::read_i32::<LE>(self)
    }

    #[inline]
    fn read_wire_i64(&mut self) -> io::Result<i64> {
        ReadBytesExt::read_i64::<LE>(self)
    }

    /// Read the rest of the reader as an UTF-8 string, replacing invalid
    /// sequences.
    fn read_wire_string(&mut self) -> io::Result<String> {
        let mut raw = Vec::new();
        self.read_to_end(&mut raw)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Read a fixed 4-byte object code.
    fn read_wire_code(&mut self) -> io::Result<[u8; 4]> {
        let mut code = [0u8; 4];
        self.read_exact(&mut code)?;
        Ok(code)
    }

}

/// Extension trait with little-endian wire write methods.
pub trait WriteWireExt: Write {

    #[inline]
    fn write_wire_u8(&mut self, v: u8) -> io::Result<()> {
        WriteBytesExt::write_u8(self, v)
    }

    #[inline]
    fn write_wire_u16(&mut self, v: u16) -> io::Result<()> {
        WriteBytesExt::write_u16::<LE>(self, v)
    }

    #[inline]
    fn write_wire_u32(&mut self, v: u32) -> io::Result<()> {
        WriteBytesExt::write_u32::<LE>(self, v)
    }

    #[inline]
    fn write_wire_u64(&mut self, v: u64) -> io::Result<()> {
        WriteBytesExt::write_u64::<LE>(self, v)
    }

    #[inline]
    fn write_wire_i16(&mut self, v: i16) -> io::Result<()> {
        WriteBytesExt::write_i16::<LE>(self, v)
    }

    #[inline]
    fn write_wire_i32(&mut self, v: i32) -> io::Result<()> {
        WriteBytesExt::write_i32::<LE>(self, v)
    }

    #[inline]
    fn write_wire_i64(&mut self, v: i64) -> io::Result<()> {
        WriteBytesExt::write_i64::<LE>(self, v)
    }

}

impl<R: Read> ReadWireExt for R {}
impl<W: Write> WriteWireExt for W {}

#[cfg(test)]
mod tests {

    use std::io::Cursor;
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = compose_frame(4, b"hello");
        assert_eq!(frame[0], 8);
        assert_eq!(frame[1], 0);
        assert_eq!(frame[2], 4);
        let mut cap = FRAME_INITIAL_CAP;
        let decoded = read_frame(&mut Cursor::new(&frame), &mut cap).unwrap();
        assert_eq!(decoded.cmd, 4);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn frame_length_below_header_is_an_error() {
        let mut cap = FRAME_INITIAL_CAP;
        let res = read_frame(&mut Cursor::new(&[2u8, 0, 9]), &mut cap);
        assert!(matches!(res, Err(FrameError::TooShort(2))));
    }

    #[test]
    fn frame_grows_the_cap() {
        let frame = compose_frame(8, &vec![0u8; 100]);
        let mut cap = FRAME_INITIAL_CAP;
        read_frame(&mut Cursor::new(&frame), &mut cap).unwrap();
        assert_eq!(cap, 103);
    }

    #[test]
    fn wire_values_are_little_endian() {
        let mut buf = Vec::new();
        buf.write_wire_u32(0x12345678).unwrap();
        assert_eq!(buf, [0x78, 0x56, 0x34, 0x12]);
        let mut cursor = Cursor::new(&buf);
        assert_eq!(cursor.read_wire_u32().unwrap(), 0x12345678);
    }

}
