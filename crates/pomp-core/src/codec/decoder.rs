//! Argument decoder: reads a tagged, typed argument list back out of a
//! [`Message`]'s payload. Grounded on `pomp_decoder.c`.

use std::fmt::Write as _;
use std::os::fd::RawFd;

use super::format::Value;
use crate::{
    buffer::Buffer,
    error::{PompError, Result},
    message::Message,
    varint::{decode_varint, zigzag_decode_i32, zigzag_decode_i64},
    wire::ArgType,
};

/// Maximum number of allocated strings/buffers a single [`Decoder::readv`]
/// call will track, matching `MAX_DECODE_STR` in the reference
/// implementation.
pub const MAX_DECODE_STR: usize = 16;

/// Reads typed arguments back out of a message's payload at a running
/// cursor.
pub struct Decoder {
    buf: Buffer,
    pos: usize,
}

impl Decoder {
    pub fn new(msg: &Message) -> Self {
        Self { buf: msg.buffer().clone(), pos: msg.payload_start() }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Reads the next tag without consuming it.
    fn peek_tag(&self) -> Result<ArgType> {
        let mut p = self.pos;
        let b = self.buf.read_byte(&mut p)?;
        ArgType::from_u8(b).ok_or(PompError::InvalidArgument("unknown argument tag"))
    }

    /// Verifies the next tag equals `want`, consuming it on success. On
    /// mismatch the cursor is left untouched, mirroring the reference
    /// decoder's rewind-by-one-byte behavior.
    fn expect_tag(&mut self, want: ArgType) -> Result<()> {
        let got = self.peek_tag()?;
        if got != want {
            return Err(PompError::InvalidArgument("argument type mismatch"));
        }
        self.pos += 1;
        Ok(())
    }

    fn read_varint(&mut self) -> Result<u64> {
        self.buf.with_data(|data| decode_varint(data, &mut self.pos))
            .ok_or(PompError::InvalidArgument("truncated varint"))
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.expect_tag(ArgType::I8)?;
        Ok(self.buf.read_byte(&mut self.pos)? as i8)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.expect_tag(ArgType::U8)?;
        self.buf.read_byte(&mut self.pos)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.expect_tag(ArgType::I16)?;
        let mut raw = [0u8; 2];
        self.buf.read(&mut self.pos, &mut raw)?;
        Ok(i16::from_le_bytes(raw))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.expect_tag(ArgType::U16)?;
        let mut raw = [0u8; 2];
        self.buf.read(&mut self.pos, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.expect_tag(ArgType::I32)?;
        Ok(zigzag_decode_i32(self.read_varint()? as u32))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.expect_tag(ArgType::U32)?;
        Ok(self.read_varint()? as u32)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.expect_tag(ArgType::I64)?;
        Ok(zigzag_decode_i64(self.read_varint()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.expect_tag(ArgType::U64)?;
        self.read_varint()
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.expect_tag(ArgType::F32)?;
        let mut raw = [0u8; 4];
        self.buf.read(&mut self.pos, &mut raw)?;
        Ok(f32::from_le_bytes(raw))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.expect_tag(ArgType::F64)?;
        let mut raw = [0u8; 8];
        self.buf.read(&mut self.pos, &mut raw)?;
        Ok(f64::from_le_bytes(raw))
    }

    /// Copies the string out as an owned, NUL-stripped `String`.
    pub fn read_str(&mut self) -> Result<String> {
        self.read_cstr(|s| s.to_owned())
    }

    /// Borrows the string without copying, validating that the declared
    /// length ends on a NUL byte and that the bytes are valid UTF-8.
    pub fn read_cstr<R>(&mut self, f: impl FnOnce(&str) -> R) -> Result<R> {
        self.expect_tag(ArgType::Str)?;
        let len = self.read_varint()? as usize;
        if len < 2 {
            return Err(PompError::InvalidArgument("empty strings are rejected; length must cover at least one byte plus the trailing NUL"));
        }
        self.buf.with_slice(&mut self.pos, len, |bytes| {
            let (body, nul) = bytes.split_at(len - 1);
            if nul != [0] {
                return Err(PompError::InvalidArgument("string not NUL-terminated"));
            }
            let s = std::str::from_utf8(body).map_err(|_| PompError::InvalidArgument("string is not valid UTF-8"))?;
            Ok(f(s))
        })?
    }

    /// Copies the buffer out as an owned `Vec<u8>`.
    pub fn read_buf(&mut self) -> Result<Vec<u8>> {
        self.read_cbuf(|b| b.to_vec())
    }

    /// Borrows the buffer without copying.
    pub fn read_cbuf<R>(&mut self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.expect_tag(ArgType::Buf)?;
        let len = self.read_varint()? as usize;
        self.buf.with_slice(&mut self.pos, len, f)
    }

    pub fn read_fd(&mut self) -> Result<RawFd> {
        self.expect_tag(ArgType::Fd)?;
        self.buf.read_fd(&mut self.pos)
    }

    /// Reads one value whose type is not known ahead of time, returning it
    /// tagged as a [`Value`]. Used by [`Decoder::walk`] and `dump`.
    ///
    /// When `checkfds` is `false`, an `FD` tag's 4 payload bytes are skipped
    /// without validating them against the buffer's recorded fd offsets, and
    /// [`Value::Fd`] carries `-1`. This is used by the connection layer's
    /// pre-fixup walk, before `SCM_RIGHTS` file descriptors have been
    /// registered into the buffer yet.
    pub fn read_any(&mut self, checkfds: bool) -> Result<Value> {
        let tag = self.peek_tag()?;
        Ok(match tag {
            ArgType::I8 => Value::I8(self.read_i8()?),
            ArgType::U8 => Value::U8(self.read_u8()?),
            ArgType::I16 => Value::I16(self.read_i16()?),
            ArgType::U16 => Value::U16(self.read_u16()?),
            ArgType::I32 => Value::I32(self.read_i32()?),
            ArgType::U32 => Value::U32(self.read_u32()?),
            ArgType::I64 => Value::I64(self.read_i64()?),
            ArgType::U64 => Value::U64(self.read_u64()?),
            ArgType::Str => Value::Str(self.read_str()?),
            ArgType::Buf => Value::Buf(self.read_buf()?),
            ArgType::F32 => Value::F32(self.read_f32()?),
            ArgType::F64 => Value::F64(self.read_f64()?),
            ArgType::Fd => {
                if checkfds {
                    Value::Fd(self.read_fd()?)
                } else {
                    self.pos += 1;
                    self.pos += 4;
                    Value::Fd(-1)
                }
            }
        })
    }

    /// Walks every remaining argument, calling `visit` once per value. Used
    /// by the fd-fixup pass (`checkfds = false`, to locate `FD` slots before
    /// registering real descriptors) and by `dump`.
    pub fn walk(&mut self, checkfds: bool, mut visit: impl FnMut(&Value) -> Result<()>) -> Result<()> {
        while !self.is_empty() {
            let v = self.read_any(checkfds)?;
            visit(&v)?;
        }
        Ok(())
    }

    /// Locates the buffer offset of every `FD` argument's 4-byte placeholder
    /// in the remaining payload, without requiring them to already be
    /// registered. Used by the connection layer to match incoming
    /// `SCM_RIGHTS` descriptors (received in wire order) to their slots
    /// before the message is handed to the application.
    pub fn fd_offsets(&self) -> Result<Vec<usize>> {
        let mut dec = Self { buf: self.buf.clone(), pos: self.pos };
        let mut offsets = Vec::new();
        while !dec.is_empty() {
            if dec.peek_tag()? == ArgType::Fd {
                offsets.push(dec.pos + 1);
            }
            dec.read_any(false)?;
        }
        Ok(offsets)
    }

    /// scanf-style typed read: `fmt` drives expected conversions, results
    /// land in the returned `Vec<Value>` in order.
    pub fn read(&mut self, fmt: &str) -> Result<Vec<Value>> {
        use super::format::{for_each_conversion, Conversion, WidthFlags};
        let mut out = Vec::new();
        for_each_conversion(fmt, |conv| {
            let v = match conv {
                Conversion::SignedInt(f) => self.read_signed_for_width(f)?,
                Conversion::UnsignedInt(f) => self.read_unsigned_for_width(f)?,
                Conversion::Str { dynamic } => {
                    if !dynamic {
                        return Err(PompError::InvalidArgument("bare %s is rejected on read; use %ms"));
                    }
                    Value::Str(self.read_str()?)
                }
                Conversion::Buf => Value::Buf(self.read_buf()?),
                Conversion::Float(f) => {
                    if f.contains(WidthFlags::L) {
                        Value::F64(self.read_f64()?)
                    } else {
                        Value::F32(self.read_f32()?)
                    }
                }
                Conversion::Fd => Value::Fd(self.read_fd()?),
            };
            out.push(v);
            Ok(())
        })?;
        if out.len() > MAX_DECODE_STR {
            return Err(PompError::ResourceExhausted("too many decoded arguments"));
        }
        Ok(out)
    }

    fn read_signed_for_width(&mut self, flags: super::format::WidthFlags) -> Result<Value> {
        use super::format::WidthFlags;
        Ok(if flags.contains(WidthFlags::LL) {
            Value::I64(self.read_i64()?)
        } else if flags.contains(WidthFlags::HH) {
            Value::I8(self.read_i8()?)
        } else if flags.contains(WidthFlags::H) {
            Value::I16(self.read_i16()?)
        } else {
            Value::I32(self.read_i32()?)
        })
    }

    fn read_unsigned_for_width(&mut self, flags: super::format::WidthFlags) -> Result<Value> {
        use super::format::WidthFlags;
        Ok(if flags.contains(WidthFlags::LL) {
            Value::U64(self.read_u64()?)
        } else if flags.contains(WidthFlags::HH) {
            Value::U8(self.read_u8()?)
        } else if flags.contains(WidthFlags::H) {
            Value::U16(self.read_u16()?)
        } else {
            Value::U32(self.read_u32()?)
        })
    }

    /// Renders every remaining argument as `"{ID:<id>, TAG:val, ...}"`,
    /// truncating to at most `max_len` characters.
    ///
    /// `BUF` arguments dump as a bare `, BUF:` with no content: this
    /// preserves a quirk of the reference dump routine, whose buffer-append
    /// helper was a no-op stub. When the rendered string would exceed
    /// `max_len`, it is cut to `max_len - 1` characters and the last four of
    /// those are overwritten with `"...}"`, leaving the final byte position
    /// always reserved (as if for a NUL terminator), matching
    /// `decoder_dump`'s truncation behavior exactly.
    pub fn dump(&self, msgid: u32, max_len: usize) -> Result<String> {
        let mut dec = Self { buf: self.buf.clone(), pos: self.pos };
        let mut s = String::new();
        write!(s, "{{ID:{msgid}").ok();
        dec.walk(false, |v| {
            match v {
                Value::I8(x) => write!(s, ", I8:{x}"),
                Value::U8(x) => write!(s, ", U8:{x}"),
                Value::I16(x) => write!(s, ", I16:{x}"),
                Value::U16(x) => write!(s, ", U16:{x}"),
                Value::I32(x) => write!(s, ", I32:{x}"),
                Value::U32(x) => write!(s, ", U32:{x}"),
                Value::I64(x) => write!(s, ", I64:{x}"),
                Value::U64(x) => write!(s, ", U64:{x}"),
                Value::Str(x) => write!(s, ", STR:'{x}'"),
                Value::Buf(_) => write!(s, ", BUF:"),
                Value::F32(x) => write!(s, ", F32:{}", super::format::format_g(f64::from(*x), 7)),
                Value::F64(x) => write!(s, ", F64:{}", super::format::format_g(*x, 7)),
                Value::Fd(x) => write!(s, ", FD:{x}"),
            }
            .ok();
            Ok(())
        })?;
        s.push('}');

        if max_len == 0 {
            return Ok(String::new());
        }
        let cap = max_len - 1;
        if s.len() > cap {
            s.truncate(cap);
            if cap >= 4 {
                let start = cap - 4;
                s.replace_range(start..cap, "...}");
            }
        }
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoder;

    fn sample_message() -> Message {
        let mut enc = Encoder::new(99);
        enc.write_i32(-1).unwrap();
        enc.write_str("hi").unwrap();
        enc.write_buf(&[0xde, 0xad]).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn dump_renders_all_tags() {
        let msg = sample_message();
        let dec = Decoder::new(&msg);
        let s = dec.dump(99, 4096).unwrap();
        assert_eq!(s, "{ID:99, I32:-1, STR:'hi', BUF:}");
    }

    #[test]
    fn dump_truncates_with_ellipsis() {
        let msg = sample_message();
        let dec = Decoder::new(&msg);
        let s = dec.dump(99, 16).unwrap();
        assert_eq!(s.len(), 15);
        assert!(s.ends_with("...}"));
    }

    #[test]
    fn rejects_string_of_length_one_as_invalid() {
        let mut msg = Message::new(1);
        let mut pos = msg.payload_start();
        msg.buffer().write_byte(&mut pos, ArgType::Str as u8).unwrap();
        msg.buffer().write_byte(&mut pos, 1).unwrap();
        msg.buffer().write_byte(&mut pos, 0).unwrap();
        msg.finish().unwrap();

        let mut dec = Decoder::new(&msg);
        assert!(dec.read_str().is_err());
    }

    #[test]
    fn rejects_string_whose_declared_length_exceeds_payload() {
        let mut msg = Message::new(1);
        let mut pos = msg.payload_start();
        msg.buffer().write_byte(&mut pos, ArgType::Str as u8).unwrap();
        msg.buffer().write_byte(&mut pos, 100).unwrap();
        msg.buffer().write_byte(&mut pos, b'h').unwrap();
        msg.finish().unwrap();

        let mut dec = Decoder::new(&msg);
        assert!(dec.read_str().is_err());
    }

    #[test]
    fn mismatched_tag_is_rejected_without_advancing() {
        let msg = sample_message();
        let mut dec = Decoder::new(&msg);
        let before = dec.position();
        assert!(dec.read_u32().is_err());
        assert_eq!(dec.position(), before);
    }

    #[test]
    fn full_type_roundtrip_matches_every_field_and_dump_string() {
        let mut enc = Encoder::new(42);
        enc.write_i8(-32).unwrap();
        enc.write_u8(212).unwrap();
        enc.write_i16(-1000).unwrap();
        enc.write_u16(23000).unwrap();
        enc.write_i32(-71000).unwrap();
        enc.write_u32(3_000_000_000).unwrap();
        enc.write_i64(-4_000_000_000).unwrap();
        enc.write_u64(10_000_000_000_000_000_000).unwrap();
        enc.write_str("Hello World !!!").unwrap();
        enc.write_buf(b"hELLO wORLD ???").unwrap();
        enc.write_f32(3.141_592_7).unwrap();
        enc.write_f64(std::f64::consts::PI).unwrap();
        let msg = enc.finish().unwrap();
        assert_eq!(msg.id(), 42);

        // Tags 0x01-0x04 are raw/little-endian bytes, not varints: i8/u8 are
        // one raw byte each, i16/u16 are two bytes little-endian.
        let mut pos = msg.payload_start();
        let wire = msg.buffer().with_slice(&mut pos, 10, |b| b.to_vec()).unwrap();
        assert_eq!(
            wire,
            vec![
                ArgType::I8 as u8, 0xe0, // -32 as u8
                ArgType::U8 as u8, 212,
                ArgType::I16 as u8, 0x18, 0xfc, // -1000 little-endian
                ArgType::U16 as u8, 0xd8, 0x59, // 23000 little-endian
            ]
        );

        let mut dec = Decoder::new(&msg);
        assert_eq!(dec.read_i8().unwrap(), -32);
        assert_eq!(dec.read_u8().unwrap(), 212);
        assert_eq!(dec.read_i16().unwrap(), -1000);
        assert_eq!(dec.read_u16().unwrap(), 23000);
        assert_eq!(dec.read_i32().unwrap(), -71000);
        assert_eq!(dec.read_u32().unwrap(), 3_000_000_000);
        assert_eq!(dec.read_i64().unwrap(), -4_000_000_000);
        assert_eq!(dec.read_u64().unwrap(), 10_000_000_000_000_000_000);
        assert_eq!(dec.read_str().unwrap(), "Hello World !!!");
        assert_eq!(dec.read_buf().unwrap(), b"hELLO wORLD ???");
        assert_eq!(dec.read_f32().unwrap(), 3.141_592_7_f32);
        assert_eq!(dec.read_f64().unwrap(), std::f64::consts::PI);

        let dump = Decoder::new(&msg).dump(42, 4096).unwrap();
        assert_eq!(
            dump,
            "{ID:42, I8:-32, U8:212, I16:-1000, U16:23000, I32:-71000, \
U32:3000000000, I64:-4000000000, U64:10000000000000000000, \
STR:'Hello World !!!', BUF:, F32:3.141593, F64:3.141593}"
        );
    }

    #[test]
    fn readv_typed_roundtrip() {
        let msg = sample_message();
        let mut dec = Decoder::new(&msg);
        let values = dec.read("%d%ms%p%u").unwrap();
        assert_eq!(values[0], Value::I32(-1));
        assert_eq!(values[1], Value::Str("hi".into()));
        assert_eq!(values[2], Value::Buf(vec![0xde, 0xad]));
    }

    #[test]
    fn bare_percent_s_is_rejected_on_read() {
        let msg = sample_message();
        let mut dec = Decoder::new(&msg);
        assert!(dec.read("%d%s").is_err());
    }
}
