//! Argument encoder: writes a tagged, typed argument list into a
//! [`Message`]'s payload region. Grounded on `pomp_encoder.c`.

use std::os::fd::RawFd;

use super::format::{for_each_conversion, parse_hex_buffer, Conversion, Value, WidthFlags};
use crate::{
    error::{PompError, Result},
    message::Message,
    varint::{encode_varint, zigzag_encode_i32, zigzag_encode_i64},
    wire::{ArgType, MAX_STR_LEN},
};

/// Wraps a [`Message`] and appends typed arguments to it at a running cursor.
/// Every `write_*` call advances the cursor and leaves the message unfinished
/// until [`Encoder::finish`] is called.
pub struct Encoder {
    msg: Message,
    pos: usize,
}

impl Encoder {
    /// Starts encoding a new message with the given id.
    pub fn new(msgid: u32) -> Self {
        let msg = Message::new(msgid);
        let pos = msg.payload_start();
        Self { msg, pos }
    }

    fn tag(&mut self, t: ArgType) -> Result<()> {
        self.msg.buffer().write_byte(&mut self.pos, t as u8)
    }

    fn varint(&mut self, v: u64) -> Result<()> {
        let mut tmp = Vec::with_capacity(10);
        encode_varint(v, &mut tmp);
        self.msg.buffer().write(&mut self.pos, &tmp)
    }

    pub fn write_i8(&mut self, v: i8) -> Result<()> {
        self.tag(ArgType::I8)?;
        self.msg.buffer().write_byte(&mut self.pos, v as u8)
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.tag(ArgType::U8)?;
        self.msg.buffer().write_byte(&mut self.pos, v)
    }

    pub fn write_i16(&mut self, v: i16) -> Result<()> {
        self.tag(ArgType::I16)?;
        self.msg.buffer().write(&mut self.pos, &v.to_le_bytes())
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.tag(ArgType::U16)?;
        self.msg.buffer().write(&mut self.pos, &v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.tag(ArgType::I32)?;
        self.varint(u64::from(zigzag_encode_i32(v)))
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.tag(ArgType::U32)?;
        self.varint(u64::from(v))
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        self.tag(ArgType::I64)?;
        self.varint(zigzag_encode_i64(v))
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.tag(ArgType::U64)?;
        self.varint(v)
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.tag(ArgType::F32)?;
        self.msg.buffer().write(&mut self.pos, &v.to_le_bytes())
    }

    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        self.tag(ArgType::F64)?;
        self.msg.buffer().write(&mut self.pos, &v.to_le_bytes())
    }

    /// Writes a NUL-terminated string. The wire length prefix (a varint
    /// encoding a u16) counts the trailing NUL.
    pub fn write_str(&mut self, s: &str) -> Result<()> {
        if s.is_empty() {
            return Err(PompError::InvalidArgument("empty strings are rejected"));
        }
        if s.len() + 1 > MAX_STR_LEN {
            return Err(PompError::InvalidArgument("string too long"));
        }
        self.tag(ArgType::Str)?;
        self.varint((s.len() + 1) as u64)?;
        self.msg.buffer().write(&mut self.pos, s.as_bytes())?;
        self.msg.buffer().write_byte(&mut self.pos, 0)
    }

    /// Writes a raw byte buffer. The wire length prefix is a varint encoding
    /// a u32, and unlike strings the bytes are not NUL-terminated.
    pub fn write_buf(&mut self, data: &[u8]) -> Result<()> {
        self.tag(ArgType::Buf)?;
        self.varint(data.len() as u64)?;
        self.msg.buffer().write(&mut self.pos, data)
    }

    pub fn write_fd(&mut self, fd: RawFd) -> Result<()> {
        self.tag(ArgType::Fd)?;
        self.msg.buffer().write_fd(&mut self.pos, fd)
    }

    fn write_value(&mut self, v: &Value) -> Result<()> {
        match *v {
            Value::I8(x) => self.write_i8(x),
            Value::U8(x) => self.write_u8(x),
            Value::I16(x) => self.write_i16(x),
            Value::U16(x) => self.write_u16(x),
            Value::I32(x) => self.write_i32(x),
            Value::U32(x) => self.write_u32(x),
            Value::I64(x) => self.write_i64(x),
            Value::U64(x) => self.write_u64(x),
            Value::F32(x) => self.write_f32(x),
            Value::F64(x) => self.write_f64(x),
            Value::Fd(x) => self.write_fd(x),
            Value::Str(ref s) => self.write_str(s),
            Value::Buf(ref b) => self.write_buf(b),
        }
    }

    /// printf-style typed write: `fmt` drives which conversion is expected at
    /// each position, `values` supplies the already-typed arguments. The
    /// conversion's width flags select which integer width a given slot
    /// accepts; a mismatch with the supplied [`Value`] variant is an error.
    pub fn write(&mut self, fmt: &str, values: &[Value]) -> Result<()> {
        let mut it = values.iter();
        for_each_conversion(fmt, |conv| {
            let v = it.next().ok_or(PompError::InvalidArgument("not enough arguments for format"))?;
            if !conversion_matches(conv, v) {
                return Err(PompError::InvalidArgument("argument type does not match format conversion"));
            }
            self.write_value(v)
        })?;
        if it.next().is_some() {
            return Err(PompError::InvalidArgument("too many arguments for format"));
        }
        Ok(())
    }

    /// CLI-oriented write: every argument is supplied as a string, parsed
    /// according to the conversion found at that position in `fmt`. Buffer
    /// conversions (`%p%u`) consume two argv slots: a hex digit string and a
    /// decimal length.
    pub fn write_argv(&mut self, fmt: &str, argv: &[&str]) -> Result<()> {
        let mut it = argv.iter();
        for_each_conversion(fmt, |conv| {
            let next = || it.next().copied().ok_or(PompError::InvalidArgument("not enough arguments for format"));
            match conv {
                Conversion::SignedInt(flags) => {
                    let s = next()?;
                    let v: i64 = s.parse().map_err(|_| PompError::InvalidArgument("invalid integer argument"))?;
                    self.write_signed_for_width(flags, v)
                }
                Conversion::UnsignedInt(flags) => {
                    let s = next()?;
                    let v: u64 = s.parse().map_err(|_| PompError::InvalidArgument("invalid integer argument"))?;
                    self.write_unsigned_for_width(flags, v)
                }
                Conversion::Str { .. } => self.write_str(next()?),
                Conversion::Buf => {
                    let hex = next()?;
                    let len_s = next()?;
                    let len: usize = len_s.parse().map_err(|_| PompError::InvalidArgument("invalid buffer length argument"))?;
                    let data = parse_hex_buffer(hex, len)?;
                    self.write_buf(&data)
                }
                Conversion::Float(flags) => {
                    let s = next()?;
                    let v: f64 = s.parse().map_err(|_| PompError::InvalidArgument("invalid float argument"))?;
                    if flags.contains(WidthFlags::L) {
                        self.write_f64(v)
                    } else {
                        self.write_f32(v as f32)
                    }
                }
                Conversion::Fd => {
                    let s = next()?;
                    let v: RawFd = s.parse().map_err(|_| PompError::InvalidArgument("invalid fd argument"))?;
                    self.write_fd(v)
                }
            }
        })?;
        if it.next().is_some() {
            return Err(PompError::InvalidArgument("too many arguments for format"));
        }
        Ok(())
    }

    fn write_signed_for_width(&mut self, flags: WidthFlags, v: i64) -> Result<()> {
        if flags.contains(WidthFlags::LL) {
            self.write_i64(v)
        } else if flags.contains(WidthFlags::L) {
            self.write_i32(v as i32)
        } else if flags.contains(WidthFlags::HH) {
            self.write_i8(v as i8)
        } else if flags.contains(WidthFlags::H) {
            self.write_i16(v as i16)
        } else {
            self.write_i32(v as i32)
        }
    }

    fn write_unsigned_for_width(&mut self, flags: WidthFlags, v: u64) -> Result<()> {
        if flags.contains(WidthFlags::LL) {
            self.write_u64(v)
        } else if flags.contains(WidthFlags::L) {
            self.write_u32(v as u32)
        } else if flags.contains(WidthFlags::HH) {
            self.write_u8(v as u8)
        } else if flags.contains(WidthFlags::H) {
            self.write_u16(v as u16)
        } else {
            self.write_u32(v as u32)
        }
    }

    /// Finalizes the message: stamps the header and returns the sealed frame.
    pub fn finish(mut self) -> Result<Message> {
        self.msg.finish()?;
        Ok(self.msg)
    }
}

fn conversion_matches(conv: Conversion, v: &Value) -> bool {
    match (conv, v) {
        (Conversion::SignedInt(f), Value::I64(_)) => f.contains(WidthFlags::LL),
        (Conversion::SignedInt(f), Value::I32(_)) => !f.contains(WidthFlags::LL) && !f.contains(WidthFlags::H) && !f.contains(WidthFlags::HH),
        (Conversion::SignedInt(f), Value::I16(_)) => f.contains(WidthFlags::H) && !f.contains(WidthFlags::HH),
        (Conversion::SignedInt(f), Value::I8(_)) => f.contains(WidthFlags::HH),
        (Conversion::UnsignedInt(f), Value::U64(_)) => f.contains(WidthFlags::LL),
        (Conversion::UnsignedInt(f), Value::U32(_)) => !f.contains(WidthFlags::LL) && !f.contains(WidthFlags::H) && !f.contains(WidthFlags::HH),
        (Conversion::UnsignedInt(f), Value::U16(_)) => f.contains(WidthFlags::H) && !f.contains(WidthFlags::HH),
        (Conversion::UnsignedInt(f), Value::U8(_)) => f.contains(WidthFlags::HH),
        (Conversion::Str { .. }, Value::Str(_)) => true,
        (Conversion::Buf, Value::Buf(_)) => true,
        (Conversion::Float(_), Value::F32(_) | Value::F64(_)) => true,
        (Conversion::Fd, Value::Fd(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoder;

    #[test]
    fn encodes_and_decodes_typed_roundtrip() {
        let mut enc = Encoder::new(1);
        enc.write_i32(-7).unwrap();
        enc.write_u32(42).unwrap();
        enc.write_str("hello").unwrap();
        enc.write_buf(&[1, 2, 3]).unwrap();
        enc.write_f64(std::f64::consts::PI).unwrap();
        let msg = enc.finish().unwrap();

        let mut dec = Decoder::new(&msg);
        assert_eq!(dec.read_i32().unwrap(), -7);
        assert_eq!(dec.read_u32().unwrap(), 42);
        assert_eq!(dec.read_str().unwrap(), "hello");
        assert_eq!(dec.read_buf().unwrap(), vec![1, 2, 3]);
        assert_eq!(dec.read_f64().unwrap(), std::f64::consts::PI);
    }

    #[test]
    fn write_argv_parses_strings() {
        let mut enc = Encoder::new(2);
        enc.write_argv("%d%s", &["-5", "hi"]).unwrap();
        let msg = enc.finish().unwrap();
        let mut dec = Decoder::new(&msg);
        assert_eq!(dec.read_i32().unwrap(), -5);
        assert_eq!(dec.read_str().unwrap(), "hi");
    }

    #[test]
    fn write_rejects_too_few_arguments() {
        let mut enc = Encoder::new(3);
        assert!(enc.write("%d%d", &[Value::I32(1)]).is_err());
    }

    #[test]
    fn write_str_rejects_empty_string() {
        let mut enc = Encoder::new(4);
        assert!(enc.write_str("").is_err());
    }

    #[test]
    fn write_argv_bare_f_writes_f32_and_lf_writes_f64() {
        let mut enc = Encoder::new(5);
        enc.write_argv("%f%lf", &["1.5", "2.5"]).unwrap();
        let msg = enc.finish().unwrap();
        let mut dec = Decoder::new(&msg);
        assert_eq!(dec.read_f32().unwrap(), 1.5_f32);
        assert_eq!(dec.read_f64().unwrap(), 2.5_f64);
    }
}
