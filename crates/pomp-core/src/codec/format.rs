//! Shared printf/scanf-style format string walking, used by both the
//! encoder (writing typed or CLI-string arguments) and the decoder (reading
//! into a vector of typed values). Grounded on the `again:`-labelled width
//! accumulation loop shared by `encoder_writev_internal` and
//! `pomp_decoder_readv` in the reference implementation.

use crate::error::{PompError, Result};

bitflags::bitflags! {
    /// Integer width modifiers accumulated while walking a conversion
    /// specifier (`%l`, `%ll`, `%h`, `%hh`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WidthFlags: u8 {
        const L  = 0x01;
        const LL = 0x02;
        const H  = 0x04;
        const HH = 0x08;
        /// `%m` prefix on `%s`: read-side dynamic allocation, requesting an
        /// owned copy rather than a borrow into the message buffer.
        const M  = 0x10;
    }
}

/// A single conversion parsed out of a format string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    SignedInt(WidthFlags),
    UnsignedInt(WidthFlags),
    /// `dynamic` is true for `%ms`, false for a bare `%s`. A bare `%s` is
    /// valid to write but must be rejected when reading (see `Decoder::read`).
    Str { dynamic: bool },
    Buf,
    Float(WidthFlags),
    Fd,
}

/// A typed value produced by the decoder, or consumed by the encoder's
/// typed-write path. One variant per wire argument type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Str(String),
    Buf(Vec<u8>),
    F32(f32),
    F64(f64),
    Fd(std::os::fd::RawFd),
}

/// Walks a format string, calling `visit` for each conversion found.
/// `visit` receives the conversion char consumed (for `%p%u` pairs this is
/// `'p'`) along with the accumulated width flags.
pub fn for_each_conversion(fmt: &str, mut visit: impl FnMut(Conversion) -> Result<()>) -> Result<()> {
    let bytes = fmt.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        i += 1;
        if c != '%' {
            return Err(PompError::InvalidArgument("format string: expected '%'"));
        }
        let mut flags = WidthFlags::empty();
        loop {
            if i >= bytes.len() {
                return Err(PompError::InvalidArgument("format string: truncated conversion"));
            }
            let c = bytes[i] as char;
            i += 1;
            match c {
                'l' => {
                    if bytes.get(i) == Some(&b'l') {
                        i += 1;
                        flags |= WidthFlags::LL;
                    } else {
                        flags |= WidthFlags::L;
                    }
                }
                'h' => {
                    if bytes.get(i) == Some(&b'h') {
                        i += 1;
                        flags |= WidthFlags::HH;
                    } else {
                        flags |= WidthFlags::H;
                    }
                }
                'm' => {
                    flags |= WidthFlags::M;
                }
                'd' | 'i' => {
                    visit(Conversion::SignedInt(flags))?;
                    break;
                }
                'u' => {
                    visit(Conversion::UnsignedInt(flags))?;
                    break;
                }
                's' => {
                    visit(Conversion::Str { dynamic: flags.contains(WidthFlags::M) })?;
                    break;
                }
                'p' => {
                    if bytes.get(i) != Some(&b'%') || bytes.get(i + 1) != Some(&b'u') {
                        return Err(PompError::InvalidArgument("format string: expected %u after %p"));
                    }
                    i += 2;
                    visit(Conversion::Buf)?;
                    break;
                }
                'f' | 'F' | 'e' | 'E' | 'g' | 'G' => {
                    if flags.intersects(WidthFlags::LL | WidthFlags::H | WidthFlags::HH) {
                        return Err(PompError::InvalidArgument("format string: unsupported float width"));
                    }
                    visit(Conversion::Float(flags))?;
                    break;
                }
                'x' => {
                    if !flags.is_empty() {
                        return Err(PompError::InvalidArgument("format string: unsupported width for %x"));
                    }
                    visit(Conversion::Fd)?;
                    break;
                }
                _ => return Err(PompError::InvalidArgument("format string: invalid conversion specifier")),
            }
        }
    }
    Ok(())
}

/// Decodes a hex-nibble string (as produced by the `%p%u` CLI/argv write
/// path) into raw bytes. Grounded on `parse_buffer_argv`: when the input has
/// an odd number of hex digits relative to `len`, the first output byte is
/// padded by treating the leading single hex digit as a full byte value.
pub fn parse_hex_buffer(s: &str, len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let bytes = s.as_bytes();
    if len == 0 {
        return Ok(out);
    }
    let mut pos = if bytes.len() % 2 == 1 {
        let b = parse_hex_byte(&s[0..1])?;
        out.push(b);
        1
    } else {
        let b = parse_hex_byte(&s[0..2])?;
        out.push(b);
        2
    };
    while out.len() < len {
        if pos + 2 > bytes.len() {
            return Err(PompError::InvalidArgument("hex buffer argument too short"));
        }
        out.push(parse_hex_byte(&s[pos..pos + 2])?);
        pos += 2;
    }
    Ok(out)
}

fn parse_hex_byte(s: &str) -> Result<u8> {
    u8::from_str_radix(s, 16).map_err(|_| PompError::InvalidArgument("invalid hex digit in buffer argument"))
}

/// Formats `value` the way C's `printf("%.*g", sig, value)` would: `sig`
/// significant digits, switching between fixed and scientific notation by
/// magnitude and stripping trailing zeros. Used by [`super::decoder::Decoder::dump`],
/// grounded on `dump_append(ctx, ..., ", F32:%.7g", ...)` /
/// `", F64:%.7g", ...)` in the reference implementation.
pub fn format_g(value: f64, sig: usize) -> String {
    if value == 0.0 {
        return "0".to_owned();
    }
    if !value.is_finite() {
        return if value.is_nan() { "nan".to_owned() } else if value > 0.0 { "inf".to_owned() } else { "-inf".to_owned() };
    }
    let sig = sig.max(1);
    let sci = format!("{:.*e}", sig - 1, value);
    let epos = sci.find('e').expect("scientific format always has an exponent");
    let exp: i32 = sci[epos + 1..].parse().expect("exponent is always a valid integer");
    if exp < -4 || exp >= sig as i32 {
        let mantissa = strip_trailing_zeros(&sci[..epos]);
        format!("{mantissa}e{}{:02}", if exp < 0 { "-" } else { "+" }, exp.abs())
    } else {
        let decimals = (sig as i32 - 1 - exp).max(0) as usize;
        let fixed = format!("{value:.decimals$}");
        strip_trailing_zeros(&fixed)
    }
}

fn strip_trailing_zeros(s: &str) -> String {
    if !s.contains('.') {
        return s.to_owned();
    }
    let trimmed = s.trim_end_matches('0');
    trimmed.strip_suffix('.').unwrap_or(trimmed).to_owned()
}

#[cfg(test)]
mod format_g_tests {
    use super::format_g;

    #[test]
    fn matches_reference_sample_values() {
        assert_eq!(format_g(3.14159274_f32 as f64, 7), "3.141593");
        assert_eq!(format_g(std::f64::consts::PI, 7), "3.141593");
    }

    #[test]
    fn strips_trailing_zeros() {
        assert_eq!(format_g(1.5, 7), "1.5");
        assert_eq!(format_g(100.0, 7), "100");
    }

    #[test]
    fn uses_scientific_notation_outside_range() {
        assert_eq!(format_g(0.00001234, 3), "1.23e-05");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_mixed_conversions() {
        let mut seen = Vec::new();
        for_each_conversion("%d%llu%ms%f", |c| {
            seen.push(c);
            Ok(())
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![
                Conversion::SignedInt(WidthFlags::empty()),
                Conversion::UnsignedInt(WidthFlags::LL),
                Conversion::Str { dynamic: true },
                Conversion::Float(WidthFlags::empty()),
            ]
        );
    }

    #[test]
    fn buffer_conversion_requires_u_suffix() {
        assert!(for_each_conversion("%p%d", |_| Ok(())).is_err());
    }

    #[test]
    fn bare_s_parses_as_non_dynamic_str() {
        let mut seen = None;
        for_each_conversion("%s", |c| {
            seen = Some(c);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, Some(Conversion::Str { dynamic: false }));
    }

    #[test]
    fn parse_hex_buffer_even_length() {
        assert_eq!(parse_hex_buffer("cafe", 2).unwrap(), vec![0xca, 0xfe]);
    }

    #[test]
    fn parse_hex_buffer_odd_length_pads_first_nibble() {
        // "abc" -> first byte from "a" (0x0a), then "bc" (0xbc)
        assert_eq!(parse_hex_buffer("abc", 2).unwrap(), vec![0x0a, 0xbc]);
    }
}
