//! NDR (network data representation) helpers for the smartcard ioctl bodies (§4.13).
//!
//! Fixed-size fields are encoded in-line. Variable-sized fields (strings, byte arrays) are
//! encoded as a 0x0002xxxx "pointer" in place of the field, with the real bytes appended at
//! the end of the message in pointer order — reverse-engineered from FreeRDP's
//! `smartcard_pack.c` and retained here verbatim since the wire format is a hard external
//! constraint, not an implementation choice.

use rdpcore_core::{ensure_size, invalid_field_err};
use rdpcore_core::{DecodeResult, EncodeResult, ReadCursor, WriteCursor};

const NAME: &str = "ndr";

pub fn encode_ptr(length: Option<u32>, index: &mut u32, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
    ensure_size!(ctx: NAME, in: dst, size: ptr_size(length.is_some()));
    if let Some(length) = length {
        dst.write_u32(length);
    }
    dst.write_u32(0x0002_0000 + *index * 4);
    *index += 1;
    Ok(())
}

pub fn decode_ptr(src: &mut ReadCursor<'_>, index: &mut u32) -> DecodeResult<u32> {
    ensure_size!(ctx: NAME, in: src, size: 4);
    let ptr = src.read_u32();
    if ptr == 0 {
        // NULL pointer: valid, index is not consumed.
        return Ok(ptr);
    }
    let expected = 0x0002_0000 + *index * 4;
    *index += 1;
    if ptr != expected {
        return Err(invalid_field_err!(NAME, "ptr", "pointer out of sequence"));
    }
    Ok(ptr)
}

pub const fn ptr_size(with_length: bool) -> usize {
    if with_length {
        8
    } else {
        4
    }
}

/// Reads a conformant-varying UTF-16 string value (length, offset, length again, then the
/// characters themselves, 4-byte aligned).
pub fn read_unicode_string_value(src: &mut ReadCursor<'_>) -> DecodeResult<String> {
    ensure_size!(ctx: NAME, in: src, size: 12);
    let byte_len = src.read_u32();
    let _offset = src.read_u32();
    let _byte_len_again = src.read_u32();

    let char_len = (byte_len / 2) as usize;
    ensure_size!(ctx: NAME, in: src, size: char_len * 2);
    let units: Vec<u16> = (0..char_len).map(|_| src.read_u16()).collect();
    let s = String::from_utf16_lossy(&units);
    let s = s.trim_end_matches('\0').to_owned();

    if byte_len % 4 != 0 {
        ensure_size!(ctx: NAME, in: src, size: 2);
        let _pad = src.read_u16();
    }

    Ok(s)
}

/// Writes a conformant-varying UTF-16 string pointer + value pair.
pub fn write_unicode_string_ptr(value: &str, index: &mut u32, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
    let byte_len = u32::try_from(value.encode_utf16().count() * 2 + 2).unwrap_or(u32::MAX);
    encode_ptr(Some(byte_len), index, dst)
}

pub fn write_unicode_string_value(value: &str, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
    let units: Vec<u16> = value.encode_utf16().chain(std::iter::once(0)).collect();
    let byte_len = u32::try_from(units.len() * 2).unwrap_or(u32::MAX);
    ensure_size!(ctx: NAME, in: dst, size: 12 + units.len() * 2 + if units.len() % 2 != 0 { 2 } else { 0 });
    dst.write_u32(byte_len);
    dst.write_u32(0);
    dst.write_u32(byte_len);
    for unit in &units {
        dst.write_u16(*unit);
    }
    if units.len() % 2 != 0 {
        dst.write_u16(0);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_sequence_is_validated() {
        let mut buf = [0u8; 8];
        let mut idx = 0;
        {
            let mut cursor = WriteCursor::new(&mut buf);
            encode_ptr(None, &mut idx, &mut cursor).unwrap();
            encode_ptr(None, &mut idx, &mut cursor).unwrap();
        }
        let mut cursor = ReadCursor::new(&buf);
        let mut idx = 0;
        assert_eq!(decode_ptr(&mut cursor, &mut idx).unwrap(), 0x0002_0000);
        assert_eq!(decode_ptr(&mut cursor, &mut idx).unwrap(), 0x0002_0004);
    }
}
