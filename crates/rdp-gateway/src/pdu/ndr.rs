//! NDR (network data representation) helpers for the TSGU packet bodies (§4.7).
//!
//! Reverse-engineered from FreeRDP's `libfreerdp/core/gateway/tsg.c`, which hand-writes
//! every field with `Stream_Write_UINT32`/`Stream_Write_UTF16_String` rather than a generic
//! NDR marshaller; this module gives the same byte-for-byte layout a small set of typed
//! helpers, in the spirit of `rdp_rdpdr::pdu::ndr` (unique pointers, conformant-varying
//! UTF-16 strings) but with the TSGU-specific conventions (NUL-terminated counted strings,
//! `0x00020000`-based pointer numbering restarting per-PDU rather than running globally).

use rdpcore_core::{ensure_size, invalid_field_err};
use rdpcore_core::{DecodeResult, EncodeResult, ReadCursor, WriteCursor};

const NAME: &str = "tsgu_ndr";

/// 4-byte aligns the cursor, zero-writing pad bytes on encode / skipping them on decode.
pub fn align4_write(dst: &mut WriteCursor<'_>, written_since: usize) -> EncodeResult<()> {
    let pad = pad4(written_since);
    if pad > 0 {
        ensure_size!(ctx: NAME, in: dst, size: pad);
        dst.write_slice(&[0u8; 3][..pad]);
    }
    Ok(())
}

pub fn align4_read(src: &mut ReadCursor<'_>, read_since: usize) -> DecodeResult<()> {
    let pad = pad4(read_since);
    if pad > 0 {
        ensure_size!(ctx: NAME, in: src, size: pad);
        let _ = src.read_slice(pad);
    }
    Ok(())
}

fn pad4(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

/// Writes a unique pointer placeholder (`0x0002_0000 + index*4`), or `0` for `None`.
pub fn write_ptr(dst: &mut WriteCursor<'_>, index: u32, present: bool) -> EncodeResult<()> {
    ensure_size!(ctx: NAME, in: dst, size: 4);
    dst.write_u32(if present { 0x0002_0000 + index * 4 } else { 0 });
    Ok(())
}

pub fn read_ptr(src: &mut ReadCursor<'_>) -> DecodeResult<bool> {
    ensure_size!(ctx: NAME, in: src, size: 4);
    Ok(src.read_u32() != 0)
}

/// Writes a NUL-terminated conformant-varying UTF-16 string: `MaxCount`, `Offset=0`,
/// `ActualCount`, then the UTF-16 units (including the trailing NUL), 4-byte aligned
/// (`TsProxyAuthorizeTunnelWriteRequest`'s `MachineName` encoding in `tsg.c`).
pub fn write_counted_utf16_z(dst: &mut WriteCursor<'_>, value: &str) -> EncodeResult<()> {
    let units: Vec<u16> = value.encode_utf16().chain(std::iter::once(0)).collect();
    let count = u32::try_from(units.len()).map_err(|_| invalid_field_err!(NAME, "count", "string too long"))?;
    ensure_size!(ctx: NAME, in: dst, size: 12 + units.len() * 2);
    dst.write_u32(count);
    dst.write_u32(0);
    dst.write_u32(count);
    for unit in &units {
        dst.write_u16(*unit);
    }
    align4_write(dst, units.len() * 2)
}

/// Reads the counterpart of [`write_counted_utf16_z`], trimming the trailing NUL.
pub fn read_counted_utf16_z(src: &mut ReadCursor<'_>) -> DecodeResult<String> {
    ensure_size!(ctx: NAME, in: src, size: 12);
    let max_count = src.read_u32();
    let _offset = src.read_u32();
    let actual_count = src.read_u32();
    if actual_count > max_count {
        return Err(invalid_field_err!(NAME, "actual_count", "exceeds max_count"));
    }
    let char_count = actual_count as usize;
    ensure_size!(ctx: NAME, in: src, size: char_count * 2);
    let units: Vec<u16> = (0..char_count).map(|_| src.read_u16()).collect();
    align4_read(src, char_count * 2)?;
    Ok(String::from_utf16_lossy(&units).trim_end_matches('\0').to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counted_utf16_round_trips() {
        let mut buf = [0u8; 64];
        let encoded_len;
        {
            let mut w = WriteCursor::new(&mut buf);
            write_counted_utf16_z(&mut w, "rdp-host").unwrap();
            encoded_len = buf.len() - w.remaining().len();
        }
        let mut r = ReadCursor::new(&buf[..encoded_len]);
        let value = read_counted_utf16_z(&mut r).unwrap();
        assert_eq!(value, "rdp-host");
        assert!(r.remaining().is_empty());
    }
}
