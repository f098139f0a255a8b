//! [MS-RPCE] NDR serialization envelope wrapping every smartcard ioctl body (§4.13).
//!
//! Implementers should avoid [`Encode`]/[`Decode`] directly and instead implement
//! [`HeaderlessEncode`]/[`HeaderlessDecode`], which [`RpcePdu`] wraps with the common type
//! header and 8-byte alignment padding required by the serialization stream.

use std::mem::size_of;

use rdpcore_core::{cast_length, ensure_size, invalid_field_err};
use rdpcore_core::{DecodeError, DecodeResult, EncodeResult, ReadCursor, WriteCursor};

/// Wraps a [`HeaderlessEncode`]/[`HeaderlessDecode`] payload with the [MS-RPCE] common
/// type header (stream header + private header) and trailing 8-byte alignment padding.
#[derive(Debug)]
pub struct RpcePdu<T>(pub T);

impl<T> RpcePdu<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: HeaderlessDecode> RpcePdu<T> {
    pub fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let _stream_header = StreamHeader::decode(src)?;
        let _type_header = TypeHeader::decode(src)?;
        let inner = T::decode(src)?;
        Ok(Self(inner))
    }
}

impl<T: HeaderlessEncode> RpcePdu<T> {
    pub fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: self.0.name(), in: dst, size: self.size());
        StreamHeader::default().encode(dst)?;
        TypeHeader::new(cast_length!("RpcePdu", "size", self.0.size())?).encode(dst)?;
        self.0.encode(dst)?;
        let padding_size = padding_size(&self.0);
        if padding_size > 0 {
            dst.write_slice(&vec![0u8; padding_size]);
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        StreamHeader::size() + TypeHeader::size() + self.0.size() + padding_size(&self.0)
    }
}

/// Implemented by a smartcard ioctl body; [`RpcePdu::encode`] adds the stream/type headers
/// and trailing alignment.
pub trait HeaderlessEncode: std::fmt::Debug {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()>;
    fn name(&self) -> &'static str;
    fn size(&self) -> usize;
}

/// Implemented by a smartcard ioctl body; [`RpcePdu::decode`] strips the stream/type
/// headers before calling this.
pub trait HeaderlessDecode: Sized {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self>;
}

/// [2.2.6.1] Common Type Header for the Serialization Stream.
struct StreamHeader {
    version: u8,
    endianness: Endianness,
    common_header_length: u16,
    filler: u32,
}

impl Default for StreamHeader {
    fn default() -> Self {
        Self {
            version: 1,
            endianness: Endianness::LittleEndian,
            common_header_length: 8,
            filler: 0xCCCC_CCCC,
        }
    }
}

impl StreamHeader {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: "StreamHeader", in: dst, size: Self::size());
        dst.write_u8(self.version);
        dst.write_u8(self.endianness as u8);
        dst.write_u16(self.common_header_length);
        dst.write_u32(self.filler);
        Ok(())
    }

    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: "StreamHeader", in: src, size: Self::size());
        let version = src.read_u8();
        let endianness = Endianness::try_from(src.read_u8())?;
        let common_header_length = src.read_u16();
        let filler = src.read_u32();
        if endianness != Endianness::LittleEndian {
            return Err(invalid_field_err!("StreamHeader", "endianness", "server returned big-endian data"));
        }
        Ok(Self {
            version,
            endianness,
            common_header_length,
            filler,
        })
    }

    fn size() -> usize {
        size_of::<u8>() + size_of::<u8>() + size_of::<u16>() + size_of::<u32>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Endianness {
    BigEndian = 0x00,
    LittleEndian = 0x10,
}

impl TryFrom<u8> for Endianness {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::BigEndian),
            0x10 => Ok(Self::LittleEndian),
            _ => Err(invalid_field_err!("StreamHeader", "Endianness", "unsupported value")),
        }
    }
}

/// [2.2.6.2] Private Header for Constructed Type.
#[derive(Debug)]
struct TypeHeader {
    object_buffer_length: u32,
    filler: u32,
}

impl TypeHeader {
    fn new(object_buffer_length: u32) -> Self {
        Self {
            object_buffer_length,
            filler: 0,
        }
    }

    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: "TypeHeader", in: dst, size: Self::size());
        dst.write_u32(self.object_buffer_length);
        dst.write_u32(self.filler);
        Ok(())
    }

    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: "TypeHeader", in: src, size: Self::size());
        let object_buffer_length = src.read_u32();
        let filler = src.read_u32();
        Ok(Self {
            object_buffer_length,
            filler,
        })
    }

    fn size() -> usize {
        size_of::<u32>() * 2
    }
}

fn padding_size(pdu: &impl HeaderlessEncode) -> usize {
    let tail = pdu.size() % 8;
    if tail > 0 {
        8 - tail
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Probe(u32);

    impl HeaderlessEncode for Probe {
        fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
            ensure_size!(ctx: "Probe", in: dst, size: 4);
            dst.write_u32(self.0);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Probe"
        }

        fn size(&self) -> usize {
            4
        }
    }

    #[test]
    fn pads_to_8_byte_alignment() {
        let pdu = RpcePdu(Probe(7));
        let mut buf = vec![0u8; pdu.size()];
        let mut cursor = WriteCursor::new(&mut buf);
        pdu.encode(&mut cursor).unwrap();
        assert_eq!(pdu.size() % 8, 0);
        assert_eq!(cursor.pos(), pdu.size());
    }
}
