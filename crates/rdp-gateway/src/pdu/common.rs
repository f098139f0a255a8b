//! [MS-RPCE] connection-oriented RPC common header (§4.2 "RPC common header (16 B)").

use bitflags::bitflags;
use rdpcore_core::{ensure_fixed_part_size, invalid_field_err};
use rdpcore_core::{Decode, DecodeResult, Encode, EncodeResult, ReadCursor, WriteCursor};

/// `packed_drep[4]`: little-endian integers, IEEE floats, ASCII chars — the only
/// representation this client ever sends or accepts.
pub const PACKED_DREP: [u8; 4] = [0x10, 0x00, 0x00, 0x00];

pub const RPC_VERSION_MAJOR: u8 = 5;
pub const RPC_VERSION_MINOR: u8 = 0;

/// `ptype` (DCE 1.1 §12.6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Request = 0x00,
    Ping = 0x01,
    Response = 0x02,
    Fault = 0x03,
    Working = 0x04,
    NoCall = 0x05,
    Reject = 0x06,
    Ack = 0x07,
    ClCancel = 0x08,
    Fack = 0x09,
    CancelAck = 0x0A,
    Bind = 0x0B,
    BindAck = 0x0C,
    BindNak = 0x0D,
    AlterContext = 0x0E,
    AlterContextResp = 0x0F,
    RpcAuth3 = 0x10,
    Shutdown = 0x11,
    CoCancel = 0x12,
    Orphaned = 0x13,
    Rts = 0x14,
}

impl TryFrom<u8> for PacketType {
    type Error = rdpcore_core::DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::Request,
            0x01 => Self::Ping,
            0x02 => Self::Response,
            0x03 => Self::Fault,
            0x04 => Self::Working,
            0x05 => Self::NoCall,
            0x06 => Self::Reject,
            0x07 => Self::Ack,
            0x08 => Self::ClCancel,
            0x09 => Self::Fack,
            0x0A => Self::CancelAck,
            0x0B => Self::Bind,
            0x0C => Self::BindAck,
            0x0D => Self::BindNak,
            0x0E => Self::AlterContext,
            0x0F => Self::AlterContextResp,
            0x10 => Self::RpcAuth3,
            0x11 => Self::Shutdown,
            0x12 => Self::CoCancel,
            0x13 => Self::Orphaned,
            0x14 => Self::Rts,
            _ => return Err(invalid_field_err!("RPC_COMMON_HEADER", "ptype", "unknown ptype")),
        })
    }
}

bitflags! {
    /// `pfc_flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PfcFlags: u8 {
        const FIRST_FRAG = 0x01;
        const LAST_FRAG = 0x02;
        const PENDING_CANCEL = 0x04;
        const RESERVED_1 = 0x08;
        const CONC_MPX = 0x10;
        const DID_NOT_EXECUTE = 0x20;
        const MAYBE = 0x40;
        const OBJECT_UUID = 0x80;
    }
}

/// The 16-byte common header prefixing every connection-oriented RPC PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcCommonHeader {
    pub ptype: PacketType,
    pub pfc_flags: PfcFlags,
    pub frag_length: u16,
    pub auth_length: u16,
    pub call_id: u32,
}

impl RpcCommonHeader {
    pub const FIXED_PART_SIZE: usize = 16;
    const NAME: &'static str = "RPC_COMMON_HEADER";

    #[must_use]
    pub fn new(ptype: PacketType, pfc_flags: PfcFlags, frag_length: u16, auth_length: u16, call_id: u32) -> Self {
        Self {
            ptype,
            pfc_flags,
            frag_length,
            auth_length,
            call_id,
        }
    }
}

impl Decode<'_> for RpcCommonHeader {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);
        let rpc_vers = src.read_u8();
        let rpc_vers_minor = src.read_u8();
        if rpc_vers != RPC_VERSION_MAJOR || rpc_vers_minor != RPC_VERSION_MINOR {
            return Err(invalid_field_err!("rpc_vers", "must be 5.0"));
        }
        let ptype = PacketType::try_from(src.read_u8())?;
        let pfc_flags = PfcFlags::from_bits_truncate(src.read_u8());
        let packed_drep = src.read_array::<4>();
        if packed_drep != PACKED_DREP {
            return Err(invalid_field_err!("packed_drep", "only little-endian/ASCII/IEEE supported"));
        }
        let frag_length = src.read_u16();
        let auth_length = src.read_u16();
        let call_id = src.read_u32();
        Ok(Self {
            ptype,
            pfc_flags,
            frag_length,
            auth_length,
            call_id,
        })
    }
}

impl Encode for RpcCommonHeader {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_fixed_part_size!(in: dst);
        dst.write_u8(RPC_VERSION_MAJOR);
        dst.write_u8(RPC_VERSION_MINOR);
        dst.write_u8(self.ptype as u8);
        dst.write_u8(self.pfc_flags.bits());
        dst.write_array(PACKED_DREP);
        dst.write_u16(self.frag_length);
        dst.write_u16(self.auth_length);
        dst.write_u32(self.call_id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
    }
}

/// [2.2.2.11] `SEC_TRAILER`, 8 bytes, immediately preceding the auth token and located at
/// `frag_length - auth_length - 8` (§4.2 "auth trailer"), 4-byte aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecTrailer {
    pub auth_type: AuthType,
    pub auth_level: AuthLevel,
    pub auth_pad_length: u8,
    pub auth_context_id: u32,
}

impl SecTrailer {
    pub const FIXED_PART_SIZE: usize = 8;
    const NAME: &'static str = "SEC_TRAILER";
}

impl Decode<'_> for SecTrailer {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);
        let auth_type = AuthType::try_from(src.read_u8())?;
        let auth_level = AuthLevel::try_from(src.read_u8())?;
        let auth_pad_length = src.read_u8();
        let _auth_reserved = src.read_u8();
        let auth_context_id = src.read_u32();
        Ok(Self {
            auth_type,
            auth_level,
            auth_pad_length,
            auth_context_id,
        })
    }
}

impl Encode for SecTrailer {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_fixed_part_size!(in: dst);
        dst.write_u8(self.auth_type as u8);
        dst.write_u8(self.auth_level as u8);
        dst.write_u8(self.auth_pad_length);
        dst.write_u8(0);
        dst.write_u32(self.auth_context_id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthType {
    WinNt = 0x0A,
}

impl TryFrom<u8> for AuthType {
    type Error = rdpcore_core::DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0A => Ok(Self::WinNt),
            _ => Err(invalid_field_err!("SEC_TRAILER", "auth_type", "unsupported auth type")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthLevel {
    /// `RPC_C_AUTHN_LEVEL_PKT_INTEGRITY`: sign, never seal (§4.3, SPEC_FULL §4).
    PktIntegrity = 0x05,
}

impl TryFrom<u8> for AuthLevel {
    type Error = rdpcore_core::DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x05 => Ok(Self::PktIntegrity),
            _ => Err(invalid_field_err!("SEC_TRAILER", "auth_level", "unsupported auth level")),
        }
    }
}

/// 4-byte aligns `offset` upward, per the `sec_trailer`'s alignment rule (§4.2).
#[must_use]
pub fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}

/// 8-byte aligns `offset` upward, per the stub-data alignment rule (§4.2).
#[must_use]
pub fn align8(offset: usize) -> usize {
    (offset + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers_round_up() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(5), 8);
        assert_eq!(align8(9), 16);
    }

    #[test]
    fn common_header_round_trips() {
        let header = RpcCommonHeader::new(PacketType::Request, PfcFlags::FIRST_FRAG | PfcFlags::LAST_FRAG, 100, 16, 7);
        let mut buf = [0u8; RpcCommonHeader::FIXED_PART_SIZE];
        let mut writer = WriteCursor::new(&mut buf);
        header.encode(&mut writer).unwrap();
        let mut reader = ReadCursor::new(&buf);
        let decoded = RpcCommonHeader::decode(&mut reader).unwrap();
        assert_eq!(decoded, header);
    }
}
