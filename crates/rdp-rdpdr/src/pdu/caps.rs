//! Capability exchange PDUs (§4.2): [`CoreCapability`] wraps the `numCapabilities` envelope,
//! each entry prefixed by a [`CapabilityHeader`].

use std::fmt;

use rdpcore_core::{ensure_fixed_part_size, ensure_size, invalid_field_err, unsupported_value_err};
use rdpcore_core::{Decode, DecodeResult, Encode, EncodeResult, ReadCursor, WriteCursor};

use super::{Component, PacketId, SharedHeader};

/// Capability set type codes (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CapabilityType {
    General = 1,
    Printer = 2,
    Port = 3,
    Drive = 4,
    Smartcard = 5,
}

impl TryFrom<u16> for CapabilityType {
    type Error = rdpcore_core::DecodeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::General,
            2 => Self::Printer,
            3 => Self::Port,
            4 => Self::Drive,
            5 => Self::Smartcard,
            _ => return Err(invalid_field_err!("CapabilityHeader", "CapabilityType", "unknown capability type")),
        })
    }
}

/// `CAPABILITY_HEADER`: `type`, `length` (header + body), `version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityHeader {
    pub cap_type: CapabilityType,
    pub length: u16,
    pub version: u32,
}

impl CapabilityHeader {
    pub const FIXED_PART_SIZE: usize = 8;
    const NAME: &'static str = "CAPABILITY_HEADER";

    pub fn new(cap_type: CapabilityType, version: u32, body_size: usize) -> Self {
        Self {
            cap_type,
            length: (Self::FIXED_PART_SIZE + body_size) as u16,
            version,
        }
    }
}

impl Decode<'_> for CapabilityHeader {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);
        let cap_type = CapabilityType::try_from(src.read_u16())?;
        let length = src.read_u16();
        let version = src.read_u32();
        Ok(Self { cap_type, length, version })
    }
}

impl Encode for CapabilityHeader {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_fixed_part_size!(in: dst);
        dst.write_u16(self.cap_type as u16);
        dst.write_u16(self.length);
        dst.write_u32(self.version);
        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
    }
}

bitflags::bitflags! {
    /// `ioCode1` field of the GENERAL capability: which IRP major functions the peer
    /// supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GeneralIoCode1: u32 {
        const RDPDR_IRP_MJ_CREATE = 0x0000_0001;
        const RDPDR_IRP_MJ_CLEANUP = 0x0000_0002;
        const RDPDR_IRP_MJ_CLOSE = 0x0000_0004;
        const RDPDR_IRP_MJ_READ = 0x0000_0008;
        const RDPDR_IRP_MJ_WRITE = 0x0000_0010;
        const RDPDR_IRP_MJ_FLUSH_BUFFERS = 0x0000_0020;
        const RDPDR_IRP_MJ_SHUTDOWN = 0x0000_0040;
        const RDPDR_IRP_MJ_DEVICE_CONTROL = 0x0000_0080;
        const RDPDR_IRP_MJ_QUERY_VOLUME_INFORMATION = 0x0000_0100;
        const RDPDR_IRP_MJ_SET_VOLUME_INFORMATION = 0x0000_0200;
        const RDPDR_IRP_MJ_QUERY_INFORMATION = 0x0000_0400;
        const RDPDR_IRP_MJ_SET_INFORMATION = 0x0000_0800;
        const RDPDR_IRP_MJ_DIRECTORY_CONTROL = 0x0000_1000;
        const RDPDR_IRP_MJ_LOCK_CONTROL = 0x0000_2000;
        const RDPDR_IRP_MJ_QUERY_SECURITY = 0x0000_4000;
        const RDPDR_IRP_MJ_SET_SECURITY = 0x0000_8000;
    }
}

bitflags::bitflags! {
    /// `extendedPDU` field of the GENERAL capability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExtendedPdu: u32 {
        const RDPDR_DEVICE_REMOVE_PDUS = 0x0000_0001;
        const RDPDR_CLIENT_DISPLAY_NAME_PDU = 0x0000_0002;
        const RDPDR_USER_LOGGEDON_PDU = 0x0000_0004;
    }
}

bitflags::bitflags! {
    /// `extraFlags1` field of the GENERAL capability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExtraFlags1: u32 {
        const ENABLE_ASYNCIO = 0x0000_0001;
    }
}

/// `GENERAL_CAPS_SET` body, carried inside a [`CapabilitySet::General`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneralCapabilitySet {
    pub os_type: u32,
    pub os_version: u32,
    pub protocol_major_version: u16,
    pub protocol_minor_version: u16,
    pub io_code_1: GeneralIoCode1,
    pub io_code_2: u32,
    pub extended_pdu: ExtendedPdu,
    pub extra_flags_1: ExtraFlags1,
    pub extra_flags_2: u32,
    /// Only present when `version >= GENERAL_CAPABILITY_VERSION_02`.
    pub special_type_device_cap: Option<u32>,
}

impl GeneralCapabilitySet {
    pub const VERSION_01: u32 = 1;
    pub const VERSION_02: u32 = 2;
    const NAME: &'static str = "GENERAL_CAPS_SET";

    fn body_size(&self) -> usize {
        32 + if self.special_type_device_cap.is_some() { 4 } else { 0 }
    }

    fn decode(src: &mut ReadCursor<'_>, version: u32) -> DecodeResult<Self> {
        let fixed = if version >= Self::VERSION_02 { 36 } else { 32 };
        ensure_size!(ctx: Self::NAME, in: src, size: fixed);
        let os_type = src.read_u32();
        let os_version = src.read_u32();
        let protocol_major_version = src.read_u16();
        let protocol_minor_version = src.read_u16();
        let io_code_1 = GeneralIoCode1::from_bits_truncate(src.read_u32());
        let io_code_2 = src.read_u32();
        let extended_pdu = ExtendedPdu::from_bits_truncate(src.read_u32());
        let extra_flags_1 = ExtraFlags1::from_bits_truncate(src.read_u32());
        let extra_flags_2 = src.read_u32();
        let special_type_device_cap = (version >= Self::VERSION_02).then(|| src.read_u32());
        Ok(Self {
            os_type,
            os_version,
            protocol_major_version,
            protocol_minor_version,
            io_code_1,
            io_code_2,
            extended_pdu,
            extra_flags_1,
            extra_flags_2,
            special_type_device_cap,
        })
    }

    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: Self::NAME, in: dst, size: self.body_size());
        dst.write_u32(self.os_type);
        dst.write_u32(self.os_version);
        dst.write_u16(self.protocol_major_version);
        dst.write_u16(self.protocol_minor_version);
        dst.write_u32(self.io_code_1.bits());
        dst.write_u32(self.io_code_2);
        dst.write_u32(self.extended_pdu.bits());
        dst.write_u32(self.extra_flags_1.bits());
        dst.write_u32(self.extra_flags_2);
        if let Some(special) = self.special_type_device_cap {
            dst.write_u32(special);
        }
        Ok(())
    }
}

/// A single negotiated capability set, tagged by its [`CapabilityHeader`].
#[derive(Clone, PartialEq, Eq)]
pub enum CapabilitySet {
    General(GeneralCapabilitySet),
    /// PRINTER/PORT/DRIVE/SMARTCARD carry no body beyond the header.
    Printer,
    Port,
    Drive,
    Smartcard,
}

impl CapabilitySet {
    const HEADER_VERSION: u32 = 1;

    fn header(&self) -> CapabilityHeader {
        match self {
            Self::General(set) => {
                let version = if set.special_type_device_cap.is_some() {
                    GeneralCapabilitySet::VERSION_02
                } else {
                    GeneralCapabilitySet::VERSION_01
                };
                CapabilityHeader::new(CapabilityType::General, version, set.body_size())
            }
            Self::Printer => CapabilityHeader::new(CapabilityType::Printer, Self::HEADER_VERSION, 0),
            Self::Port => CapabilityHeader::new(CapabilityType::Port, Self::HEADER_VERSION, 0),
            Self::Drive => CapabilityHeader::new(CapabilityType::Drive, Self::HEADER_VERSION, 0),
            Self::Smartcard => CapabilityHeader::new(CapabilityType::Smartcard, Self::HEADER_VERSION, 0),
        }
    }

    fn decode_one(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let header = CapabilityHeader::decode(src)?;
        let body_size = usize::from(header.length).saturating_sub(CapabilityHeader::FIXED_PART_SIZE);
        ensure_size!(ctx: "CAPABILITY_SET", in: src, size: body_size);
        let (mut body, rest) = src.split_at(body_size);
        let this = match header.cap_type {
            CapabilityType::General => Self::General(GeneralCapabilitySet::decode(&mut body, header.version)?),
            CapabilityType::Printer => Self::Printer,
            CapabilityType::Port => Self::Port,
            CapabilityType::Drive => Self::Drive,
            CapabilityType::Smartcard => Self::Smartcard,
        };
        *src = rest;
        Ok(this)
    }

    fn encode_one(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        self.header().encode(dst)?;
        if let Self::General(set) = self {
            set.encode(dst)?;
        }
        Ok(())
    }

    fn size_one(&self) -> usize {
        CapabilityHeader::FIXED_PART_SIZE
            + match self {
                Self::General(set) => set.body_size(),
                _ => 0,
            }
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::General(set) => write!(f, "{set:?}"),
            Self::Printer => write!(f, "PrinterCapabilitySet"),
            Self::Port => write!(f, "PortCapabilitySet"),
            Self::Drive => write!(f, "DriveCapabilitySet"),
            Self::Smartcard => write!(f, "SmartcardCapabilitySet"),
        }
    }
}

/// Distinguishes which direction a [`CoreCapability`] envelope travels, since the wire
/// layout is identical but the packet id differs (§4.2 / §4.14).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreCapabilityKind {
    ServerCoreCapabilityRequest,
    ClientCoreCapabilityResponse,
}

/// `numCapabilities`-prefixed capability list, either direction.
pub struct CoreCapability {
    pub capabilities: Vec<CapabilitySet>,
    pub kind: CoreCapabilityKind,
}

impl CoreCapability {
    const NAME: &'static str = "CoreCapability";

    pub fn new(capabilities: Vec<CapabilitySet>, kind: CoreCapabilityKind) -> Self {
        Self { capabilities, kind }
    }

    pub fn decode_as(src: &mut ReadCursor<'_>, kind: CoreCapabilityKind) -> DecodeResult<Self> {
        ensure_size!(ctx: Self::NAME, in: src, size: 4);
        let num_capabilities = src.read_u16();
        let _padding = src.read_u16();
        let mut capabilities = Vec::with_capacity(usize::from(num_capabilities));
        for _ in 0..num_capabilities {
            capabilities.push(CoreCapability::decode_one(src)?);
        }
        Ok(Self { capabilities, kind })
    }
}

impl Encode for CoreCapability {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: Self::NAME, in: dst, size: 4);
        let num_capabilities: u16 = self
            .capabilities
            .len()
            .try_into()
            .map_err(|_| unsupported_value_err!(Self::NAME, "numCapabilities", self.capabilities.len().to_string()))?;
        dst.write_u16(num_capabilities);
        dst.write_u16(0);
        for cap in &self.capabilities {
            cap.encode_one(dst)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        4 + self.capabilities.iter().map(CoreCapability::size_one).sum::<usize>()
    }
}

impl fmt::Debug for CoreCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreCapability")
            .field("kind", &self.kind)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Shared packet header this message is framed with, given its direction.
pub fn capability_packet_id(kind: CoreCapabilityKind) -> (Component, PacketId) {
    match kind {
        CoreCapabilityKind::ServerCoreCapabilityRequest => (Component::Core, PacketId::ServerCapability),
        CoreCapabilityKind::ClientCoreCapabilityResponse => (Component::Core, PacketId::ClientCapability),
    }
}

pub fn capability_header_for(kind: CoreCapabilityKind) -> SharedHeader {
    let (component, packet_id) = capability_packet_id(kind);
    SharedHeader::new(component, packet_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdpcore_core::encode_vec;

    #[test]
    fn general_capability_round_trips() {
        let set = GeneralCapabilitySet {
            os_type: 0,
            os_version: 0,
            protocol_major_version: 1,
            protocol_minor_version: 0x0c,
            io_code_1: GeneralIoCode1::RDPDR_IRP_MJ_CREATE | GeneralIoCode1::RDPDR_IRP_MJ_CLOSE,
            io_code_2: 0,
            extended_pdu: ExtendedPdu::RDPDR_DEVICE_REMOVE_PDUS,
            extra_flags_1: ExtraFlags1::ENABLE_ASYNCIO,
            extra_flags_2: 0,
            special_type_device_cap: Some(0),
        };
        let msg = CoreCapability::new(vec![CapabilitySet::General(set)], CoreCapabilityKind::ClientCoreCapabilityResponse);
        let bytes = encode_vec(&msg).unwrap();
        let mut cursor = ReadCursor::new(&bytes);
        let decoded = CoreCapability::decode_as(&mut cursor, CoreCapabilityKind::ClientCoreCapabilityResponse).unwrap();
        assert_eq!(decoded.capabilities.len(), 1);
        match &decoded.capabilities[0] {
            CapabilitySet::General(decoded_set) => assert_eq!(decoded_set.protocol_minor_version, 0x0c),
            other => panic!("unexpected capability {other:?}"),
        }
    }
}
