//! [MS-RDPEFS] wire format: shared packet header, packet id dispatch, and the top-level
//! [`RdpdrPdu`] enum decoded/encoded at the channel boundary.

pub mod caps;
pub mod drive_io;
pub mod efs;
pub mod esc;
mod ndr;
mod rpce;

use std::fmt;

use rdpcore_core::{ensure_fixed_part_size, invalid_field_err, other_err};
use rdpcore_core::{Decode, DecodeResult, Encode, EncodeResult, ReadCursor, WriteCursor};

pub use ndr::{decode_ptr, encode_ptr, ptr_size, read_unicode_string_value, write_unicode_string_ptr};
pub use rpce::{HeaderlessDecode, HeaderlessEncode, RpcePdu};

use caps::{CoreCapability, CoreCapabilityKind};
use efs::{
    ClientDeviceListAnnounce, ClientDriveQueryDirectoryResponse, ClientNameRequest, ClientNameRequestUnicodeFlag,
    DeviceCloseResponse, DeviceControlResponse, DeviceCreateResponse, DeviceIoRequest, DeviceIoResponse,
    DeviceListRemove, DeviceReadResponse, DeviceWriteResponse, ServerDeviceAnnounceResponse, UserLoggedOn,
    VersionAndIdPdu, VersionAndIdPduKind,
};

/// RDPDR shared packet header (`component`, `packet_id`), prefixing every PDU on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedHeader {
    pub component: Component,
    pub packet_id: PacketId,
}

impl SharedHeader {
    pub const FIXED_PART_SIZE: usize = 4;
    const NAME: &'static str = "RDPDR_HEADER";

    pub fn new(component: Component, packet_id: PacketId) -> Self {
        Self { component, packet_id }
    }
}

impl Decode<'_> for SharedHeader {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);
        let component = Component::try_from(src.read_u16())?;
        let packet_id = PacketId::try_from(src.read_u16())?;
        Ok(Self { component, packet_id })
    }
}

impl Encode for SharedHeader {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_fixed_part_size!(in: dst);
        dst.write_u16(self.component as u16);
        dst.write_u16(self.packet_id as u16);
        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
    }
}

/// RDPDR_CTYP_CORE / RDPDR_CTYP_PRN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Component {
    Core = 0x4472,
    Printer = 0x5052,
}

impl TryFrom<u16> for Component {
    type Error = rdpcore_core::DecodeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x4472 => Ok(Self::Core),
            0x5052 => Ok(Self::Printer),
            _ => Err(invalid_field_err!("SharedHeader", "component", "unknown component")),
        }
    }
}

/// RDPDR packet ids, CORE component unless noted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PacketId {
    ServerAnnounce = 0x496e,
    ClientAnnounceReply = 0x4352,
    ClientNameRequest = 0x434e,
    ServerCapability = 0x5350,
    ClientCapability = 0x4350,
    ClientIdConfirm = 0x4343,
    DeviceListAnnounce = 0x4441,
    DeviceReply = 0x6472,
    DeviceIoRequest = 0x4952,
    DeviceIoCompletion = 0x4943,
    DeviceListRemove = 0x444d,
    ServerUserLoggedOn = 0x554c,
}

impl TryFrom<u16> for PacketId {
    type Error = rdpcore_core::DecodeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0x496e => Self::ServerAnnounce,
            0x4352 => Self::ClientAnnounceReply,
            0x434e => Self::ClientNameRequest,
            0x5350 => Self::ServerCapability,
            0x4350 => Self::ClientCapability,
            0x4343 => Self::ClientIdConfirm,
            0x4441 => Self::DeviceListAnnounce,
            0x6472 => Self::DeviceReply,
            0x4952 => Self::DeviceIoRequest,
            0x4943 => Self::DeviceIoCompletion,
            0x444d => Self::DeviceListRemove,
            0x554c => Self::ServerUserLoggedOn,
            _ => return Err(invalid_field_err!("SharedHeader", "packet_id", "unknown packet id")),
        })
    }
}

/// Top-level RDPDR PDU, decoded starting just after [`SharedHeader`].
pub enum RdpdrPdu {
    VersionAndId(VersionAndIdPdu),
    ClientNameRequest(ClientNameRequest),
    CoreCapability(CoreCapability),
    ClientDeviceListAnnounce(ClientDeviceListAnnounce),
    ServerDeviceAnnounceResponse(ServerDeviceAnnounceResponse),
    DeviceIoRequest(DeviceIoRequest),
    DeviceCreateResponse(DeviceCreateResponse),
    DeviceCloseResponse(DeviceCloseResponse),
    DeviceReadResponse(DeviceReadResponse),
    DeviceWriteResponse(DeviceWriteResponse),
    DeviceControlResponse(DeviceControlResponse),
    ClientDriveQueryDirectoryResponse(ClientDriveQueryDirectoryResponse),
    DeviceIoResponse(DeviceIoResponse),
    DeviceListRemove(DeviceListRemove),
    UserLoggedOn(UserLoggedOn),
    /// A packet id this implementation recognizes but does not act on.
    Unimplemented,
}

impl RdpdrPdu {
    /// Decodes a PDU given its already-decoded shared header; used when the caller wants
    /// to branch on the component/packet_id before committing to a body decode.
    pub fn decode_with_header(header: SharedHeader, src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        use Component::{Core, Printer};
        use PacketId::*;

        Ok(match (header.component, header.packet_id) {
            (Core, ServerAnnounce) => Self::VersionAndId(VersionAndIdPdu::decode_as(src, VersionAndIdPduKind::ServerAnnounceRequest)?),
            (Core, ClientIdConfirm) => Self::VersionAndId(VersionAndIdPdu::decode_as(src, VersionAndIdPduKind::ServerClientIdConfirm)?),
            (Core, ServerCapability) => Self::CoreCapability(CoreCapability::decode_as(src, CoreCapabilityKind::ServerCoreCapabilityRequest)?),
            (Core, DeviceReply) => Self::ServerDeviceAnnounceResponse(ServerDeviceAnnounceResponse::decode(src)?),
            (Core, DeviceIoRequest) => Self::DeviceIoRequest(DeviceIoRequest::decode(src)?),
            (Core, ServerUserLoggedOn) => Self::UserLoggedOn(UserLoggedOn),
            (Printer, _) => Self::Unimplemented,
            _ => return Err(other_err!("RdpdrPdu", "received a server-only or unexpected packet id")),
        })
    }
}

impl Decode<'_> for RdpdrPdu {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let header = SharedHeader::decode(src)?;
        Self::decode_with_header(header, src)
    }
}

impl Encode for RdpdrPdu {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        let header = self.header();
        header.encode(dst)?;
        match self {
            Self::VersionAndId(pdu) => pdu.encode(dst),
            Self::ClientNameRequest(pdu) => pdu.encode(dst),
            Self::CoreCapability(pdu) => pdu.encode(dst),
            Self::ClientDeviceListAnnounce(pdu) => pdu.encode(dst),
            Self::DeviceCreateResponse(pdu) => pdu.encode(dst),
            Self::DeviceCloseResponse(pdu) => pdu.encode(dst),
            Self::DeviceReadResponse(pdu) => pdu.encode(dst),
            Self::DeviceWriteResponse(pdu) => pdu.encode(dst),
            Self::DeviceControlResponse(pdu) => pdu.encode(dst),
            Self::ClientDriveQueryDirectoryResponse(pdu) => pdu.encode(dst),
            Self::DeviceIoResponse(pdu) => pdu.encode(dst),
            Self::DeviceListRemove(pdu) => pdu.encode(dst),
            Self::ServerDeviceAnnounceResponse(_) | Self::DeviceIoRequest(_) | Self::UserLoggedOn(_) | Self::Unimplemented => {
                Err(other_err!("RdpdrPdu", "attempted to encode a server-to-client-only PDU"))
            }
        }
    }

    fn name(&self) -> &'static str {
        "RDPDR_PDU"
    }

    fn size(&self) -> usize {
        SharedHeader::FIXED_PART_SIZE
            + match self {
                Self::VersionAndId(pdu) => pdu.size(),
                Self::ClientNameRequest(pdu) => pdu.size(),
                Self::CoreCapability(pdu) => pdu.size(),
                Self::ClientDeviceListAnnounce(pdu) => pdu.size(),
                Self::DeviceCreateResponse(pdu) => pdu.size(),
                Self::DeviceCloseResponse(pdu) => pdu.size(),
                Self::DeviceReadResponse(pdu) => pdu.size(),
                Self::DeviceWriteResponse(pdu) => pdu.size(),
                Self::DeviceControlResponse(pdu) => pdu.size(),
                Self::ClientDriveQueryDirectoryResponse(pdu) => pdu.size(),
                Self::DeviceIoResponse(pdu) => pdu.size(),
                Self::DeviceListRemove(pdu) => pdu.size(),
                _ => 0,
            }
    }
}

impl RdpdrPdu {
    fn header(&self) -> SharedHeader {
        use Component::{Core, Printer};
        let (component, packet_id) = match self {
            Self::VersionAndId(pdu) if pdu.kind == VersionAndIdPduKind::ClientAnnounceReply => (Core, PacketId::ClientAnnounceReply),
            Self::VersionAndId(_) => (Core, PacketId::ClientIdConfirm),
            Self::ClientNameRequest(_) => (Core, PacketId::ClientNameRequest),
            Self::CoreCapability(_) => (Core, PacketId::ClientCapability),
            Self::ClientDeviceListAnnounce(_) => (Core, PacketId::DeviceListAnnounce),
            Self::DeviceCreateResponse(_)
            | Self::DeviceCloseResponse(_)
            | Self::DeviceReadResponse(_)
            | Self::DeviceWriteResponse(_)
            | Self::DeviceControlResponse(_)
            | Self::ClientDriveQueryDirectoryResponse(_)
            | Self::DeviceIoResponse(_) => (Core, PacketId::DeviceIoCompletion),
            Self::DeviceListRemove(_) => (Core, PacketId::DeviceListRemove),
            Self::ServerDeviceAnnounceResponse(_) => (Core, PacketId::DeviceReply),
            Self::DeviceIoRequest(_) => (Core, PacketId::DeviceIoRequest),
            Self::UserLoggedOn(_) => (Core, PacketId::ServerUserLoggedOn),
            Self::Unimplemented => (Printer, PacketId::ServerAnnounce),
        };
        SharedHeader::new(component, packet_id)
    }
}

impl fmt::Debug for RdpdrPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionAndId(pdu) => write!(f, "{pdu:?}"),
            Self::ClientNameRequest(pdu) => write!(f, "{pdu:?}"),
            Self::CoreCapability(pdu) => write!(f, "{pdu:?}"),
            Self::ClientDeviceListAnnounce(pdu) => write!(f, "{pdu:?}"),
            Self::ServerDeviceAnnounceResponse(pdu) => write!(f, "{pdu:?}"),
            Self::DeviceIoRequest(pdu) => write!(f, "{pdu:?}"),
            Self::DeviceCreateResponse(pdu) => write!(f, "{pdu:?}"),
            Self::DeviceCloseResponse(pdu) => write!(f, "{pdu:?}"),
            Self::DeviceReadResponse(pdu) => write!(f, "{pdu:?}"),
            Self::DeviceWriteResponse(pdu) => write!(f, "{pdu:?}"),
            Self::DeviceControlResponse(pdu) => write!(f, "{pdu:?}"),
            Self::ClientDriveQueryDirectoryResponse(pdu) => write!(f, "{pdu:?}"),
            Self::DeviceIoResponse(pdu) => write!(f, "{pdu:?}"),
            Self::DeviceListRemove(pdu) => write!(f, "{pdu:?}"),
            Self::UserLoggedOn(_) => write!(f, "UserLoggedOn"),
            Self::Unimplemented => write!(f, "Unimplemented"),
        }
    }
}
