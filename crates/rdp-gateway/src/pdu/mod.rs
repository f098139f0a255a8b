//! [MS-RPCE]/[MS-TSGU] wire format: the connection-oriented RPC envelope (common header,
//! bind sequence, RTS control PDUs, request/response framing) and the TSGU packet bodies
//! carried as stub data inside it.

pub mod bind;
pub mod common;
mod ndr;
pub mod request;
pub mod rts;
pub mod tsgu;

pub use bind::{Auth3Pdu, BindAckPdu, BindAckResult, BindPdu, SyntaxId};
pub use common::{align4, align8, AuthLevel, AuthType, PacketType, PfcFlags, RpcCommonHeader, SecTrailer, PACKED_DREP};
pub use request::{split_trailer, BodyParts, FaultPdu, RequestPdu, ResponsePdu};
pub use rts::{RtsCommand, RtsFlags, RtsPdu, RtsPduKind};
pub use tsgu::{
    AuthorizeTunnelRequest, AuthorizeTunnelResponse, CloseRequest, CreateChannelRequest, CreateChannelResponse,
    CreateTunnelRequest, CreateTunnelResponse, GatewayMessage, MakeTunnelCallKind, MakeTunnelCallRequest,
    MakeTunnelCallResponse, PacketContext, RedirectionFlags, SendToServerRequest, SetupReceivePipeRequest, TsgOpnum,
};

use rdpcore_core::{invalid_field_err, DecodeResult};
use rdpcore_core::ReadCursor;

/// Peeks the common header's `ptype` without consuming the cursor, so the caller can
/// dispatch to the right body decoder (mirrors `rdp_rdpdr::pdu::SharedHeader`'s role, but
/// for the RPC layer the discriminant lives inside the already-mandatory 16-byte header
/// rather than a separate tag).
pub fn peek_packet_type(src: &ReadCursor<'_>) -> DecodeResult<PacketType> {
    let bytes = src.remaining();
    if bytes.len() < 3 {
        return Err(invalid_field_err!("RPC_COMMON_HEADER", "ptype", "fragment too short to dispatch"));
    }
    PacketType::try_from(bytes[2])
}
