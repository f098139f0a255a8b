//! TSGU (`[MS-TSGU]`) packet bodies carried as stub data inside [`super::request`] PDUs
//! (§4.7 "TSG (C7)").
//!
//! Every request/response here is exactly the NDR layout FreeRDP's `tsg.c` hand-marshals;
//! this module gives each one a typed struct with `encode`/`decode` built from
//! [`super::ndr`]'s helpers rather than reproducing FreeRDP's inline `Stream_Write_*` calls.

use rdpcore_core::{ensure_size, invalid_field_err};
use rdpcore_core::{DecodeResult, EncodeResult, ReadCursor, WriteCursor};

use super::ndr::{align4_read, align4_write, read_counted_utf16_z, write_counted_utf16_z, write_ptr};

/// High-level TSGU opnums (§4.7 opnum table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TsgOpnum {
    CreateTunnel = 1,
    AuthorizeTunnel = 2,
    MakeTunnelCall = 3,
    CreateChannel = 4,
    CloseChannel = 5,
    CloseTunnel = 6,
    SetupReceivePipe = 8,
    SendToServer = 9,
}

const PACKET_ID_VERSIONCAPS: u32 = 0x5643;
const PACKET_ID_REAUTH: u32 = 0x5250;
const COMPONENT_ID_TRANSPORT: u32 = 0x5452;
const CAP_TYPE_NAP: u32 = 1;
const PACKET_ID_QUARREQUEST: u32 = 0x5152;
const PACKET_ID_RESPONSE: u32 = 0x5052;
const PACKET_ID_MSGREQUEST: u32 = 0x4752;
const PACKET_ID_MESSAGE: u32 = 0x4750;
const TSG_TUNNEL_CALL_ASYNC_MSG_REQUEST: u32 = 1;
const TSG_TUNNEL_CANCEL_ASYNC_MSG_REQUEST: u32 = 2;
const PROTOCOL_RDP: u16 = 3;

/// 20-byte `TSG_PACKET_CONTEXT` / tunnel or channel context handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketContext {
    pub context_type: u32,
    pub uuid: [u8; 16],
}

impl PacketContext {
    pub const SIZE: usize = 20;

    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: "TSG_PACKET_CONTEXT", in: dst, size: Self::SIZE);
        dst.write_u32(self.context_type);
        dst.write_slice(&self.uuid);
        Ok(())
    }

    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: "TSG_PACKET_CONTEXT", in: src, size: Self::SIZE);
        let context_type = src.read_u32();
        let uuid = src.read_array();
        Ok(Self { context_type, uuid })
    }
}

/// `TsProxyCreateTunnel` request (§4.7 "CreateTunnel request").
#[derive(Debug, Clone)]
pub struct CreateTunnelRequest {
    /// Present only on a reauth call; carries the context inherited from the primary tunnel.
    pub reauth_context: Option<PacketContext>,
}

impl CreateTunnelRequest {
    const NAME: &'static str = "TSPROXY_CREATE_TUNNEL_REQUEST";

    pub fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        let outer_switch = if self.reauth_context.is_some() { PACKET_ID_REAUTH } else { PACKET_ID_VERSIONCAPS };
        ensure_size!(ctx: Self::NAME, in: dst, size: 8);
        dst.write_u32(outer_switch);
        dst.write_u32(outer_switch);
        write_ptr(dst, 0, true)?;

        if let Some(ctx) = &self.reauth_context {
            ctx.encode(dst)?;
        }

        ensure_size!(ctx: Self::NAME, in: dst, size: 8);
        dst.write_u32(COMPONENT_ID_TRANSPORT);
        dst.write_u32(PACKET_ID_VERSIONCAPS);
        write_ptr(dst, 1, true)?;

        ensure_size!(ctx: Self::NAME, in: dst, size: 12);
        dst.write_u32(1); // num_caps
        dst.write_u16(1); // major
        dst.write_u16(1); // minor
        dst.write_u32(0); // quarantine capabilities

        align4_write(dst, 0)?;

        ensure_size!(ctx: Self::NAME, in: dst, size: 16);
        dst.write_u32(1); // conformant array max_count
        dst.write_u32(CAP_TYPE_NAP);
        dst.write_u32(CAP_TYPE_NAP);
        dst.write_u32(0x1F); // capabilities bitmask: all NAP capability bits advertised
        Ok(())
    }
}

/// `TsProxyCreateTunnel` response (§4.7 "CreateTunnel response"): either a capability
/// response or a quarantine-encoding response, either way yielding a tunnel context.
#[derive(Debug, Clone, Copy)]
pub struct CreateTunnelResponse {
    pub tunnel_context: PacketContext,
}

impl CreateTunnelResponse {
    const NAME: &'static str = "TSPROXY_CREATE_TUNNEL_RESPONSE";

    pub fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: Self::NAME, in: src, size: 4);
        let packet_id = src.read_u32();
        if packet_id != 0x4350 && packet_id != 0x4552 {
            return Err(invalid_field_err!(Self::NAME, "packet_id", "not CAPS_RESPONSE or QUARENC_RESPONSE"));
        }
        // The variable-length caps/quarantine payload is skipped: this client only needs
        // the trailing tunnel context, which the caller locates from the end of the stub.
        let remaining = src.remaining();
        if remaining.len() < PacketContext::SIZE {
            return Err(invalid_field_err!(Self::NAME, "tunnel_context", "stub too short"));
        }
        let context_offset = remaining.len() - PacketContext::SIZE;
        let _ = src.read_slice(context_offset);
        let tunnel_context = PacketContext::decode(src)?;
        Ok(Self { tunnel_context })
    }
}

/// `TsProxyAuthorizeTunnel` request (§4.7 "AuthorizeTunnel request").
#[derive(Debug, Clone)]
pub struct AuthorizeTunnelRequest {
    pub tunnel_context: PacketContext,
    pub machine_name: String,
}

impl AuthorizeTunnelRequest {
    const NAME: &'static str = "TSPROXY_AUTHORIZE_TUNNEL_REQUEST";

    pub fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        self.tunnel_context.encode(dst)?;
        ensure_size!(ctx: Self::NAME, in: dst, size: 8);
        dst.write_u32(PACKET_ID_QUARREQUEST);
        dst.write_u32(0); // flags
        write_counted_utf16_z(dst, &self.machine_name)?;
        ensure_size!(ctx: Self::NAME, in: dst, size: 4);
        dst.write_u32(0); // empty data array
        Ok(())
    }
}

/// Redirection flags from `TsProxyAuthorizeTunnel`'s response (§4.7).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedirectionFlags {
    pub enable_all: bool,
    pub disable_all: bool,
    pub drive_disabled: bool,
    pub printer_disabled: bool,
    pub port_disabled: bool,
    pub clipboard_disabled: bool,
    pub pnp_disabled: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct AuthorizeTunnelResponse {
    pub redirection: RedirectionFlags,
    pub idle_timeout: Option<u32>,
}

impl AuthorizeTunnelResponse {
    const NAME: &'static str = "TSPROXY_AUTHORIZE_TUNNEL_RESPONSE";

    pub fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: Self::NAME, in: src, size: 8);
        let packet_id = src.read_u32();
        if packet_id != PACKET_ID_RESPONSE {
            return Err(invalid_field_err!(Self::NAME, "packet_id", "not RESPONSE"));
        }
        let flags = src.read_u32();
        if flags != PACKET_ID_QUARREQUEST {
            return Err(invalid_field_err!(Self::NAME, "flags", "not QUARREQUEST"));
        }

        let read_bool32 = |src: &mut ReadCursor<'_>| -> DecodeResult<bool> {
            ensure_size!(ctx: Self::NAME, in: src, size: 4);
            Ok(src.read_i32() != 0)
        };
        let enable_all = read_bool32(src)?;
        let disable_all = read_bool32(src)?;
        let drive_disabled = read_bool32(src)?;
        let printer_disabled = read_bool32(src)?;
        let port_disabled = read_bool32(src)?;
        let _reserved = read_bool32(src)?;
        let clipboard_disabled = read_bool32(src)?;
        let pnp_disabled = read_bool32(src)?;

        let idle_timeout = if src.remaining().len() >= 4 {
            ensure_size!(ctx: Self::NAME, in: src, size: 4);
            Some(src.read_u32())
        } else {
            None
        };

        Ok(Self {
            redirection: RedirectionFlags {
                enable_all,
                disable_all,
                drive_disabled,
                printer_disabled,
                port_disabled,
                clipboard_disabled,
                pnp_disabled,
            },
            idle_timeout,
        })
    }
}

/// `TsProxyMakeTunnelCall` request (§4.7 "MakeTunnelCall request"). The client issues this
/// once to arm async delivery, and again to cancel it on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MakeTunnelCallKind {
    ArmAsyncDelivery,
    Cancel,
}

#[derive(Debug, Clone, Copy)]
pub struct MakeTunnelCallRequest {
    pub tunnel_context: PacketContext,
    pub kind: MakeTunnelCallKind,
}

impl MakeTunnelCallRequest {
    const NAME: &'static str = "TSPROXY_MAKE_TUNNEL_CALL_REQUEST";

    pub fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        self.tunnel_context.encode(dst)?;
        let proc_id = match self.kind {
            MakeTunnelCallKind::ArmAsyncDelivery => TSG_TUNNEL_CALL_ASYNC_MSG_REQUEST,
            MakeTunnelCallKind::Cancel => TSG_TUNNEL_CANCEL_ASYNC_MSG_REQUEST,
        };
        ensure_size!(ctx: Self::NAME, in: dst, size: 12);
        dst.write_u32(proc_id);
        dst.write_u32(PACKET_ID_MSGREQUEST);
        dst.write_u32(1); // maxMessagesPerBatch
        Ok(())
    }
}

/// One delivered async message (§4.7 "MakeTunnelCall response").
#[derive(Debug, Clone)]
pub enum GatewayMessage {
    Consent {
        is_display_mandatory: bool,
        is_consent_mandatory: bool,
        text: String,
    },
    Service {
        is_display_mandatory: bool,
        is_consent_mandatory: bool,
        text: String,
    },
    Reauth {
        tunnel_context: PacketContext,
    },
}

#[derive(Debug, Clone)]
pub struct MakeTunnelCallResponse {
    pub msg_id: u32,
    pub is_msg_present: bool,
    pub message: Option<GatewayMessage>,
}

impl MakeTunnelCallResponse {
    const NAME: &'static str = "TSPROXY_MAKE_TUNNEL_CALL_RESPONSE";
    const CONSENT_MESSAGE: u32 = 1;
    const SERVICE_MESSAGE: u32 = 2;
    const REAUTH: u32 = 3;

    pub fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: Self::NAME, in: src, size: 4);
        let packet_id = src.read_u32();
        if packet_id != PACKET_ID_MESSAGE {
            return Err(invalid_field_err!(Self::NAME, "packet_id", "not MESSAGE"));
        }
        ensure_size!(ctx: Self::NAME, in: src, size: 12);
        let msg_id = src.read_u32();
        let msg_type = src.read_u32();
        let is_msg_present = src.read_u32() != 0;

        let message = if is_msg_present {
            Some(match msg_type {
                Self::CONSENT_MESSAGE | Self::SERVICE_MESSAGE => {
                    ensure_size!(ctx: Self::NAME, in: src, size: 12);
                    let is_display_mandatory = src.read_i32() != 0;
                    let is_consent_mandatory = src.read_i32() != 0;
                    let _msg_bytes = src.read_u32();
                    let text = read_counted_utf16_z(src)?;
                    if msg_type == Self::CONSENT_MESSAGE {
                        GatewayMessage::Consent {
                            is_display_mandatory,
                            is_consent_mandatory,
                            text,
                        }
                    } else {
                        GatewayMessage::Service {
                            is_display_mandatory,
                            is_consent_mandatory,
                            text,
                        }
                    }
                }
                Self::REAUTH => {
                    ensure_size!(ctx: Self::NAME, in: src, size: 8);
                    let mut uuid = [0u8; 16];
                    uuid[..8].copy_from_slice(&src.read_array::<8>());
                    GatewayMessage::Reauth {
                        tunnel_context: PacketContext {
                            context_type: 0,
                            uuid,
                        },
                    }
                }
                _ => return Err(invalid_field_err!(Self::NAME, "msg_type", "unknown message type")),
            })
        } else {
            None
        };

        Ok(Self {
            msg_id,
            is_msg_present,
            message,
        })
    }
}

/// `TsProxyCreateChannel` request (§4.7 "CreateChannel request").
#[derive(Debug, Clone)]
pub struct CreateChannelRequest {
    pub tunnel_context: PacketContext,
    pub target_host: String,
    pub target_port: u16,
}

impl CreateChannelRequest {
    const NAME: &'static str = "TSPROXY_CREATE_CHANNEL_REQUEST";

    pub fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        self.tunnel_context.encode(dst)?;
        write_ptr(dst, 0, true)?;
        ensure_size!(ctx: Self::NAME, in: dst, size: 16);
        dst.write_u32(1); // num_resource_names
        dst.write_u32(0); // alternateResourceNames_ptr
        dst.write_u32(0); // numAlternateResourceNames
        dst.write_u16(PROTOCOL_RDP);
        dst.write_u16(self.target_port);
        write_counted_utf16_z(dst, &self.target_host)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CreateChannelResponse {
    pub channel_context: PacketContext,
    pub channel_id: u32,
}

impl CreateChannelResponse {
    const NAME: &'static str = "TSPROXY_CREATE_CHANNEL_RESPONSE";

    pub fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let channel_context = PacketContext::decode(src)?;
        ensure_size!(ctx: Self::NAME, in: src, size: 4);
        let channel_id = src.read_u32();
        Ok(Self {
            channel_context,
            channel_id,
        })
    }
}

/// `TsProxySetupReceivePipe` request: the channel context alone (§4.7).
#[derive(Debug, Clone, Copy)]
pub struct SetupReceivePipeRequest {
    pub channel_context: PacketContext,
}

impl SetupReceivePipeRequest {
    pub fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        self.channel_context.encode(dst)
    }
}

/// Hard cap on a single `SendToServer` buffer (§4.7 wire format: 1..3 buffers).
pub const SEND_TO_SERVER_SMALL_PAYLOAD: usize = 4096;
const SEND_TO_SERVER_MAX_BUFFERS: usize = 3;

/// `TsProxySendToServer` request (§4.7): `totalDataBytes`/`numBuffers`/lengths are
/// big-endian, unlike every other TSGU field, and the buffers themselves are split
/// according to SPEC_FULL's supplemental splitting policy (≤4 KiB in one buffer, larger
/// payloads spread across up to 3 roughly-equal buffers, anything bigger split across
/// consecutive PDUs by the caller).
#[derive(Debug, Clone)]
pub struct SendToServerRequest {
    pub channel_context: PacketContext,
    pub data: Vec<u8>,
}

impl SendToServerRequest {
    const NAME: &'static str = "TSPROXY_SEND_TO_SERVER_REQUEST";

    /// Splits `data` into the buffer layout this PDU uses on the wire.
    #[must_use]
    pub fn split_buffers(data: &[u8]) -> Vec<&[u8]> {
        if data.len() <= SEND_TO_SERVER_SMALL_PAYLOAD {
            return vec![data];
        }
        let chunk = data.len().div_ceil(SEND_TO_SERVER_MAX_BUFFERS);
        data.chunks(chunk.max(1)).collect()
    }

    pub fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        self.channel_context.encode(dst)?;
        let buffers = Self::split_buffers(&self.data);
        let total = u32::try_from(self.data.len()).map_err(|_| invalid_field_err!(Self::NAME, "data", "too long"))?;
        let num_buffers = u32::try_from(buffers.len()).map_err(|_| invalid_field_err!(Self::NAME, "buffers", "too many"))?;

        ensure_size!(ctx: Self::NAME, in: dst, size: 8);
        dst.write_u32_be(total);
        dst.write_u32_be(num_buffers);
        for buffer in &buffers {
            ensure_size!(ctx: Self::NAME, in: dst, size: 4);
            let len = u32::try_from(buffer.len()).map_err(|_| invalid_field_err!(Self::NAME, "buffer", "too long"))?;
            dst.write_u32_be(len);
        }
        for buffer in &buffers {
            ensure_size!(ctx: Self::NAME, in: dst, size: buffer.len());
            dst.write_slice(buffer);
        }
        align4_write(dst, buffers.iter().map(|b| b.len()).sum())
    }
}

/// `TsProxyCloseChannel`/`TsProxyCloseTunnel` requests: a single context handle, decoded
/// from a response that echoes it back as a (now invalid) context (§4.7).
#[derive(Debug, Clone, Copy)]
pub struct CloseRequest {
    pub context: PacketContext,
}

impl CloseRequest {
    pub fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        self.context.encode(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_tunnel_request_uses_versioncaps_switch() {
        let req = CreateTunnelRequest { reauth_context: None };
        let mut buf = vec![0u8; 256];
        let mut w = WriteCursor::new(&mut buf);
        req.encode(&mut w).unwrap();
        assert_eq!(&buf[0..4], &PACKET_ID_VERSIONCAPS.to_le_bytes());
    }

    #[test]
    fn create_tunnel_request_reauth_uses_reauth_switch() {
        let req = CreateTunnelRequest {
            reauth_context: Some(PacketContext::default()),
        };
        let mut buf = vec![0u8; 256];
        let mut w = WriteCursor::new(&mut buf);
        req.encode(&mut w).unwrap();
        assert_eq!(&buf[0..4], &PACKET_ID_REAUTH.to_le_bytes());
    }

    #[test]
    fn send_to_server_keeps_small_payload_in_one_buffer() {
        let data = vec![0u8; 1024];
        assert_eq!(SendToServerRequest::split_buffers(&data).len(), 1);
    }

    #[test]
    fn send_to_server_splits_large_payload_into_three_buffers() {
        let data = vec![0u8; 20_000];
        let buffers = SendToServerRequest::split_buffers(&data);
        assert_eq!(buffers.len(), 3);
        assert_eq!(buffers.iter().map(|b| b.len()).sum::<usize>(), data.len());
    }

    #[test]
    fn send_to_server_header_is_big_endian() {
        let req = SendToServerRequest {
            channel_context: PacketContext::default(),
            data: vec![1, 2, 3, 4],
        };
        let mut buf = vec![0u8; 64];
        let mut w = WriteCursor::new(&mut buf);
        req.encode(&mut w).unwrap();
        let total_offset = PacketContext::SIZE;
        assert_eq!(&buf[total_offset..total_offset + 4], &4u32.to_be_bytes());
    }
}
