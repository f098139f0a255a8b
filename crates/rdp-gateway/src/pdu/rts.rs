//! RTS (Request To Send) control PDUs (§4.2 "RTS PDU", §4.5 virtual-connection handshake /
//! flow control / recycling). Grounded on FreeRDP's `rts.c`/`rts_signature.c`, which dispatch
//! inbound RTS PDUs by matching `(flags, num_commands, command_type_sequence)` against a
//! fixed table of named signatures (`RTS_PDU_CONN_A3_SIGNATURE`, `RTS_PDU_OUT_R2_B3_SIGNATURE`,
//! …); [`RtsPduKind::classify`] reimplements that table for the subset of signatures this
//! client (as opposed to a full gateway-side proxy) ever needs to recognize.

use bitflags::bitflags;
use rdpcore_core::{ensure_fixed_part_size, ensure_size, invalid_field_err};
use rdpcore_core::{Decode, DecodeResult, Encode, EncodeResult, ReadCursor, WriteCursor};

use super::common::{PacketType, PfcFlags, RpcCommonHeader};

bitflags! {
    /// RTS PDU `flags` (distinct from `pfc_flags` in the common header).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RtsFlags: u16 {
        const NONE = 0x0000;
        const PING = 0x0001;
        const OTHER_CMD = 0x0002;
        const RECYCLE_CHANNEL = 0x0004;
        const IN_CHANNEL = 0x0008;
        const OUT_CHANNEL = 0x0010;
        const EOF = 0x0020;
        const ECHO = 0x0040;
    }
}

/// One RTS command, tagged by `command_type` (§4.2 RTS command table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtsCommand {
    ReceiveWindowSize(u32),
    FlowControlAck {
        bytes_received: u32,
        available_window: u32,
        channel_cookie: [u8; 16],
    },
    ConnectionTimeout(u32),
    Cookie([u8; 16]),
    ChannelLifetime(u32),
    ClientKeepalive(u32),
    Version(u32),
    Empty,
    Padding(Vec<u8>),
    NegativeAnce,
    Ance,
    ClientAddress {
        address_type: u32,
        address: Vec<u8>,
    },
    AssociationGroupId([u8; 16]),
    Destination(u32),
    PingTrafficSentNotify(u32),
}

impl RtsCommand {
    const TYPE_RECEIVE_WINDOW_SIZE: u32 = 0x0000_0000;
    const TYPE_FLOW_CONTROL_ACK: u32 = 0x0000_0001;
    const TYPE_CONNECTION_TIMEOUT: u32 = 0x0000_0002;
    const TYPE_COOKIE: u32 = 0x0000_0003;
    const TYPE_CHANNEL_LIFETIME: u32 = 0x0000_0004;
    const TYPE_CLIENT_KEEPALIVE: u32 = 0x0000_0005;
    const TYPE_VERSION: u32 = 0x0000_0006;
    const TYPE_EMPTY: u32 = 0x0000_0007;
    const TYPE_PADDING: u32 = 0x0000_0008;
    const TYPE_NEGATIVE_ANCE: u32 = 0x0000_0009;
    const TYPE_ANCE: u32 = 0x0000_000A;
    const TYPE_CLIENT_ADDRESS: u32 = 0x0000_000B;
    const TYPE_ASSOCIATION_GROUP_ID: u32 = 0x0000_000C;
    const TYPE_DESTINATION: u32 = 0x0000_000D;
    const TYPE_PING_TRAFFIC_SENT_NOTIFY: u32 = 0x0000_000E;

    fn command_type(&self) -> u32 {
        match self {
            Self::ReceiveWindowSize(_) => Self::TYPE_RECEIVE_WINDOW_SIZE,
            Self::FlowControlAck { .. } => Self::TYPE_FLOW_CONTROL_ACK,
            Self::ConnectionTimeout(_) => Self::TYPE_CONNECTION_TIMEOUT,
            Self::Cookie(_) => Self::TYPE_COOKIE,
            Self::ChannelLifetime(_) => Self::TYPE_CHANNEL_LIFETIME,
            Self::ClientKeepalive(_) => Self::TYPE_CLIENT_KEEPALIVE,
            Self::Version(_) => Self::TYPE_VERSION,
            Self::Empty => Self::TYPE_EMPTY,
            Self::Padding(_) => Self::TYPE_PADDING,
            Self::NegativeAnce => Self::TYPE_NEGATIVE_ANCE,
            Self::Ance => Self::TYPE_ANCE,
            Self::ClientAddress { .. } => Self::TYPE_CLIENT_ADDRESS,
            Self::AssociationGroupId(_) => Self::TYPE_ASSOCIATION_GROUP_ID,
            Self::Destination(_) => Self::TYPE_DESTINATION,
            Self::PingTrafficSentNotify(_) => Self::TYPE_PING_TRAFFIC_SENT_NOTIFY,
        }
    }

    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: "RTS_COMMAND", in: dst, size: 4);
        dst.write_u32(self.command_type());
        match self {
            Self::ReceiveWindowSize(v)
            | Self::ConnectionTimeout(v)
            | Self::ChannelLifetime(v)
            | Self::ClientKeepalive(v)
            | Self::Version(v)
            | Self::Destination(v)
            | Self::PingTrafficSentNotify(v) => {
                ensure_size!(ctx: "RTS_COMMAND", in: dst, size: 4);
                dst.write_u32(*v);
            }
            Self::FlowControlAck {
                bytes_received,
                available_window,
                channel_cookie,
            } => {
                ensure_size!(ctx: "RTS_COMMAND", in: dst, size: 24);
                dst.write_u32(*bytes_received);
                dst.write_u32(*available_window);
                dst.write_array(*channel_cookie);
            }
            Self::Cookie(uuid) | Self::AssociationGroupId(uuid) => {
                ensure_size!(ctx: "RTS_COMMAND", in: dst, size: 16);
                dst.write_array(*uuid);
            }
            Self::Empty | Self::NegativeAnce | Self::Ance => {}
            Self::Padding(bytes) => {
                let len = u32::try_from(bytes.len()).map_err(|_| invalid_field_err!("RTS_COMMAND", "padding", "too long"))?;
                ensure_size!(ctx: "RTS_COMMAND", in: dst, size: 4 + bytes.len());
                dst.write_u32(len);
                dst.write_slice(bytes);
            }
            Self::ClientAddress { address_type, address } => {
                ensure_size!(ctx: "RTS_COMMAND", in: dst, size: 4 + address.len());
                dst.write_u32(*address_type);
                dst.write_slice(address);
            }
        }
        Ok(())
    }

    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: "RTS_COMMAND", in: src, size: 4);
        let command_type = src.read_u32();
        Ok(match command_type {
            Self::TYPE_RECEIVE_WINDOW_SIZE => Self::ReceiveWindowSize(read_u32(src)?),
            Self::TYPE_FLOW_CONTROL_ACK => {
                ensure_size!(ctx: "RTS_COMMAND", in: src, size: 24);
                Self::FlowControlAck {
                    bytes_received: src.read_u32(),
                    available_window: src.read_u32(),
                    channel_cookie: src.read_array::<16>(),
                }
            }
            Self::TYPE_CONNECTION_TIMEOUT => Self::ConnectionTimeout(read_u32(src)?),
            Self::TYPE_COOKIE => {
                ensure_size!(ctx: "RTS_COMMAND", in: src, size: 16);
                Self::Cookie(src.read_array::<16>())
            }
            Self::TYPE_CHANNEL_LIFETIME => Self::ChannelLifetime(read_u32(src)?),
            Self::TYPE_CLIENT_KEEPALIVE => Self::ClientKeepalive(read_u32(src)?),
            Self::TYPE_VERSION => Self::Version(read_u32(src)?),
            Self::TYPE_EMPTY => Self::Empty,
            Self::TYPE_PADDING => {
                ensure_size!(ctx: "RTS_COMMAND", in: src, size: 4);
                let len = src.read_u32() as usize;
                ensure_size!(ctx: "RTS_COMMAND", in: src, size: len);
                Self::Padding(src.read_slice(len).to_vec())
            }
            Self::TYPE_NEGATIVE_ANCE => Self::NegativeAnce,
            Self::TYPE_ANCE => Self::Ance,
            Self::TYPE_CLIENT_ADDRESS => {
                ensure_size!(ctx: "RTS_COMMAND", in: src, size: 4);
                let address_type = src.read_u32();
                // IPv4 (0) carries a 4-byte address + 12 bytes padding; IPv6 (1) carries 16
                // bytes + no padding (§4.2 "ClientAddress=B | variable (see AddressType)").
                let len = if address_type == 0 { 16 } else { 16 };
                ensure_size!(ctx: "RTS_COMMAND", in: src, size: len);
                Self::ClientAddress {
                    address_type,
                    address: src.read_slice(len).to_vec(),
                }
            }
            Self::TYPE_ASSOCIATION_GROUP_ID => {
                ensure_size!(ctx: "RTS_COMMAND", in: src, size: 16);
                Self::AssociationGroupId(src.read_array::<16>())
            }
            Self::TYPE_DESTINATION => Self::Destination(read_u32(src)?),
            Self::TYPE_PING_TRAFFIC_SENT_NOTIFY => Self::PingTrafficSentNotify(read_u32(src)?),
            _ => return Err(invalid_field_err!("RTS_COMMAND", "command_type", "unknown RTS command")),
        })
    }

    fn size(&self) -> usize {
        4 + match self {
            Self::ReceiveWindowSize(_)
            | Self::ConnectionTimeout(_)
            | Self::ChannelLifetime(_)
            | Self::ClientKeepalive(_)
            | Self::Version(_)
            | Self::Destination(_)
            | Self::PingTrafficSentNotify(_) => 4,
            Self::FlowControlAck { .. } => 24,
            Self::Cookie(_) | Self::AssociationGroupId(_) => 16,
            Self::Empty | Self::NegativeAnce | Self::Ance => 0,
            Self::Padding(bytes) => 4 + bytes.len(),
            Self::ClientAddress { address, .. } => 4 + address.len(),
        }
    }
}

fn read_u32(src: &mut ReadCursor<'_>) -> DecodeResult<u32> {
    ensure_size!(ctx: "RTS_COMMAND", in: src, size: 4);
    Ok(src.read_u32())
}

/// RTS PDU: common header (`ptype = PTYPE_RTS`) + `flags` + `num_commands` + commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtsPdu {
    pub flags: RtsFlags,
    pub call_id: u32,
    pub commands: Vec<RtsCommand>,
}

impl RtsPdu {
    const NAME: &'static str = "RTS_PDU";
    /// `num_commands`/`flags` live right after the 16-byte common header.
    const HEADER_TAIL_SIZE: usize = 4;

    #[must_use]
    pub fn new(flags: RtsFlags, commands: Vec<RtsCommand>) -> Self {
        Self {
            flags,
            call_id: 0,
            commands,
        }
    }

    pub fn decode_body(header: RpcCommonHeader, src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        if header.ptype != PacketType::Rts {
            return Err(invalid_field_err!(Self::NAME, "ptype", "not an RTS PDU"));
        }
        ensure_size!(ctx: Self::NAME, in: src, size: Self::HEADER_TAIL_SIZE);
        let flags = RtsFlags::from_bits_truncate(src.read_u16());
        let num_commands = src.read_u16();
        let mut commands = Vec::with_capacity(num_commands as usize);
        for _ in 0..num_commands {
            commands.push(RtsCommand::decode(src)?);
        }
        Ok(Self {
            flags,
            call_id: header.call_id,
            commands,
        })
    }

    pub fn encode_full(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        let header = RpcCommonHeader::new(
            PacketType::Rts,
            PfcFlags::FIRST_FRAG | PfcFlags::LAST_FRAG,
            u16::try_from(self.full_size()).unwrap_or(u16::MAX),
            0,
            self.call_id,
        );
        header.encode(dst)?;
        ensure_size!(ctx: Self::NAME, in: dst, size: Self::HEADER_TAIL_SIZE);
        dst.write_u16(self.flags.bits());
        dst.write_u16(u16::try_from(self.commands.len()).unwrap_or(u16::MAX));
        for command in &self.commands {
            command.encode(dst)?;
        }
        Ok(())
    }

    pub fn full_size(&self) -> usize {
        RpcCommonHeader::FIXED_PART_SIZE + Self::HEADER_TAIL_SIZE + self.commands.iter().map(RtsCommand::size).sum::<usize>()
    }
}

/// Named PDU shapes the client recognizes by their `(flags, command_type sequence)`
/// signature (§4.5 "PDU signatures are pattern-matched…against a known table").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtsPduKind {
    /// `CONN/A3`: server's reply to `CONN/A1` on the OUT channel, carrying `ConnectionTimeout`.
    ConnA3,
    /// `CONN/C2`: server's final connection-establishment reply on OUT (`Version`,
    /// `ReceiveWindowSize`, `ConnectionTimeout`).
    ConnC2,
    /// `OUT_R1/A2`: server requests OUT-channel recycling (`Destination`).
    OutR1A2,
    /// `OUT_R2/A6`: server accepts the replacement OUT channel.
    OutR2A6,
    /// `OUT_R2/B3`: server signals the predecessor OUT channel can be freed (`flags=EOF`).
    OutR2B3,
    FlowControlAck,
    KeepAlive,
    Ping,
    PingTrafficSentNotify,
    Echo,
}

impl RtsPduKind {
    #[must_use]
    pub fn classify(pdu: &RtsPdu) -> Option<Self> {
        use RtsCommand as C;

        if pdu.flags.contains(RtsFlags::ECHO) && pdu.commands.is_empty() {
            return Some(Self::Echo);
        }
        if pdu.flags.contains(RtsFlags::PING) && pdu.commands.is_empty() {
            return Some(Self::Ping);
        }

        match pdu.commands.as_slice() {
            [C::ConnectionTimeout(_)] => Some(Self::ConnA3),
            [C::Version(_), C::ReceiveWindowSize(_), C::ConnectionTimeout(_)] => Some(Self::ConnC2),
            [C::Destination(_)] => Some(Self::OutR1A2),
            [C::Version(_), C::ReceiveWindowSize(_)] => Some(Self::OutR2A6),
            [] if pdu.flags.contains(RtsFlags::EOF) => Some(Self::OutR2B3),
            [C::ClientKeepalive(_)] if pdu.commands.len() == 1 && pdu.flags.is_empty() => Some(Self::KeepAlive),
            [C::FlowControlAck { .. }] => Some(Self::FlowControlAck),
            [C::PingTrafficSentNotify(_)] => Some(Self::PingTrafficSentNotify),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(pdu: &RtsPdu) -> RtsPdu {
        let mut buf = vec![0u8; pdu.full_size()];
        {
            let mut writer = WriteCursor::new(&mut buf);
            pdu.encode_full(&mut writer).unwrap();
        }
        let mut reader = ReadCursor::new(&buf);
        let header = RpcCommonHeader::decode(&mut reader).unwrap();
        RtsPdu::decode_body(header, &mut reader).unwrap()
    }

    #[test]
    fn flow_control_ack_round_trips() {
        let pdu = RtsPdu::new(
            RtsFlags::NONE,
            vec![RtsCommand::FlowControlAck {
                bytes_received: 0x14000,
                available_window: 0x10000,
                channel_cookie: [7u8; 16],
            }],
        );
        let decoded = round_trip(&pdu);
        assert_eq!(decoded.commands, pdu.commands);
        assert_eq!(RtsPduKind::classify(&decoded), Some(RtsPduKind::FlowControlAck));
    }

    #[test]
    fn conn_a3_is_classified() {
        let pdu = RtsPdu::new(RtsFlags::NONE, vec![RtsCommand::ConnectionTimeout(60_000)]);
        assert_eq!(RtsPduKind::classify(&pdu), Some(RtsPduKind::ConnA3));
    }

    #[test]
    fn conn_c2_is_classified() {
        let pdu = RtsPdu::new(
            RtsFlags::NONE,
            vec![RtsCommand::Version(1), RtsCommand::ReceiveWindowSize(0x10000), RtsCommand::ConnectionTimeout(60_000)],
        );
        assert_eq!(RtsPduKind::classify(&pdu), Some(RtsPduKind::ConnC2));
    }

    #[test]
    fn out_r2_b3_requires_eof_flag() {
        let pdu = RtsPdu::new(RtsFlags::EOF, vec![]);
        assert_eq!(RtsPduKind::classify(&pdu), Some(RtsPduKind::OutR2B3));
        let not_eof = RtsPdu::new(RtsFlags::NONE, vec![]);
        assert_eq!(RtsPduKind::classify(&not_eof), None);
    }
}
