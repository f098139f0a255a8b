//! `PTYPE_BIND` / `PTYPE_BIND_ACK` / `PTYPE_RPC_AUTH_3` PDUs (§4.2, §4.6 "Bind sequence").
//!
//! The client proposes exactly one presentation context: abstract syntax `TSGU` (the same
//! `44e265dd-7daf-42cd-8560-3cdb6e7a2729` UUID carried as `ResourceTypeUuid` in the HTTP
//! `Pragma` header, version 1.0) transferred as NDR (`8a885d04-1ceb-11c9-9fe8-08002b104860`,
//! version 2.0).

use rdpcore_core::{ensure_size, invalid_field_err};
use rdpcore_core::{Decode, DecodeResult, Encode, EncodeResult, ReadCursor, WriteCursor};

use super::common::{PacketType, PfcFlags, RpcCommonHeader, SecTrailer};

/// A DCE `p_syntax_id_t`: 16-byte UUID (wire-order GUID) + a 32-bit version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntaxId {
    pub uuid: uuid::Uuid,
    pub version: u32,
}

impl SyntaxId {
    const SIZE: usize = 20;

    pub const TSGU_ABSTRACT: SyntaxId = SyntaxId {
        uuid: uuid::uuid!("44e265dd-7daf-42cd-8560-3cdb6e7a2729"),
        version: 0x0001_0000,
    };
    pub const NDR_TRANSFER: SyntaxId = SyntaxId {
        uuid: uuid::uuid!("8a885d04-1ceb-11c9-9fe8-08002b104860"),
        version: 0x0002_0000,
    };

    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: "SYNTAX_ID", in: dst, size: Self::SIZE);
        dst.write_slice(self.uuid.as_bytes());
        dst.write_u32(self.version);
        Ok(())
    }

    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: "SYNTAX_ID", in: src, size: Self::SIZE);
        let bytes: [u8; 16] = src.read_array();
        let uuid = uuid::Uuid::from_bytes(bytes);
        let version = src.read_u32();
        Ok(Self { uuid, version })
    }
}

/// `PTYPE_BIND`: one presentation context proposing `TSGU`/`NDR` (§4.6).
///
/// Carries the NTLM `NEGOTIATE_MESSAGE` as the bind's own `sec_trailer` auth token: without
/// it the gateway has nothing to challenge and never emits the `BIND_ACK`'s NTLM type 2.
#[derive(Debug, Clone)]
pub struct BindPdu {
    pub call_id: u32,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub p_context_id: u16,
    pub auth_token: Option<Vec<u8>>,
}

impl BindPdu {
    const NAME: &'static str = "RPC_BIND";
    const BODY_SIZE: usize = 2 + 2 + 4 + 2 /* num_contexts+context_id+n_transfer_syn */ + 2 * SyntaxId::SIZE;

    #[must_use]
    pub fn new(call_id: u32, max_frag: u16, auth_token: Option<Vec<u8>>) -> Self {
        Self {
            call_id,
            max_xmit_frag: max_frag,
            max_recv_frag: max_frag,
            assoc_group_id: 0,
            p_context_id: 0,
            auth_token,
        }
    }

    pub fn encode_full(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        let auth_length = self
            .auth_token
            .as_ref()
            .map_or(Ok(0), |t| u16::try_from(t.len()).map_err(|_| invalid_field_err!(Self::NAME, "auth_token", "too long")))?;
        let header = RpcCommonHeader::new(
            PacketType::Bind,
            PfcFlags::FIRST_FRAG | PfcFlags::LAST_FRAG,
            u16::try_from(self.full_size()).unwrap_or(u16::MAX),
            auth_length,
            self.call_id,
        );
        header.encode(dst)?;
        ensure_size!(ctx: Self::NAME, in: dst, size: Self::BODY_SIZE);
        dst.write_u16(self.max_xmit_frag);
        dst.write_u16(self.max_recv_frag);
        dst.write_u32(self.assoc_group_id);
        dst.write_u8(1); // n_context_elem
        dst.write_u8(0);
        dst.write_u16(0); // reserved2
        dst.write_u16(self.p_context_id);
        dst.write_u8(1); // n_transfer_syn
        dst.write_u8(0); // reserved
        SyntaxId::TSGU_ABSTRACT.encode(dst)?;
        SyntaxId::NDR_TRANSFER.encode(dst)?;

        if let Some(token) = &self.auth_token {
            let trailer = SecTrailer {
                auth_type: super::common::AuthType::WinNt,
                auth_level: super::common::AuthLevel::PktIntegrity,
                auth_pad_length: 0,
                auth_context_id: 0,
            };
            trailer.encode(dst)?;
            ensure_size!(ctx: Self::NAME, in: dst, size: token.len());
            dst.write_slice(token);
        }
        Ok(())
    }

    pub fn full_size(&self) -> usize {
        let auth_part = self.auth_token.as_ref().map_or(0, |t| SecTrailer::FIXED_PART_SIZE + t.len());
        RpcCommonHeader::FIXED_PART_SIZE + Self::BODY_SIZE + auth_part
    }
}

/// Result codes carried by `PTYPE_BIND_ACK`'s single presentation-result entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindAckResult {
    Acceptance,
    UserRejection,
    ProviderRejection(u16),
}

#[derive(Debug, Clone)]
pub struct BindAckPdu {
    pub call_id: u32,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub result: BindAckResult,
    /// NTLM `CHALLENGE_MESSAGE` carried in `sec_trailer`'s auth token, when present.
    pub ntlm_challenge: Option<Vec<u8>>,
}

impl BindAckPdu {
    const NAME: &'static str = "RPC_BIND_ACK";

    pub fn decode_body(header: RpcCommonHeader, src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        if header.ptype != PacketType::BindAck {
            return Err(invalid_field_err!(Self::NAME, "ptype", "not a BIND_ACK"));
        }
        ensure_size!(ctx: Self::NAME, in: src, size: 8);
        let max_xmit_frag = src.read_u16();
        let max_recv_frag = src.read_u16();
        let _assoc_group_id = src.read_u32();

        // sec_addr_t: port-any-t string (length-prefixed), then pad to 4-byte alignment.
        ensure_size!(ctx: Self::NAME, in: src, size: 2);
        let port_len = src.read_u16() as usize;
        ensure_size!(ctx: Self::NAME, in: src, size: port_len);
        let _ = src.read_slice(port_len);
        let consumed_since_frag = 8 + 2 + port_len;
        let pad = (4 - (consumed_since_frag % 4)) % 4;
        if pad > 0 {
            ensure_size!(ctx: Self::NAME, in: src, size: pad);
            let _ = src.read_slice(pad);
        }

        ensure_size!(ctx: Self::NAME, in: src, size: 4);
        let n_results = src.read_u8();
        let _reserved = src.read_array::<3>();
        let mut result = BindAckResult::Acceptance;
        for _ in 0..n_results {
            ensure_size!(ctx: Self::NAME, in: src, size: 4);
            let code = src.read_u16();
            let reason = src.read_u16();
            result = match code {
                0 => {
                    let _transfer_syntax = SyntaxId::decode(src)?;
                    BindAckResult::Acceptance
                }
                2 => BindAckResult::UserRejection,
                _ => BindAckResult::ProviderRejection(reason),
            };
        }

        // Everything consumed so far sits before `sec_trailer`; what's left in `src` is
        // exactly the 8-byte trailer plus the NTLM `CHALLENGE_MESSAGE` auth token, since the
        // presentation-result list is the last fixed-shape field before it (§4.2 "auth
        // trailer", §4.6 "Server replies BIND_ACK with sec_trailer carrying NTLM type 2").
        let ntlm_challenge = if header.auth_length > 0 && !src.remaining().is_empty() {
            let _trailer = SecTrailer::decode(src)?;
            Some(src.remaining().to_vec())
        } else {
            None
        };

        Ok(Self {
            call_id: header.call_id,
            max_xmit_frag,
            max_recv_frag,
            result,
            ntlm_challenge,
        })
    }
}

/// `PTYPE_RPC_AUTH_3`: completes the bind by sending the NTLM `AUTHENTICATE_MESSAGE`, with
/// no stub data of its own (§4.6).
#[derive(Debug, Clone)]
pub struct Auth3Pdu {
    pub call_id: u32,
    pub auth_token: Vec<u8>,
}

impl Auth3Pdu {
    const NAME: &'static str = "RPC_AUTH_3";

    pub fn encode_full(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        let auth_length = u16::try_from(self.auth_token.len()).map_err(|_| invalid_field_err!(Self::NAME, "auth_token", "too long"))?;
        let header = RpcCommonHeader::new(
            PacketType::RpcAuth3,
            PfcFlags::FIRST_FRAG | PfcFlags::LAST_FRAG,
            u16::try_from(self.full_size()).unwrap_or(u16::MAX),
            auth_length,
            self.call_id,
        );
        header.encode(dst)?;
        // 4-byte padding before sec_trailer for PTYPE_RPC_AUTH_3 (no stub data at all).
        ensure_size!(ctx: Self::NAME, in: dst, size: 4);
        dst.write_u32(0);
        let trailer = SecTrailer {
            auth_type: super::common::AuthType::WinNt,
            auth_level: super::common::AuthLevel::PktIntegrity,
            auth_pad_length: 0,
            auth_context_id: 0,
        };
        trailer.encode(dst)?;
        ensure_size!(ctx: Self::NAME, in: dst, size: self.auth_token.len());
        dst.write_slice(&self.auth_token);
        Ok(())
    }

    pub fn full_size(&self) -> usize {
        RpcCommonHeader::FIXED_PART_SIZE + 4 + SecTrailer::FIXED_PART_SIZE + self.auth_token.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_encodes_tsgu_presentation_context() {
        let bind = BindPdu::new(2, 0x0FF8, None);
        let mut buf = vec![0u8; bind.full_size()];
        let mut writer = WriteCursor::new(&mut buf);
        bind.encode_full(&mut writer).unwrap();
        // TSGU abstract syntax UUID bytes must appear verbatim in the encoded body.
        assert!(buf.windows(16).any(|w| w == SyntaxId::TSGU_ABSTRACT.uuid.as_bytes()));
    }

    #[test]
    fn auth3_carries_no_stub_data() {
        let pdu = Auth3Pdu {
            call_id: 3,
            auth_token: vec![1, 2, 3, 4],
        };
        assert_eq!(pdu.full_size(), 16 + 4 + 8 + 4);
    }
}
