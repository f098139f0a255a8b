//! `PTYPE_REQUEST` / `PTYPE_RESPONSE` / `PTYPE_FAULT` PDUs (§4.2, §4.3 "Request/Response
//! framing").
//!
//! Stub data is the opaque NDR-encoded call payload produced by [`crate::pdu::tsgu`]; this
//! module only handles the envelope around it (fragment header, optional `sec_trailer` +
//! NTLM signature, 8-byte stub alignment).

use rdpcore_core::{ensure_size, invalid_field_err, other_err};
use rdpcore_core::{DecodeResult, Encode, EncodeResult, ReadCursor, WriteCursor};

use super::common::{align8, AuthLevel, AuthType, PacketType, PfcFlags, RpcCommonHeader, SecTrailer};

/// `PTYPE_REQUEST`: a client call, already NTLM-signed by the caller (§4.3).
#[derive(Debug, Clone)]
pub struct RequestPdu {
    pub call_id: u32,
    pub p_cont_id: u16,
    pub opnum: u16,
    pub stub: Vec<u8>,
    /// Present once the bind's `RPC_AUTH_3` has completed; `None` only during the bind
    /// sequence itself, which carries no `PTYPE_REQUEST`.
    pub auth_token: Option<Vec<u8>>,
}

impl RequestPdu {
    const NAME: &'static str = "RPC_REQUEST";
    /// Header(16) + alloc_hint(4) + p_cont_id(2) + opnum(2).
    const PREFIX_SIZE: usize = 16 + 4 + 2 + 2;

    pub fn encode_full(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        let stub_aligned = align8(self.stub.len());
        let auth_pad = stub_aligned - self.stub.len();
        let auth_len = self.auth_token.as_ref().map_or(0, Vec::len);
        let auth_length = u16::try_from(auth_len).map_err(|_| invalid_field_err!(Self::NAME, "auth_token", "too long"))?;
        let total = self.full_size();
        let frag_length = u16::try_from(total).map_err(|_| invalid_field_err!(Self::NAME, "pdu", "too long for one fragment"))?;

        let header = RpcCommonHeader::new(
            PacketType::Request,
            PfcFlags::FIRST_FRAG | PfcFlags::LAST_FRAG,
            frag_length,
            auth_length,
            self.call_id,
        );
        header.encode(dst)?;

        ensure_size!(ctx: Self::NAME, in: dst, size: 8);
        dst.write_u32(u32::try_from(self.stub.len()).unwrap_or(u32::MAX));
        dst.write_u16(self.p_cont_id);
        dst.write_u16(self.opnum);

        ensure_size!(ctx: Self::NAME, in: dst, size: stub_aligned);
        dst.write_slice(&self.stub);
        dst.write_slice(&vec![0u8; auth_pad]);

        if let Some(token) = &self.auth_token {
            let trailer = SecTrailer {
                auth_type: AuthType::WinNt,
                auth_level: AuthLevel::PktIntegrity,
                auth_pad_length: u8::try_from(auth_pad).unwrap_or(u8::MAX),
                auth_context_id: 0,
            };
            trailer.encode(dst)?;
            ensure_size!(ctx: Self::NAME, in: dst, size: token.len());
            dst.write_slice(token);
        }
        Ok(())
    }

    #[must_use]
    pub fn full_size(&self) -> usize {
        let stub_aligned = align8(self.stub.len());
        let auth_part = self.auth_token.as_ref().map_or(0, |t| SecTrailer::FIXED_PART_SIZE + t.len());
        Self::PREFIX_SIZE + stub_aligned + auth_part
    }
}

/// The stub-data slice of a response/request body, plus the raw `sec_trailer`+auth-token
/// bytes (if any) for signature verification by the caller.
pub struct BodyParts<'a> {
    pub stub: &'a [u8],
    pub sec_trailer_and_auth: Option<&'a [u8]>,
}

/// Splits `body` (everything after the common header, i.e. `frag_length - 16` bytes) into
/// stub data and the trailing `sec_trailer`+auth-token region, per `header.auth_length`.
///
/// Guards the subtraction the original FreeRDP dissector performs unchecked
/// (`frag_length - auth_length - 8`): a malicious or buggy peer advertising an `auth_length`
/// that doesn't fit in the fragment is rejected instead of underflowing (SPEC_FULL §9/§10).
pub fn split_trailer<'a>(header: &RpcCommonHeader, body: &'a [u8]) -> DecodeResult<BodyParts<'a>> {
    if header.auth_length == 0 {
        return Ok(BodyParts {
            stub: body,
            sec_trailer_and_auth: None,
        });
    }
    let auth_region = usize::from(header.auth_length) + SecTrailer::FIXED_PART_SIZE;
    let stub_end = body
        .len()
        .checked_sub(auth_region)
        .ok_or_else(|| other_err!("RPC_REQUEST", "auth_length exceeds fragment length"))?;
    Ok(BodyParts {
        stub: &body[..stub_end],
        sec_trailer_and_auth: Some(&body[stub_end..]),
    })
}

/// `PTYPE_RESPONSE`: server reply to a [`RequestPdu`] (§4.3).
#[derive(Debug, Clone)]
pub struct ResponsePdu {
    pub call_id: u32,
    pub p_cont_id: u16,
    pub alloc_hint: u32,
    pub stub: Vec<u8>,
}

impl ResponsePdu {
    const NAME: &'static str = "RPC_RESPONSE";

    /// Decodes everything up to (not including) `sec_trailer`; callers needing signature
    /// verification should call [`split_trailer`] on the raw body first.
    pub fn decode_body(header: RpcCommonHeader, src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        if header.ptype != PacketType::Response {
            return Err(invalid_field_err!(Self::NAME, "ptype", "not a RESPONSE"));
        }
        ensure_size!(ctx: Self::NAME, in: src, size: 8);
        let alloc_hint = src.read_u32();
        let p_cont_id = src.read_u16();
        let _cancel_count = src.read_u8();
        let _reserved = src.read_u8();
        let stub = src.remaining().to_vec();
        Ok(Self {
            call_id: header.call_id,
            p_cont_id,
            alloc_hint,
            stub,
        })
    }
}

/// `PTYPE_FAULT`: server-reported call failure (§4.3).
#[derive(Debug, Clone, Copy)]
pub struct FaultPdu {
    pub call_id: u32,
    pub status: u32,
}

impl FaultPdu {
    const NAME: &'static str = "RPC_FAULT";

    pub fn decode_body(header: RpcCommonHeader, src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        if header.ptype != PacketType::Fault {
            return Err(invalid_field_err!(Self::NAME, "ptype", "not a FAULT"));
        }
        ensure_size!(ctx: Self::NAME, in: src, size: 16);
        let _alloc_hint = src.read_u32();
        let _p_cont_id = src.read_u16();
        let _cancel_count = src.read_u8();
        let _reserved = src.read_u8();
        let status = src.read_u32();
        let _reserved2 = src.read_u32();
        Ok(Self {
            call_id: header.call_id,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_aligns_stub_to_eight_bytes() {
        let pdu = RequestPdu {
            call_id: 1,
            p_cont_id: 0,
            opnum: 1,
            stub: vec![1, 2, 3],
            auth_token: None,
        };
        let mut buf = vec![0u8; pdu.full_size()];
        let mut writer = WriteCursor::new(&mut buf);
        pdu.encode_full(&mut writer).unwrap();
        assert_eq!(pdu.full_size(), RequestPdu::PREFIX_SIZE + 8);
    }

    #[test]
    fn split_trailer_rejects_underflowing_auth_length() {
        let header = RpcCommonHeader::new(PacketType::Response, PfcFlags::FIRST_FRAG | PfcFlags::LAST_FRAG, 24, 0xFFFF, 1);
        let body = [0u8; 8];
        assert!(split_trailer(&header, &body).is_err());
    }

    #[test]
    fn split_trailer_passes_through_when_unauthenticated() {
        let header = RpcCommonHeader::new(PacketType::Response, PfcFlags::FIRST_FRAG | PfcFlags::LAST_FRAG, 24, 0, 1);
        let body = [1, 2, 3, 4];
        let parts = split_trailer(&header, &body).unwrap();
        assert_eq!(parts.stub, &body);
        assert!(parts.sec_trailer_and_auth.is_none());
    }
}
