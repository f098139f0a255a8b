//! [MS-RDPESC] smartcard ioctl bodies (§4.13): the 28-ish PCSC-like functions carried inside
//! `DeviceControlRequest`/`DeviceControlResponse` for a [`DeviceType::Smartcard`](super::efs::DeviceType::Smartcard)
//! device. Every body is wrapped in the [MS-RPCE] envelope from [`super::rpce`] and uses the
//! NDR pointer/value split from [`super::ndr`].
//!
//! This module only marshals bytes to and from these types; dispatching them to an actual PCSC
//! stack is the job of a `ScardBackend` implementor elsewhere in this crate.

use rdpcore_core::{cast_length, ensure_size, invalid_field_err, unsupported_value_err};
use rdpcore_core::{DecodeResult, EncodeResult, ReadCursor, WriteCursor};

use super::ndr;
use super::rpce::{HeaderlessDecode, HeaderlessEncode};

/// SCARD_CTL_CODE function numbers, before the `+4` wide-string adjustment described in §4.13.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ScardIoCtlCode {
    EstablishContext = 0x0009_0014,
    ReleaseContext = 0x0009_0018,
    IsValidContext = 0x0009_001C,
    ListReadersA = 0x0009_0028,
    ListReadersW = 0x0009_002C,
    GetStatusChangeA = 0x0009_00A0,
    GetStatusChangeW = 0x0009_00A4,
    Cancel = 0x0009_00A8,
    ConnectA = 0x0009_00AC,
    ConnectW = 0x0009_00B0,
    Reconnect = 0x0009_00B4,
    Disconnect = 0x0009_00B8,
    BeginTransaction = 0x0009_00BC,
    EndTransaction = 0x0009_00C0,
    State = 0x0009_00C4,
    StatusA = 0x0009_00C8,
    StatusW = 0x0009_00CC,
    Transmit = 0x0009_00D0,
    Control = 0x0009_00D4,
    GetAttrib = 0x0009_00D8,
    AccessStartedEvent = 0x0009_00E0,
    LocateCardsByAtrA = 0x0009_00E8,
    GetDeviceTypeId = 0x0009_0140,
    ReadCacheA = 0x0009_0150,
    ReadCacheW = 0x0009_0154,
    WriteCacheA = 0x0009_0158,
    WriteCacheW = 0x0009_015C,
    LocateCardsByAtrW = 0x0009_0168,
}

impl ScardIoCtlCode {
    /// Translates a raw `SCARD_CTL_CODE` received over the wire, as described in §4.13: the
    /// high 16 bits must equal `FILE_DEVICE_SMARTCARD` (0x31).
    pub fn from_raw(value: u32) -> DecodeResult<Self> {
        const FILE_DEVICE_SMARTCARD: u32 = 0x31;
        if (value >> 16) != FILE_DEVICE_SMARTCARD {
            return Err(unsupported_value_err!("ScardIoCtlCode", "device", value >> 16));
        }
        Self::from_function_code(value)
    }

    fn from_function_code(value: u32) -> DecodeResult<Self> {
        Ok(match value {
            0x0009_0014 => Self::EstablishContext,
            0x0009_0018 => Self::ReleaseContext,
            0x0009_001C => Self::IsValidContext,
            0x0009_0028 => Self::ListReadersA,
            0x0009_002C => Self::ListReadersW,
            0x0009_00A0 => Self::GetStatusChangeA,
            0x0009_00A4 => Self::GetStatusChangeW,
            0x0009_00A8 => Self::Cancel,
            0x0009_00AC => Self::ConnectA,
            0x0009_00B0 => Self::ConnectW,
            0x0009_00B4 => Self::Reconnect,
            0x0009_00B8 => Self::Disconnect,
            0x0009_00BC => Self::BeginTransaction,
            0x0009_00C0 => Self::EndTransaction,
            0x0009_00C4 => Self::State,
            0x0009_00C8 => Self::StatusA,
            0x0009_00CC => Self::StatusW,
            0x0009_00D0 => Self::Transmit,
            0x0009_00D4 => Self::Control,
            0x0009_00D8 => Self::GetAttrib,
            0x0009_00E0 => Self::AccessStartedEvent,
            0x0009_00E8 => Self::LocateCardsByAtrA,
            0x0009_0140 => Self::GetDeviceTypeId,
            0x0009_0150 => Self::ReadCacheA,
            0x0009_0154 => Self::ReadCacheW,
            0x0009_0158 => Self::WriteCacheA,
            0x0009_015C => Self::WriteCacheW,
            0x0009_0168 => Self::LocateCardsByAtrW,
            other => return Err(unsupported_value_err!("ScardIoCtlCode", "function", other)),
        })
    }

    /// Whether this opcode's strings are UTF-16 (`W` suffix) rather than single-byte (`A` suffix).
    pub fn is_wide(self) -> bool {
        matches!(
            self,
            Self::ListReadersW
                | Self::GetStatusChangeW
                | Self::ConnectW
                | Self::StatusW
                | Self::ReadCacheW
                | Self::WriteCacheW
                | Self::LocateCardsByAtrW
        )
    }
}

/// One decoded smartcard ioctl request body, dispatched to a fresh worker task or the device's
/// own worker per the blocking/non-blocking split in §4.13.
#[derive(Debug)]
pub enum ScardCall {
    AccessStartedEvent,
    EstablishContext(EstablishContextCall),
    ReleaseContext(ContextCall),
    IsValidContext(ContextCall),
    ListReaders(ListReadersCall),
    GetStatusChange(GetStatusChangeCall),
    Cancel(ContextCall),
    Connect(ConnectCall),
    Reconnect(HCardAndDispositionCall),
    Disconnect(HCardAndDispositionCall),
    BeginTransaction(HCardAndDispositionCall),
    EndTransaction(HCardAndDispositionCall),
    Status(StatusCall),
    Transmit(TransmitCall),
    Control(ControlCall),
    GetAttrib(GetAttribCall),
    GetDeviceTypeId(GetDeviceTypeIdCall),
    ReadCache(ReadCacheCall),
    WriteCache(WriteCacheCall),
}

impl ScardCall {
    pub fn decode(code: ScardIoCtlCode, src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        Ok(match code {
            ScardIoCtlCode::AccessStartedEvent => Self::AccessStartedEvent,
            ScardIoCtlCode::EstablishContext => Self::EstablishContext(decode_rpce(src)?),
            ScardIoCtlCode::ReleaseContext => Self::ReleaseContext(decode_rpce(src)?),
            ScardIoCtlCode::IsValidContext => Self::IsValidContext(decode_rpce(src)?),
            ScardIoCtlCode::ListReadersA | ScardIoCtlCode::ListReadersW => Self::ListReaders(decode_rpce(src)?),
            ScardIoCtlCode::GetStatusChangeA | ScardIoCtlCode::GetStatusChangeW => {
                Self::GetStatusChange(decode_rpce(src)?)
            }
            ScardIoCtlCode::Cancel => Self::Cancel(decode_rpce(src)?),
            ScardIoCtlCode::ConnectA | ScardIoCtlCode::ConnectW => Self::Connect(decode_rpce(src)?),
            ScardIoCtlCode::Reconnect => Self::Reconnect(decode_rpce(src)?),
            ScardIoCtlCode::Disconnect => Self::Disconnect(decode_rpce(src)?),
            ScardIoCtlCode::BeginTransaction => Self::BeginTransaction(decode_rpce(src)?),
            ScardIoCtlCode::EndTransaction => Self::EndTransaction(decode_rpce(src)?),
            ScardIoCtlCode::StatusA | ScardIoCtlCode::StatusW => Self::Status(decode_rpce(src)?),
            ScardIoCtlCode::Transmit => Self::Transmit(decode_rpce(src)?),
            ScardIoCtlCode::Control => Self::Control(decode_rpce(src)?),
            ScardIoCtlCode::GetAttrib => Self::GetAttrib(decode_rpce(src)?),
            ScardIoCtlCode::GetDeviceTypeId => Self::GetDeviceTypeId(decode_rpce(src)?),
            ScardIoCtlCode::ReadCacheA | ScardIoCtlCode::ReadCacheW => Self::ReadCache(decode_rpce(src)?),
            ScardIoCtlCode::WriteCacheA | ScardIoCtlCode::WriteCacheW => Self::WriteCache(decode_rpce(src)?),
            ScardIoCtlCode::State | ScardIoCtlCode::LocateCardsByAtrA | ScardIoCtlCode::LocateCardsByAtrW => {
                return Err(unsupported_value_err!("ScardCall", "ioctl", code as u32));
            }
        })
    }

    /// True if this call may block the calling thread and should run on its own worker task.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::GetStatusChange(_) | Self::Transmit(_) | Self::Status(_))
    }
}

fn decode_rpce<T: HeaderlessDecode>(src: &mut ReadCursor<'_>) -> DecodeResult<T> {
    Ok(super::rpce::RpcePdu::decode(src)?.into_inner())
}

/// [2.2.1.1] REDIR_SCARDCONTEXT: an opaque PCSC context handle, always encoded as 4 bytes here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScardContext {
    pub value: u32,
}

impl ScardContext {
    const VALUE_LENGTH: u32 = 4;

    pub fn new(value: u32) -> Self {
        Self { value }
    }

    fn encode_ptr(&self, index: &mut u32, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ndr::encode_ptr(Some(Self::VALUE_LENGTH), index, dst)
    }

    fn encode_value(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: "ScardContext", in: dst, size: 8);
        dst.write_u32(Self::VALUE_LENGTH);
        dst.write_u32(self.value);
        Ok(())
    }

    fn decode_ptr(src: &mut ReadCursor<'_>, index: &mut u32) -> DecodeResult<u32> {
        ndr::decode_ptr(src, index)
    }

    fn decode_value(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: "ScardContext", in: src, size: 8);
        let length = src.read_u32();
        if length != Self::VALUE_LENGTH {
            return Err(invalid_field_err!("ScardContext", "cbContext", "unsupported length"));
        }
        Ok(Self { value: src.read_u32() })
    }
}

/// [2.2.1.2] REDIR_SCARDHANDLE: a context plus a handle value within that context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScardHandle {
    pub context: ScardContext,
    pub value: u32,
}

impl ScardHandle {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let context = ScardContext::decode_value(src)?;
        ensure_size!(ctx: "ScardHandle", in: src, size: 8);
        let _length = src.read_u32();
        let value = src.read_u32();
        Ok(Self { context, value })
    }

    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        self.context.encode_value(dst)?;
        ensure_size!(ctx: "ScardHandle", in: dst, size: 8);
        dst.write_u32(4);
        dst.write_u32(self.value);
        Ok(())
    }
}

#[derive(Debug)]
pub struct EstablishContextCall {
    pub scope: u32,
}

impl HeaderlessDecode for EstablishContextCall {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: "EstablishContext_Call", in: src, size: 4);
        Ok(Self { scope: src.read_u32() })
    }
}

#[derive(Debug)]
pub struct EstablishContextReturn {
    pub context: ScardContext,
}

impl HeaderlessEncode for EstablishContextReturn {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        let mut index = 0;
        self.context.encode_ptr(&mut index, dst)?;
        self.context.encode_value(dst)
    }

    fn name(&self) -> &'static str {
        "EstablishContext_Return"
    }

    fn size(&self) -> usize {
        ndr::ptr_size(true) + 8
    }
}

/// Carries just a context: used by ReleaseContext, IsValidContext and Cancel.
#[derive(Debug)]
pub struct ContextCall {
    pub context: ScardContext,
}

impl HeaderlessDecode for ContextCall {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let mut index = 0;
        let _ptr = ScardContext::decode_ptr(src, &mut index)?;
        let context = ScardContext::decode_value(src)?;
        Ok(Self { context })
    }
}

#[derive(Debug)]
pub struct ListReadersCall {
    pub context: ScardContext,
    pub groups: Vec<String>,
    pub wide: bool,
}

impl HeaderlessDecode for ListReadersCall {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let mut index = 0;
        let _ctx_ptr = ScardContext::decode_ptr(src, &mut index)?;
        ensure_size!(ctx: "ListReaders_Call", in: src, size: 8);
        let groups_len = src.read_u32();
        let _groups_ptr = ndr::decode_ptr(src, &mut index)?;
        let _readers_is_null = src.read_u32();
        ensure_size!(ctx: "ListReaders_Call", in: src, size: 4);
        let _readers_len = src.read_u32();

        let context = ScardContext::decode_value(src)?;
        let groups = if groups_len > 0 {
            let s = ndr::read_unicode_string_value(src)?;
            s.split('\0').filter(|g| !g.is_empty()).map(str::to_owned).collect()
        } else {
            Vec::new()
        };
        Ok(Self {
            context,
            groups,
            wide: true,
        })
    }
}

#[derive(Debug)]
pub struct ListReadersReturn {
    pub readers: Vec<String>,
}

impl HeaderlessEncode for ListReadersReturn {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        let joined = {
            let mut s = self.readers.join("\0");
            s.push('\0');
            s.push('\0');
            s
        };
        let mut index = 0;
        ndr::encode_ptr(Some(cast_length!("ListReaders_Return", "msz", joined.encode_utf16().count() * 2)?), &mut index, dst)?;
        ndr::write_unicode_string_value(&joined, dst)
    }

    fn name(&self) -> &'static str {
        "ListReaders_Return"
    }

    fn size(&self) -> usize {
        let mut joined = self.readers.join("\0");
        joined.push('\0');
        joined.push('\0');
        ndr::ptr_size(false) + 12 + joined.encode_utf16().count() * 2
    }
}

/// [2.2.1.6] A single reader state request/response entry.
#[derive(Debug, Clone)]
pub struct ReaderStateCommon {
    pub current_state: u32,
    pub event_state: u32,
    pub atr: Vec<u8>,
}

#[derive(Debug)]
pub struct GetStatusChangeCall {
    pub context: ScardContext,
    pub timeout: u32,
    pub states: Vec<(String, ReaderStateCommon)>,
}

impl HeaderlessDecode for GetStatusChangeCall {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let mut index = 0;
        let _ctx_ptr = ScardContext::decode_ptr(src, &mut index)?;
        ensure_size!(ctx: "GetStatusChange_Call", in: src, size: 8);
        let timeout = src.read_u32();
        let count = src.read_u32();
        let _states_ptr = ndr::decode_ptr(src, &mut index)?;

        let context = ScardContext::decode_value(src)?;
        ensure_size!(ctx: "GetStatusChange_Call", in: src, size: 4);
        let conformance = src.read_u32();
        if conformance != count {
            return Err(invalid_field_err!("GetStatusChange_Call", "count", "conformance mismatch"));
        }

        let mut names = Vec::with_capacity(count as usize);
        let mut commons = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let _reader_ptr = ndr::decode_ptr(src, &mut index)?;
            ensure_size!(ctx: "ReaderStateW", in: src, size: 44);
            let current_state = src.read_u32();
            let event_state = src.read_u32();
            let atr_len = src.read_u32().min(36) as usize;
            let atr = src.read_array::<36>();
            commons.push(ReaderStateCommon {
                current_state,
                event_state,
                atr: atr[..atr_len].to_vec(),
            });
        }
        for common in &commons {
            let _ = common;
            let name = ndr::read_unicode_string_value(src)?;
            names.push(name);
        }

        let states = names.into_iter().zip(commons).collect();
        Ok(Self { context, timeout, states })
    }
}

#[derive(Debug)]
pub struct GetStatusChangeReturn {
    pub states: Vec<ReaderStateCommon>,
}

impl HeaderlessEncode for GetStatusChangeReturn {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: "GetStatusChange_Return", in: dst, size: self.size());
        dst.write_u32(cast_length!("GetStatusChange_Return", "count", self.states.len())?);
        let mut index = 0;
        ndr::encode_ptr(None, &mut index, dst)?;
        ensure_size!(ctx: "GetStatusChange_Return", in: dst, size: 4);
        dst.write_u32(cast_length!("GetStatusChange_Return", "count", self.states.len())?);
        for state in &self.states {
            dst.write_u32(state.current_state);
            dst.write_u32(state.event_state);
            dst.write_u32(cast_length!("GetStatusChange_Return", "cbAtr", state.atr.len())?);
            let mut atr = [0u8; 36];
            let n = state.atr.len().min(36);
            atr[..n].copy_from_slice(&state.atr[..n]);
            dst.write_slice(&atr);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "GetStatusChange_Return"
    }

    fn size(&self) -> usize {
        8 + ndr::ptr_size(false) + self.states.len() * 44
    }
}

#[derive(Debug)]
pub struct ConnectCall {
    pub reader: String,
    pub context: ScardContext,
    pub share_mode: u32,
    pub preferred_protocols: u32,
}

impl HeaderlessDecode for ConnectCall {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let mut index = 0;
        let _reader_ptr = ndr::decode_ptr(src, &mut index)?;
        let _ctx_ptr = ScardContext::decode_ptr(src, &mut index)?;
        ensure_size!(ctx: "Connect_Call", in: src, size: 8);
        let share_mode = src.read_u32();
        let preferred_protocols = src.read_u32();

        let reader = ndr::read_unicode_string_value(src)?;
        let context = ScardContext::decode_value(src)?;
        Ok(Self {
            reader,
            context,
            share_mode,
            preferred_protocols,
        })
    }
}

#[derive(Debug)]
pub struct ConnectReturn {
    pub handle: ScardHandle,
    pub active_protocol: u32,
}

impl HeaderlessEncode for ConnectReturn {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        let mut index = 0;
        self.handle.context.encode_ptr(&mut index, dst)?;
        ensure_size!(ctx: "Connect_Return", in: dst, size: 4);
        ndr::encode_ptr(Some(4), &mut index, dst)?;
        self.handle.context.encode_value(dst)?;
        ensure_size!(ctx: "Connect_Return", in: dst, size: 8);
        dst.write_u32(4);
        dst.write_u32(self.handle.value);
        dst.write_u32(self.active_protocol);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Connect_Return"
    }

    fn size(&self) -> usize {
        ndr::ptr_size(true) + ndr::ptr_size(true) + 8 + 8 + 4
    }
}

#[derive(Debug)]
pub struct HCardAndDispositionCall {
    pub handle: ScardHandle,
    pub disposition: u32,
}

impl HeaderlessDecode for HCardAndDispositionCall {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let mut index = 0;
        let _ctx_ptr = ScardContext::decode_ptr(src, &mut index)?;
        ensure_size!(ctx: "HCardAndDisposition_Call", in: src, size: 4);
        let _handle_ptr = ndr::decode_ptr(src, &mut index)?;
        let disposition = {
            ensure_size!(ctx: "HCardAndDisposition_Call", in: src, size: 4);
            src.read_u32()
        };
        let handle = ScardHandle::decode(src)?;
        Ok(Self { handle, disposition })
    }
}

#[derive(Debug)]
pub struct StatusCall {
    pub handle: ScardHandle,
    pub wide: bool,
}

impl HeaderlessDecode for StatusCall {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let handle = ScardHandle::decode(src)?;
        ensure_size!(ctx: "Status_Call", in: src, size: 8);
        let _reader_names_is_null = src.read_u32();
        let _atr_len = src.read_u32();
        Ok(Self { handle, wide: true })
    }
}

#[derive(Debug)]
pub struct StatusReturn {
    pub reader_names: Vec<String>,
    pub state: u32,
    pub protocol: u32,
    pub atr: Vec<u8>,
}

impl HeaderlessEncode for StatusReturn {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        let mut joined = self.reader_names.join("\0");
        joined.push('\0');
        joined.push('\0');
        let mut index = 0;
        ndr::encode_ptr(Some(cast_length!("Status_Return", "msz", joined.encode_utf16().count() * 2)?), &mut index, dst)?;
        ensure_size!(ctx: "Status_Return", in: dst, size: 12 + self.atr.len().min(32));
        dst.write_u32(self.state);
        dst.write_u32(self.protocol);
        let mut atr = [0u8; 32];
        let n = self.atr.len().min(32);
        atr[..n].copy_from_slice(&self.atr[..n]);
        dst.write_slice(&atr);
        dst.write_u32(cast_length!("Status_Return", "cbAtr", self.atr.len())?);
        ndr::write_unicode_string_value(&joined, dst)
    }

    fn name(&self) -> &'static str {
        "Status_Return"
    }

    fn size(&self) -> usize {
        let mut joined = self.reader_names.join("\0");
        joined.push('\0');
        joined.push('\0');
        ndr::ptr_size(false) + 8 + 32 + 4 + 12 + joined.encode_utf16().count() * 2
    }
}

#[derive(Debug)]
pub struct TransmitCall {
    pub handle: ScardHandle,
    pub send_protocol: u32,
    pub send_buffer: Vec<u8>,
    pub recv_buffer_size: Option<u32>,
}

impl HeaderlessDecode for TransmitCall {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let mut index = 0;
        let _ctx_ptr = ScardContext::decode_ptr(src, &mut index)?;
        ensure_size!(ctx: "Transmit_Call", in: src, size: 4);
        let _handle_ptr = ndr::decode_ptr(src, &mut index)?;
        ensure_size!(ctx: "Transmit_Call", in: src, size: 8);
        let send_protocol = src.read_u32();
        let _send_pci_extra_len = src.read_u32();
        let _send_pci_ptr = ndr::decode_ptr(src, &mut index)?;
        ensure_size!(ctx: "Transmit_Call", in: src, size: 4);
        let send_len = src.read_u32();
        let _send_buffer_ptr = ndr::decode_ptr(src, &mut index)?;
        ensure_size!(ctx: "Transmit_Call", in: src, size: 4);
        let recv_pci_is_null = src.read_u32();
        let _recv_pci_ptr = if recv_pci_is_null == 0 { ndr::decode_ptr(src, &mut index)? } else { 0 };
        ensure_size!(ctx: "Transmit_Call", in: src, size: 4);
        let recv_buffer_is_null = src.read_u32();
        let recv_buffer_size = if recv_buffer_is_null == 0 {
            ensure_size!(ctx: "Transmit_Call", in: src, size: 4);
            Some(src.read_u32())
        } else {
            None
        };

        let handle = ScardHandle::decode(src)?;
        ensure_size!(ctx: "Transmit_Call", in: src, size: 8);
        let _send_pci_protocol = src.read_u32();
        let _send_pci_len = src.read_u32();
        ensure_size!(ctx: "Transmit_Call", in: src, size: 4);
        let declared_send_len = src.read_u32();
        if declared_send_len != send_len {
            return Err(invalid_field_err!("Transmit_Call", "cbSendLength", "conformance mismatch"));
        }
        let send_buffer = src.read_slice(send_len as usize).to_vec();

        Ok(Self {
            handle,
            send_protocol,
            send_buffer,
            recv_buffer_size,
        })
    }
}

#[derive(Debug)]
pub struct TransmitReturn {
    pub recv_buffer: Vec<u8>,
}

impl HeaderlessEncode for TransmitReturn {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        let mut index = 0;
        ndr::encode_ptr(None, &mut index, dst)?;
        ensure_size!(ctx: "Transmit_Return", in: dst, size: 4);
        dst.write_u32(cast_length!("Transmit_Return", "cbRecvLength", self.recv_buffer.len())?);
        ndr::encode_ptr(Some(cast_length!("Transmit_Return", "cbRecvLength", self.recv_buffer.len())?), &mut index, dst)?;
        ensure_size!(ctx: "Transmit_Return", in: dst, size: 4);
        dst.write_u32(cast_length!("Transmit_Return", "cbRecvLength", self.recv_buffer.len())?);
        dst.write_slice(&self.recv_buffer);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Transmit_Return"
    }

    fn size(&self) -> usize {
        ndr::ptr_size(false) + 4 + ndr::ptr_size(true) + self.recv_buffer.len()
    }
}

#[derive(Debug)]
pub struct ControlCall {
    pub handle: ScardHandle,
    pub control_code: u32,
    pub input: Vec<u8>,
    pub output_size: u32,
}

impl HeaderlessDecode for ControlCall {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let mut index = 0;
        let _ctx_ptr = ScardContext::decode_ptr(src, &mut index)?;
        ensure_size!(ctx: "Control_Call", in: src, size: 4);
        let _handle_ptr = ndr::decode_ptr(src, &mut index)?;
        ensure_size!(ctx: "Control_Call", in: src, size: 16);
        let control_code = src.read_u32();
        let input_len = src.read_u32();
        let _input_ptr = ndr::decode_ptr(src, &mut index)?;
        let output_size = src.read_u32();

        let handle = ScardHandle::decode(src)?;
        ensure_size!(ctx: "Control_Call", in: src, size: 4);
        let declared_input_len = src.read_u32();
        if declared_input_len != input_len {
            return Err(invalid_field_err!("Control_Call", "cbInBufferSize", "conformance mismatch"));
        }
        let input = src.read_slice(input_len as usize).to_vec();
        Ok(Self {
            handle,
            control_code,
            input,
            output_size,
        })
    }
}

#[derive(Debug)]
pub struct ControlReturn {
    pub output: Vec<u8>,
}

impl HeaderlessEncode for ControlReturn {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: "Control_Return", in: dst, size: 4);
        dst.write_u32(cast_length!("Control_Return", "cbOutBufferSize", self.output.len())?);
        let mut index = 0;
        ndr::encode_ptr(Some(cast_length!("Control_Return", "cbOutBufferSize", self.output.len())?), &mut index, dst)?;
        ensure_size!(ctx: "Control_Return", in: dst, size: 4);
        dst.write_u32(cast_length!("Control_Return", "cbOutBufferSize", self.output.len())?);
        dst.write_slice(&self.output);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Control_Return"
    }

    fn size(&self) -> usize {
        4 + ndr::ptr_size(true) + 4 + self.output.len()
    }
}

#[derive(Debug)]
pub struct GetAttribCall {
    pub handle: ScardHandle,
    pub attrib_id: u32,
    pub output_size: u32,
}

impl HeaderlessDecode for GetAttribCall {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let handle = ScardHandle::decode(src)?;
        ensure_size!(ctx: "GetAttrib_Call", in: src, size: 16);
        let attrib_id = src.read_u32();
        let _attr_len = src.read_u32();
        let _attr_is_null = src.read_u32();
        let output_size = src.read_u32();
        Ok(Self {
            handle,
            attrib_id,
            output_size,
        })
    }
}

#[derive(Debug)]
pub struct GetAttribReturn {
    pub attrib: Vec<u8>,
}

impl HeaderlessEncode for GetAttribReturn {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: "GetAttrib_Return", in: dst, size: 4);
        dst.write_u32(cast_length!("GetAttrib_Return", "cbAttrLen", self.attrib.len())?);
        let mut index = 0;
        ndr::encode_ptr(Some(cast_length!("GetAttrib_Return", "cbAttrLen", self.attrib.len())?), &mut index, dst)?;
        ensure_size!(ctx: "GetAttrib_Return", in: dst, size: 4);
        dst.write_u32(cast_length!("GetAttrib_Return", "cbAttrLen", self.attrib.len())?);
        dst.write_slice(&self.attrib);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "GetAttrib_Return"
    }

    fn size(&self) -> usize {
        4 + ndr::ptr_size(true) + 4 + self.attrib.len()
    }
}

#[derive(Debug)]
pub struct GetDeviceTypeIdCall {
    pub context: ScardContext,
    pub reader_name: String,
}

impl HeaderlessDecode for GetDeviceTypeIdCall {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let mut index = 0;
        let _ctx_ptr = ScardContext::decode_ptr(src, &mut index)?;
        let _reader_ptr = ndr::decode_ptr(src, &mut index)?;
        let context = ScardContext::decode_value(src)?;
        let reader_name = ndr::read_unicode_string_value(src)?;
        Ok(Self { context, reader_name })
    }
}

#[derive(Debug)]
pub struct GetDeviceTypeIdReturn {
    pub device_type_id: u32,
}

impl HeaderlessEncode for GetDeviceTypeIdReturn {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: "GetDeviceTypeId_Return", in: dst, size: 4);
        dst.write_u32(self.device_type_id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "GetDeviceTypeId_Return"
    }

    fn size(&self) -> usize {
        4
    }
}

#[derive(Debug)]
pub struct ReadCacheCall {
    pub context: ScardContext,
    pub card_uuid: [u8; 16],
    pub freshness_counter: u32,
    pub lookup_name: String,
    pub data_size: u32,
}

impl HeaderlessDecode for ReadCacheCall {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let mut index = 0;
        let _lookup_ptr = ndr::decode_ptr(src, &mut index)?;
        let _ctx_ptr = ScardContext::decode_ptr(src, &mut index)?;
        ensure_size!(ctx: "ReadCache_Call", in: src, size: 1);
        let has_uuid = src.read_u8();
        let _uuid_ptr = if has_uuid != 0 { ndr::decode_ptr(src, &mut index)? } else { 0 };
        ensure_size!(ctx: "ReadCache_Call", in: src, size: 8);
        let freshness_counter = src.read_u32();
        let _data_is_null = src.read_u32();
        let data_size = {
            ensure_size!(ctx: "ReadCache_Call", in: src, size: 4);
            src.read_u32()
        };

        let lookup_name = ndr::read_unicode_string_value(src)?;
        let context = ScardContext::decode_value(src)?;
        let mut card_uuid = [0u8; 16];
        if has_uuid != 0 {
            ensure_size!(ctx: "ReadCache_Call", in: src, size: 16);
            card_uuid.copy_from_slice(&src.read_slice(16));
        }
        Ok(Self {
            context,
            card_uuid,
            freshness_counter,
            lookup_name,
            data_size,
        })
    }
}

#[derive(Debug)]
pub struct ReadCacheReturn {
    pub data: Vec<u8>,
}

impl HeaderlessEncode for ReadCacheReturn {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        let mut index = 0;
        ndr::encode_ptr(Some(cast_length!("ReadCache_Return", "cbDataLen", self.data.len())?), &mut index, dst)?;
        ensure_size!(ctx: "ReadCache_Return", in: dst, size: 4);
        dst.write_u32(cast_length!("ReadCache_Return", "cbDataLen", self.data.len())?);
        dst.write_slice(&self.data);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ReadCache_Return"
    }

    fn size(&self) -> usize {
        ndr::ptr_size(true) + 4 + self.data.len()
    }
}

#[derive(Debug)]
pub struct WriteCacheCall {
    pub context: ScardContext,
    pub card_uuid: [u8; 16],
    pub freshness_counter: u32,
    pub lookup_name: String,
    pub data: Vec<u8>,
}

impl HeaderlessDecode for WriteCacheCall {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let mut index = 0;
        let _lookup_ptr = ndr::decode_ptr(src, &mut index)?;
        let _ctx_ptr = ScardContext::decode_ptr(src, &mut index)?;
        ensure_size!(ctx: "WriteCache_Call", in: src, size: 1);
        let has_uuid = src.read_u8();
        let _uuid_ptr = if has_uuid != 0 { ndr::decode_ptr(src, &mut index)? } else { 0 };
        ensure_size!(ctx: "WriteCache_Call", in: src, size: 8);
        let freshness_counter = src.read_u32();
        let data_len = src.read_u32();
        let _data_ptr = ndr::decode_ptr(src, &mut index)?;

        let lookup_name = ndr::read_unicode_string_value(src)?;
        let context = ScardContext::decode_value(src)?;
        let mut card_uuid = [0u8; 16];
        if has_uuid != 0 {
            ensure_size!(ctx: "WriteCache_Call", in: src, size: 16);
            card_uuid.copy_from_slice(&src.read_slice(16));
        }
        ensure_size!(ctx: "WriteCache_Call", in: src, size: 4);
        let declared_len = src.read_u32();
        if declared_len != data_len {
            return Err(invalid_field_err!("WriteCache_Call", "cbDataLen", "conformance mismatch"));
        }
        let data = src.read_slice(data_len as usize).to_vec();
        Ok(Self {
            context,
            card_uuid,
            freshness_counter,
            lookup_name,
            data,
        })
    }
}

/// WriteCache has no return body beyond the common `Long_Return` result code.
#[derive(Debug)]
pub struct WriteCacheReturn;

impl HeaderlessEncode for WriteCacheReturn {
    fn encode(&self, _dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "WriteCache_Return"
    }

    fn size(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scard_ioctl_code_rejects_non_smartcard_device() {
        assert!(ScardIoCtlCode::from_raw(0x0001_0014).is_err());
    }

    #[test]
    fn scard_ioctl_code_roundtrips_establish_context() {
        let raw = (0x31u32 << 16) | 0x0014;
        assert_eq!(ScardIoCtlCode::from_raw(raw).unwrap(), ScardIoCtlCode::EstablishContext);
    }

    #[test]
    fn establish_context_return_round_trips() {
        let value = EstablishContextReturn {
            context: ScardContext::new(42),
        };
        let mut buf = vec![0u8; value.size()];
        let mut cursor = WriteCursor::new(&mut buf);
        value.encode(&mut cursor).unwrap();
        assert_eq!(cursor.pos(), value.size());
    }

    #[test]
    fn control_return_round_trips_through_rpce() {
        use super::super::rpce::RpcePdu;
        let value = RpcePdu(ControlReturn { output: vec![1, 2, 3, 4] });
        let mut buf = vec![0u8; value.size()];
        let mut cursor = WriteCursor::new(&mut buf);
        value.encode(&mut cursor).unwrap();
        assert_eq!(value.size() % 8, 0);
    }
}
