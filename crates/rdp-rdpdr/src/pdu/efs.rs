//! [MS-RDPEFS] core handshake and device I/O PDUs: version/id exchange, client name
//! request, device list announce/remove, IRP header, and per-major-function request and
//! completion bodies used by the drive device (§4.10) and the printer device (§4.11).

use std::fmt;

use rdpcore_core::{ensure_fixed_part_size, ensure_size, invalid_field_err};
use rdpcore_core::{Decode, DecodeResult, Encode, EncodeResult, ReadCursor, WriteCursor};

use super::{Component, PacketId, SharedHeader};

/// §4.14: `ServerAnnounce` and the client's `ClientAnnounceReply`/`ClientIdConfirm`
/// answers all share this fixed-size layout; only the header and the meaning of
/// `client_id` differ by direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionAndIdPduKind {
    ServerAnnounceRequest,
    ClientAnnounceReply,
    ServerClientIdConfirm,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VersionAndIdPdu {
    pub version_major: u16,
    pub version_minor: u16,
    pub client_id: u32,
    pub kind: VersionAndIdPduKind,
}

impl VersionAndIdPdu {
    pub const FIXED_PART_SIZE: usize = 8;
    const NAME: &'static str = "VERSION_AND_ID_PDU";

    /// Version this implementation advertises in `ClientAnnounceReply`.
    pub const CLIENT_VERSION_MAJOR: u16 = 1;
    pub const CLIENT_VERSION_MINOR: u16 = 0x0c;

    pub fn new_client_announce_reply(client_id: u32) -> Self {
        Self {
            version_major: Self::CLIENT_VERSION_MAJOR,
            version_minor: Self::CLIENT_VERSION_MINOR,
            client_id,
            kind: VersionAndIdPduKind::ClientAnnounceReply,
        }
    }

    pub fn new_client_id_confirm(client_id: u32) -> Self {
        Self {
            version_major: Self::CLIENT_VERSION_MAJOR,
            version_minor: Self::CLIENT_VERSION_MINOR,
            client_id,
            kind: VersionAndIdPduKind::ServerClientIdConfirm,
        }
    }

    pub fn decode_as(src: &mut ReadCursor<'_>, kind: VersionAndIdPduKind) -> DecodeResult<Self> {
        ensure_size!(ctx: Self::NAME, in: src, size: Self::FIXED_PART_SIZE);
        Ok(Self {
            version_major: src.read_u16(),
            version_minor: src.read_u16(),
            client_id: src.read_u32(),
            kind,
        })
    }
}

impl Encode for VersionAndIdPdu {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_fixed_part_size!(in: dst);
        dst.write_u16(self.version_major);
        dst.write_u16(self.version_minor);
        dst.write_u32(self.client_id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
    }
}

impl fmt::Debug for VersionAndIdPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionAndIdPdu")
            .field("kind", &self.kind)
            .field("version", &(self.version_major, self.version_minor))
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Header PDUs sharing [`VersionAndIdPdu`]'s body are framed differently depending on
/// direction; this returns the pair the top-level dispatcher should use.
pub fn version_and_id_header(kind: VersionAndIdPduKind) -> SharedHeader {
    let packet_id = match kind {
        VersionAndIdPduKind::ServerAnnounceRequest => PacketId::ServerAnnounce,
        VersionAndIdPduKind::ClientAnnounceReply => PacketId::ClientAnnounceReply,
        VersionAndIdPduKind::ServerClientIdConfirm => PacketId::ClientIdConfirm,
    };
    SharedHeader::new(Component::Core, packet_id)
}

/// §4.14 `ClientNameRequest` unicode flag; this implementation always sends `Unicode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClientNameRequestUnicodeFlag {
    Ascii = 0x0,
    Unicode = 0x1,
}

/// 2.2.2.4 `DR_CORE_CLIENT_NAME_REQ`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientNameRequest {
    pub unicode_flag: ClientNameRequestUnicodeFlag,
    pub computer_name: String,
}

impl ClientNameRequest {
    const NAME: &'static str = "DR_CORE_CLIENT_NAME_REQ";

    pub fn new(computer_name: String) -> Self {
        Self {
            unicode_flag: ClientNameRequestUnicodeFlag::Unicode,
            computer_name,
        }
    }

    fn name_units(&self) -> Vec<u16> {
        self.computer_name.encode_utf16().chain(std::iter::once(0)).collect()
    }
}

impl Encode for ClientNameRequest {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        let units = self.name_units();
        let byte_len = units.len() * 2;
        ensure_size!(ctx: Self::NAME, in: dst, size: 12 + byte_len);
        dst.write_u32(self.unicode_flag as u32);
        dst.write_u32(0); // CodePage: MUST be 0
        dst.write_u32(byte_len as u32);
        for unit in units {
            dst.write_u16(unit);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        12 + self.name_units().len() * 2
    }
}

/// §4.14 device type tag, shared with the device manager (C8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceType {
    Filesystem = 0x0000_0008,
    Print = 0x0000_0004,
    Smartcard = 0x0000_0020,
    Serial = 0x0000_0001,
    Parallel = 0x0000_0002,
}

impl TryFrom<u32> for DeviceType {
    type Error = rdpcore_core::DecodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0000_0008 => Self::Filesystem,
            0x0000_0004 => Self::Print,
            0x0000_0020 => Self::Smartcard,
            0x0000_0001 => Self::Serial,
            0x0000_0002 => Self::Parallel,
            _ => return Err(invalid_field_err!("DeviceAnnounce", "DeviceType", "unknown device type")),
        })
    }
}

/// One device entry of `ClientDeviceListAnnounce` (§4.14: `type, id, name[8], data_len, data`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAnnounceHeader {
    pub device_type: DeviceType,
    pub device_id: u32,
    /// Right-truncated/padded to 8 ASCII bytes; non-ASCII bytes are replaced with `_`.
    pub preferred_dos_name: [u8; 8],
    pub device_data: Vec<u8>,
}

impl DeviceAnnounceHeader {
    const NAME: &'static str = "DEVICE_ANNOUNCE";

    pub fn new(device_type: DeviceType, device_id: u32, name: &str, device_data: Vec<u8>) -> Self {
        let mut preferred_dos_name = [0u8; 8];
        for (slot, byte) in preferred_dos_name.iter_mut().zip(name.bytes().chain(std::iter::repeat(0))) {
            *slot = if byte.is_ascii() && byte != 0 { byte } else if byte == 0 { 0 } else { b'_' };
        }
        Self {
            device_type,
            device_id,
            preferred_dos_name,
            device_data,
        }
    }

    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: Self::NAME, in: src, size: 20);
        let device_type = DeviceType::try_from(src.read_u32())?;
        let device_id = src.read_u32();
        let preferred_dos_name = src.read_array::<8>();
        let data_len = src.read_u32() as usize;
        ensure_size!(ctx: Self::NAME, in: src, size: data_len);
        let device_data = src.read_slice(data_len).to_vec();
        Ok(Self {
            device_type,
            device_id,
            preferred_dos_name,
            device_data,
        })
    }

    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: Self::NAME, in: dst, size: self.size());
        dst.write_u32(self.device_type as u32);
        dst.write_u32(self.device_id);
        dst.write_array(self.preferred_dos_name);
        dst.write_u32(self.device_data.len() as u32);
        dst.write_slice(&self.device_data);
        Ok(())
    }

    fn size(&self) -> usize {
        20 + self.device_data.len()
    }
}

/// §4.14 `ClientDeviceListAnnounce`: initial and incremental device announcements share
/// the same wire shape (`count(4)` then `count` [`DeviceAnnounceHeader`]s).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientDeviceListAnnounce {
    pub devices: Vec<DeviceAnnounceHeader>,
}

impl ClientDeviceListAnnounce {
    const NAME: &'static str = "DR_CORE_DEVICELIST_ANNOUNCE_REQ";

    pub fn new(devices: Vec<DeviceAnnounceHeader>) -> Self {
        Self { devices }
    }
}

impl Decode<'_> for ClientDeviceListAnnounce {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: Self::NAME, in: src, size: 4);
        let count = src.read_u32();
        let mut devices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            devices.push(DeviceAnnounceHeader::decode(src)?);
        }
        Ok(Self { devices })
    }
}

impl Encode for ClientDeviceListAnnounce {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: Self::NAME, in: dst, size: 4);
        dst.write_u32(self.devices.len() as u32);
        for device in &self.devices {
            device.encode(dst)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        4 + self.devices.iter().map(DeviceAnnounceHeader::size).sum::<usize>()
    }
}

/// §4.14 `ServerDeviceAnnounceResponse`: `device_id(4), result_code(4)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerDeviceAnnounceResponse {
    pub device_id: u32,
    pub result_code: u32,
}

impl ServerDeviceAnnounceResponse {
    pub const FIXED_PART_SIZE: usize = 8;
    const NAME: &'static str = "DR_CORE_DEVICE_REPLY";
}

impl Decode<'_> for ServerDeviceAnnounceResponse {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);
        Ok(Self {
            device_id: src.read_u32(),
            result_code: src.read_u32(),
        })
    }
}

/// §4.14 `DeviceListRemove`: `count(4)` device ids.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceListRemove {
    pub device_ids: Vec<u32>,
}

impl DeviceListRemove {
    const NAME: &'static str = "DR_CORE_DEVICELIST_REMOVE";

    pub fn new(device_ids: Vec<u32>) -> Self {
        Self { device_ids }
    }
}

impl Encode for DeviceListRemove {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: Self::NAME, in: dst, size: self.size());
        dst.write_u32(self.device_ids.len() as u32);
        for id in &self.device_ids {
            dst.write_u32(*id);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        4 + self.device_ids.len() * 4
    }
}

/// Marker payload for `ServerUserLoggedOn`; the PDU carries no body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserLoggedOn;

/// §4.2 IRP header, prefixing every `DeviceIoRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIoRequestHeader {
    pub device_id: u32,
    pub file_id: u32,
    pub completion_id: u32,
    pub major_function: MajorFunction,
    pub minor_function: u32,
}

impl DeviceIoRequestHeader {
    pub const FIXED_PART_SIZE: usize = 20;
    const NAME: &'static str = "DEVICE_IO_REQUEST";
}

impl Decode<'_> for DeviceIoRequestHeader {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_fixed_part_size!(in: src);
        let device_id = src.read_u32();
        let file_id = src.read_u32();
        let completion_id = src.read_u32();
        let major_function = MajorFunction::try_from(src.read_u32())?;
        let minor_function = src.read_u32();
        Ok(Self {
            device_id,
            file_id,
            completion_id,
            major_function,
            minor_function,
        })
    }
}

/// IRP major functions, bit-compatible with the GENERAL capability's `io_code_1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MajorFunction {
    Create = 0x0000_0000,
    Close = 0x0000_0002,
    Read = 0x0000_0003,
    Write = 0x0000_0004,
    DeviceControl = 0x0000_000e,
    QueryVolumeInformation = 0x0000_000a,
    SetVolumeInformation = 0x0000_000b,
    QueryInformation = 0x0000_0005,
    SetInformation = 0x0000_0006,
    DirectoryControl = 0x0000_000c,
    LockControl = 0x0000_0011,
    Cleanup = 0x0000_0012,
}

impl TryFrom<u32> for MajorFunction {
    type Error = rdpcore_core::DecodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0000_0000 => Self::Create,
            0x0000_0002 => Self::Close,
            0x0000_0003 => Self::Read,
            0x0000_0004 => Self::Write,
            0x0000_000e => Self::DeviceControl,
            0x0000_000a => Self::QueryVolumeInformation,
            0x0000_000b => Self::SetVolumeInformation,
            0x0000_0005 => Self::QueryInformation,
            0x0000_0006 => Self::SetInformation,
            0x0000_000c => Self::DirectoryControl,
            0x0000_0011 => Self::LockControl,
            0x0000_0012 => Self::Cleanup,
            _ => return Err(invalid_field_err!("DEVICE_IO_REQUEST", "MajorFunction", "unknown major function")),
        })
    }
}

/// A decoded `DeviceIoRequest`: header plus the still-undecoded, major-function-specific
/// payload. The device manager (C8) hands the payload slice to the owning device, which
/// knows how to interpret it for its `major_function`.
pub struct DeviceIoRequest {
    pub header: DeviceIoRequestHeader,
    pub payload: Vec<u8>,
}

impl DeviceIoRequest {
    const NAME: &'static str = "DeviceIoRequest";
}

impl Decode<'_> for DeviceIoRequest {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        let header = DeviceIoRequestHeader::decode(src)?;
        let payload = src.read_remaining().to_vec();
        Ok(Self { header, payload })
    }
}

impl fmt::Debug for DeviceIoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(Self::NAME)
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// §4.2 IO-completion header: `device_id(4), completion_id(4), io_status(4)` prefixing
/// every device reply, reserved up-front in the IRP's output stream and patched with the
/// final `io_status` at complete time (§3 Irp invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCompletionHeader {
    pub device_id: u32,
    pub completion_id: u32,
    pub io_status: u32,
}

impl IoCompletionHeader {
    pub const FIXED_PART_SIZE: usize = 12;
    const NAME: &'static str = "DEVICE_IO_COMPLETION";

    pub fn new(device_id: u32, completion_id: u32, io_status: u32) -> Self {
        Self {
            device_id,
            completion_id,
            io_status,
        }
    }
}

impl Encode for IoCompletionHeader {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_fixed_part_size!(in: dst);
        dst.write_u32(self.device_id);
        dst.write_u32(self.completion_id);
        dst.write_u32(self.io_status);
        Ok(())
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE
    }
}

/// Completion for `CREATE`: `file_id(4), information(1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCreateResponse {
    pub completion: IoCompletionHeader,
    pub file_id: u32,
    pub information: u8,
}

impl Encode for DeviceCreateResponse {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        self.completion.encode(dst)?;
        ensure_size!(ctx: "DeviceCreateResponse", in: dst, size: 5);
        dst.write_u32(self.file_id);
        dst.write_u8(self.information);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "DeviceCreateResponse"
    }

    fn size(&self) -> usize {
        IoCompletionHeader::FIXED_PART_SIZE + 5
    }
}

/// Completion for `CLOSE`: 5 bytes of padding (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCloseResponse {
    pub completion: IoCompletionHeader,
}

impl Encode for DeviceCloseResponse {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        self.completion.encode(dst)?;
        ensure_size!(ctx: "DeviceCloseResponse", in: dst, size: 5);
        dst.write_array([0u8; 5]);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "DeviceCloseResponse"
    }

    fn size(&self) -> usize {
        IoCompletionHeader::FIXED_PART_SIZE + 5
    }
}

/// Completion for `READ`: `actual_length(4), bytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReadResponse {
    pub completion: IoCompletionHeader,
    pub data: Vec<u8>,
}

impl Encode for DeviceReadResponse {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        self.completion.encode(dst)?;
        ensure_size!(ctx: "DeviceReadResponse", in: dst, size: 4 + self.data.len());
        dst.write_u32(self.data.len() as u32);
        dst.write_slice(&self.data);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "DeviceReadResponse"
    }

    fn size(&self) -> usize {
        IoCompletionHeader::FIXED_PART_SIZE + 4 + self.data.len()
    }
}

/// Completion for `WRITE`: `actual_length(4), pad(1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceWriteResponse {
    pub completion: IoCompletionHeader,
    pub length: u32,
}

impl Encode for DeviceWriteResponse {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        self.completion.encode(dst)?;
        ensure_size!(ctx: "DeviceWriteResponse", in: dst, size: 5);
        dst.write_u32(self.length);
        dst.write_u8(0);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "DeviceWriteResponse"
    }

    fn size(&self) -> usize {
        IoCompletionHeader::FIXED_PART_SIZE + 5
    }
}

/// Completion for `DEVICE_CONTROL`: `OutputBufferLength(4), output`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceControlResponse {
    pub completion: IoCompletionHeader,
    pub output: Vec<u8>,
}

impl Encode for DeviceControlResponse {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        self.completion.encode(dst)?;
        ensure_size!(ctx: "DeviceControlResponse", in: dst, size: 4 + self.output.len());
        dst.write_u32(self.output.len() as u32);
        dst.write_slice(&self.output);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "DeviceControlResponse"
    }

    fn size(&self) -> usize {
        IoCompletionHeader::FIXED_PART_SIZE + 4 + self.output.len()
    }
}

/// A directory entry returned one-at-a-time by `DIRECTORY_CONTROL`/`QUERY_DIRECTORY`
/// (§4.10); `None` signals the directory is exhausted (`STATUS_NO_MORE_FILES`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDriveQueryDirectoryResponse {
    pub completion: IoCompletionHeader,
    pub entry: Option<Vec<u8>>,
}

impl Encode for ClientDriveQueryDirectoryResponse {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        self.completion.encode(dst)?;
        let len = self.entry.as_ref().map_or(0, Vec::len);
        ensure_size!(ctx: "ClientDriveQueryDirectoryResponse", in: dst, size: 4 + len);
        dst.write_u32(len as u32);
        if let Some(entry) = &self.entry {
            dst.write_slice(entry);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ClientDriveQueryDirectoryResponse"
    }

    fn size(&self) -> usize {
        IoCompletionHeader::FIXED_PART_SIZE + 4 + self.entry.as_ref().map_or(0, Vec::len)
    }
}

/// Generic IO completion for major functions that don't need a dedicated type
/// (`QUERY_INFORMATION`, `SET_INFORMATION`, `QUERY_VOLUME_INFORMATION`,
/// `SET_VOLUME_INFORMATION`, `LOCK_CONTROL`): a completion header plus a raw,
/// already-marshalled body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIoResponse {
    pub completion: IoCompletionHeader,
    pub body: Vec<u8>,
}

impl DeviceIoResponse {
    pub fn new(completion: IoCompletionHeader, body: Vec<u8>) -> Self {
        Self { completion, body }
    }
}

impl Encode for DeviceIoResponse {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        self.completion.encode(dst)?;
        ensure_size!(ctx: "DeviceIoResponse", in: dst, size: self.body.len());
        dst.write_slice(&self.body);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "DeviceIoResponse"
    }

    fn size(&self) -> usize {
        IoCompletionHeader::FIXED_PART_SIZE + self.body.len()
    }
}

/// NTSTATUS values this implementation produces; not exhaustive (§4.9 error semantics).
pub mod status {
    pub const STATUS_SUCCESS: u32 = 0x0000_0000;
    pub const STATUS_UNSUCCESSFUL: u32 = 0xC000_0001;
    pub const STATUS_NO_SUCH_FILE: u32 = 0xC000_000F;
    pub const STATUS_ACCESS_DENIED: u32 = 0xC000_0022;
    pub const STATUS_OBJECT_NAME_COLLISION: u32 = 0xC000_0035;
    pub const STATUS_DEVICE_BUSY: u32 = 0x8000_0011;
    pub const STATUS_FILE_IS_A_DIRECTORY: u32 = 0xC000_0033;
    pub const STATUS_NO_MORE_FILES: u32 = 0x8000_0006;
    pub const STATUS_CANCELLED: u32 = 0xC000_0120;
    pub const STATUS_TIMEOUT: u32 = 0x0000_0102;
    pub const STATUS_DEVICE_OFF_LINE: u32 = 0xC000_0037;
    pub const STATUS_DEVICE_PAPER_EMPTY: u32 = 0xC000_009A;
    pub const STATUS_DEVICE_POWERED_OFF: u32 = 0xC000_0125;

    /// Maps a host `io::Error` to the closest NTSTATUS (§4.9).
    pub fn from_io_error(err: &std::io::Error) -> u32 {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::PermissionDenied => STATUS_ACCESS_DENIED,
            ErrorKind::NotFound => STATUS_NO_SUCH_FILE,
            ErrorKind::AlreadyExists => STATUS_OBJECT_NAME_COLLISION,
            ErrorKind::WouldBlock => STATUS_DEVICE_BUSY,
            _ => STATUS_UNSUCCESSFUL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdpcore_core::encode_vec;

    #[test]
    fn device_announce_name_replaces_non_ascii() {
        let header = DeviceAnnounceHeader::new(DeviceType::Filesystem, 1, "café", Vec::new());
        assert_eq!(&header.preferred_dos_name[..4], b"caf_");
    }

    #[test]
    fn client_device_list_announce_round_trips() {
        let announce = ClientDeviceListAnnounce::new(vec![DeviceAnnounceHeader::new(
            DeviceType::Filesystem,
            1,
            "media",
            Vec::new(),
        )]);
        let bytes = encode_vec(&announce).unwrap();
        let mut cursor = ReadCursor::new(&bytes);
        let decoded = ClientDeviceListAnnounce::decode(&mut cursor).unwrap();
        assert_eq!(decoded.devices.len(), 1);
        assert_eq!(decoded.devices[0].device_id, 1);
    }

    #[test]
    fn io_completion_header_round_trips() {
        let header = IoCompletionHeader::new(3, 42, status::STATUS_SUCCESS);
        let bytes = encode_vec(&header).unwrap();
        assert_eq!(bytes.len(), IoCompletionHeader::FIXED_PART_SIZE);
    }
}
