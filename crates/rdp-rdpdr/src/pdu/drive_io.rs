//! Request/response bodies carried after [`super::efs::DeviceIoRequestHeader`] for the major
//! functions the drive, printer, serial and parallel devices actually handle (§4.10-§4.12).
//!
//! [`super::efs::DeviceIoRequest::payload`] holds these bytes undecoded; each device decodes
//! only the bodies relevant to it.

use bitflags::bitflags;
use rdpcore_core::{cast_length, ensure_size, invalid_field_err};
use rdpcore_core::{Decode, DecodeResult, Encode, EncodeResult, ReadCursor, WriteCursor};

bitflags! {
    /// A subset of `DesiredAccess` bits from [MS-FSCC] relevant to deciding read/write mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DesiredAccess: u32 {
        const GENERIC_READ = 0x8000_0000;
        const GENERIC_WRITE = 0x4000_0000;
        const GENERIC_ALL = 0x1000_0000;
        const FILE_WRITE_DATA = 0x0000_0002;
        const FILE_APPEND_DATA = 0x0000_0004;
        const FILE_DELETE_CHILD = 0x0000_0040;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CreateOptions: u32 {
        const FILE_DIRECTORY_FILE = 0x0000_0001;
        const FILE_WRITE_THROUGH = 0x0000_0002;
        const FILE_SEQUENTIAL_ONLY = 0x0000_0004;
        const FILE_NON_DIRECTORY_FILE = 0x0000_0040;
        const FILE_NO_EA_KNOWLEDGE = 0x0000_0200;
        const FILE_RANDOM_ACCESS = 0x0000_0800;
        const FILE_DELETE_ON_CLOSE = 0x0000_1000;
        const FILE_OPEN_BY_FILE_ID = 0x0000_2000;
        const FILE_OPEN_FOR_BACKUP_INTENT = 0x0000_4000;
        const FILE_SYNCHRONOUS_IO_ALERT = 0x0001_0000;
        const FILE_SYNCHRONOUS_IO_NONALERT = 0x0002_0000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttributes: u32 {
        const READONLY = 0x0000_0001;
        const HIDDEN = 0x0000_0002;
        const DIRECTORY = 0x0000_0010;
        const ARCHIVE = 0x0000_0020;
        const NORMAL = 0x0000_0080;
    }
}

/// `CreateDisposition` values from [MS-FSCC] §2.2.13 (not a bitmask).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CreateDisposition {
    Supersede = 0,
    Open = 1,
    Create = 2,
    OpenIf = 3,
    Overwrite = 4,
    OverwriteIf = 5,
}

impl TryFrom<u32> for CreateDisposition {
    type Error = rdpcore_core::DecodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Supersede,
            1 => Self::Open,
            2 => Self::Create,
            3 => Self::OpenIf,
            4 => Self::Overwrite,
            5 => Self::OverwriteIf,
            _ => return Err(invalid_field_err!("DeviceCreateRequest", "create_disposition", "unsupported value")),
        })
    }
}

/// Information code returned in [`super::efs::DeviceCreateResponse::information`] per disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CreateInformation {
    Superseded = 0,
    Opened = 1,
    Created = 2,
    Overwritten = 3,
}

impl CreateDisposition {
    pub fn information(self) -> CreateInformation {
        match self {
            Self::Supersede | Self::Open | Self::Create | Self::Overwrite => CreateInformation::Superseded,
            Self::OpenIf => CreateInformation::Opened,
            Self::OverwriteIf => CreateInformation::Overwritten,
        }
    }
}

/// Body of a `DeviceIoRequest` whose major function is `CREATE` (§4.10).
#[derive(Debug)]
pub struct DeviceCreateRequest {
    pub desired_access: DesiredAccess,
    pub allocation_size: u64,
    pub file_attributes: FileAttributes,
    pub shared_access: u32,
    pub create_disposition: CreateDisposition,
    pub create_options: CreateOptions,
    pub path: String,
}

impl Decode<'_> for DeviceCreateRequest {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: "DeviceCreateRequest", in: src, size: 32);
        let desired_access = DesiredAccess::from_bits_truncate(src.read_u32());
        let allocation_size = src.read_u64();
        let file_attributes = FileAttributes::from_bits_truncate(src.read_u32());
        let shared_access = src.read_u32();
        let create_disposition = CreateDisposition::try_from(src.read_u32())?;
        let create_options = CreateOptions::from_bits_truncate(src.read_u32());
        let path_length = src.read_u32() as usize;
        ensure_size!(ctx: "DeviceCreateRequest", in: src, size: path_length);
        let units = path_length / 2;
        let utf16: Vec<u16> = (0..units).map(|_| src.read_u16()).collect();
        let path = String::from_utf16_lossy(&utf16).trim_end_matches('\0').to_owned();
        Ok(Self {
            desired_access,
            allocation_size,
            file_attributes,
            shared_access,
            create_disposition,
            create_options,
            path,
        })
    }
}

/// Normalizes an MS-RDPEFS wire path (backslashes, leading slash) into a relative path
/// that is safe to join under a drive's base directory.
///
/// Drops `..`/`.` components instead of just the backslash/slash translation FreeRDP's
/// `disk_file_get_fullpath()` does, so the joined path can never escape `base_path`
/// (spec.md §8 Testable Property #6).
pub fn normalize_wire_path(path: &str) -> String {
    use std::path::{Component, Path};

    let forward = path.replace('\\', "/");
    let trimmed = forward.trim_start_matches('/').trim_end_matches('/');
    Path::new(trimmed)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Body of a `READ` request (§4.10): `length(4), offset(8), padding(20)`.
#[derive(Debug)]
pub struct DeviceReadRequest {
    pub length: u32,
    pub offset: u64,
}

impl Decode<'_> for DeviceReadRequest {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: "DeviceReadRequest", in: src, size: 32);
        let length = src.read_u32();
        let offset = src.read_u64();
        let _padding = src.read_array::<20>();
        Ok(Self { length, offset })
    }
}

/// Body of a `WRITE` request (§4.10): `length(4), offset(8), padding(20), data`.
#[derive(Debug)]
pub struct DeviceWriteRequest {
    pub offset: u64,
    pub data: Vec<u8>,
}

impl Decode<'_> for DeviceWriteRequest {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: "DeviceWriteRequest", in: src, size: 32);
        let length = src.read_u32() as usize;
        let offset = src.read_u64();
        let _padding = src.read_array::<20>();
        ensure_size!(ctx: "DeviceWriteRequest", in: src, size: length);
        let data = src.read_slice(length).to_vec();
        Ok(Self { offset, data })
    }
}

/// `FSINFOCLASS` values relevant to QUERY/SET_INFORMATION (§4.10), [MS-FSCC] §2.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FsInformationClass {
    BasicInfo = 4,
    StandardInfo = 5,
    RenameInfo = 10,
    DispositionInfo = 13,
    EndOfFileInfo = 20,
    AttributeTagInfo = 35,
}

impl TryFrom<u32> for FsInformationClass {
    type Error = rdpcore_core::DecodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            4 => Self::BasicInfo,
            5 => Self::StandardInfo,
            10 => Self::RenameInfo,
            13 => Self::DispositionInfo,
            20 => Self::EndOfFileInfo,
            35 => Self::AttributeTagInfo,
            _ => return Err(invalid_field_err!("FsInformationClass", "value", "unsupported class")),
        })
    }
}

/// Body of a `QUERY_INFORMATION`/`SET_INFORMATION` request: `fs_information_class(4), length(4), padding(24), buffer`.
#[derive(Debug)]
pub struct QueryOrSetInformationRequest {
    pub fs_information_class: FsInformationClass,
    pub buffer: Vec<u8>,
}

impl Decode<'_> for QueryOrSetInformationRequest {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: "QueryOrSetInformationRequest", in: src, size: 32);
        let fs_information_class = FsInformationClass::try_from(src.read_u32())?;
        let length = src.read_u32() as usize;
        let _padding = src.read_array::<24>();
        ensure_size!(ctx: "QueryOrSetInformationRequest", in: src, size: length);
        let buffer = src.read_slice(length).to_vec();
        Ok(Self {
            fs_information_class,
            buffer,
        })
    }
}

/// `SET_INFORMATION` body for `FileRenameInformation`: `replace_if_exists(1), root_dir(8), path_length(4), path(utf16)`.
#[derive(Debug)]
pub struct RenameInformation {
    pub replace_if_exists: bool,
    pub new_path: String,
}

impl Decode<'_> for RenameInformation {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: "RenameInformation", in: src, size: 13);
        let replace_if_exists = src.read_u8() != 0;
        let _root_dir = src.read_u64();
        let path_length = src.read_u32() as usize;
        ensure_size!(ctx: "RenameInformation", in: src, size: path_length);
        let units = path_length / 2;
        let utf16: Vec<u16> = (0..units).map(|_| src.read_u16()).collect();
        let new_path = String::from_utf16_lossy(&utf16).trim_end_matches('\0').to_owned();
        Ok(Self {
            replace_if_exists,
            new_path,
        })
    }
}

/// `SET_INFORMATION` body for `FileBasicInformation`: four FILETIMEs then attributes(4).
#[derive(Debug)]
pub struct BasicInformation {
    pub creation_time: i64,
    pub last_access_time: i64,
    pub last_write_time: i64,
    pub change_time: i64,
    pub file_attributes: FileAttributes,
}

impl Decode<'_> for BasicInformation {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: "BasicInformation", in: src, size: 36);
        let creation_time = src.read_i64();
        let last_access_time = src.read_i64();
        let last_write_time = src.read_i64();
        let change_time = src.read_i64();
        let file_attributes = FileAttributes::from_bits_truncate(src.read_u32());
        Ok(Self {
            creation_time,
            last_access_time,
            last_write_time,
            change_time,
            file_attributes,
        })
    }
}

impl Encode for BasicInformation {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: "BasicInformation", in: dst, size: self.size());
        dst.write_i64(self.creation_time);
        dst.write_i64(self.last_access_time);
        dst.write_i64(self.last_write_time);
        dst.write_i64(self.change_time);
        dst.write_u32(self.file_attributes.bits());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "FileBasicInformation"
    }

    fn size(&self) -> usize {
        36
    }
}

/// `StandardInfo` body written on QUERY_INFORMATION.
#[derive(Debug)]
pub struct StandardInformation {
    pub allocation_size: u64,
    pub end_of_file: u64,
    pub number_of_links: u32,
    pub delete_pending: bool,
    pub directory: bool,
}

impl Encode for StandardInformation {
    fn encode(&self, dst: &mut WriteCursor<'_>) -> EncodeResult<()> {
        ensure_size!(ctx: "StandardInformation", in: dst, size: self.size());
        dst.write_u64(self.allocation_size);
        dst.write_u64(self.end_of_file);
        dst.write_u32(self.number_of_links);
        dst.write_u8(self.delete_pending as u8);
        dst.write_u8(self.directory as u8);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "FileStandardInformation"
    }

    fn size(&self) -> usize {
        22
    }
}

/// Body of a `DIRECTORY_CONTROL`/`QUERY_DIRECTORY` request (§4.10).
#[derive(Debug)]
pub struct QueryDirectoryRequest {
    pub fs_information_class: FsInformationClass,
    pub initial_query: bool,
    pub path: String,
}

impl Decode<'_> for QueryDirectoryRequest {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: "QueryDirectoryRequest", in: src, size: 9);
        let fs_information_class = FsInformationClass::try_from(src.read_u32())?;
        let initial_query = src.read_u8() != 0;
        let path_length = src.read_u32() as usize;
        ensure_size!(ctx: "QueryDirectoryRequest", in: src, size: 23 + path_length);
        let _padding = src.read_array::<23>();
        let units = path_length / 2;
        let utf16: Vec<u16> = (0..units).map(|_| src.read_u16()).collect();
        let path = String::from_utf16_lossy(&utf16).trim_end_matches('\0').to_owned();
        Ok(Self {
            fs_information_class,
            initial_query,
            path,
        })
    }
}

/// Matches a glob pattern using only `*` (any run) and `?` (single char) wildcards, the subset
/// [MS-FSCC] directory search actually uses.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[char], n: &[char]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some('*'), _) => inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..])),
            (Some('?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc.to_ascii_lowercase() == nc.to_ascii_lowercase() => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    inner(&p, &n)
}

/// Body of a `DEVICE_CONTROL` request (§4.10/§4.13): `output_buffer_len(4), input_buffer_len(4),
/// io_control_code(4), padding(20), input_buffer`.
#[derive(Debug)]
pub struct DeviceControlRequest {
    pub output_buffer_length: u32,
    pub io_control_code: u32,
    pub input_buffer: Vec<u8>,
}

impl Decode<'_> for DeviceControlRequest {
    fn decode(src: &mut ReadCursor<'_>) -> DecodeResult<Self> {
        ensure_size!(ctx: "DeviceControlRequest", in: src, size: 32);
        let output_buffer_length = src.read_u32();
        let input_buffer_length = src.read_u32() as usize;
        let io_control_code = src.read_u32();
        let _padding = src.read_array::<20>();
        ensure_size!(ctx: "DeviceControlRequest", in: src, size: input_buffer_length);
        let input_buffer = src.read_slice(input_buffer_length).to_vec();
        Ok(Self {
            output_buffer_length,
            io_control_code,
            input_buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_trailing_star() {
        assert!(glob_match("*.txt", "readme.txt"));
        assert!(!glob_match("*.txt", "readme.md"));
        assert!(glob_match("file?.bin", "file1.bin"));
    }

    #[test]
    fn normalize_wire_path_strips_backslashes_and_slashes() {
        assert_eq!(normalize_wire_path("\\foo\\bar\\"), "foo/bar");
    }

    #[test]
    fn normalize_wire_path_strips_parent_dir_traversal() {
        assert_eq!(normalize_wire_path("\\..\\..\\etc\\passwd"), "etc/passwd");
        assert_eq!(normalize_wire_path("\\foo\\..\\..\\bar"), "bar");
        assert_eq!(normalize_wire_path("\\.\\foo\\.\\bar"), "foo/bar");
        assert_eq!(normalize_wire_path("\\..\\"), "");
    }

    #[test]
    fn create_disposition_maps_to_information() {
        assert_eq!(CreateDisposition::OpenIf.information(), CreateInformation::Opened);
        assert_eq!(CreateDisposition::Create.information(), CreateInformation::Superseded);
    }

    #[test]
    fn device_create_request_round_trip_len() {
        let mut buf = vec![0u8; 32 + 4];
        {
            let mut cursor = WriteCursor::new(&mut buf);
            cursor.write_u32(DesiredAccess::GENERIC_READ.bits());
            cursor.write_u64(0);
            cursor.write_u32(0);
            cursor.write_u32(0);
            cursor.write_u32(1); // Open
            cursor.write_u32(0);
            cursor.write_u32(2);
            cursor.write_u16(b'a' as u16);
            cursor.write_u16(0);
        }
        let mut cursor = ReadCursor::new(&buf);
        let req = DeviceCreateRequest::decode(&mut cursor).unwrap();
        assert_eq!(req.path, "a");
        assert_eq!(req.create_disposition, CreateDisposition::Open);
    }
}
