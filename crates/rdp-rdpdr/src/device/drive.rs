//! Drive device (C10, §4.10): a Windows-compatible filesystem emulation layered on the
//! host filesystem, grounded on the disk backend's open/read/write/query/rename flow.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::irp::{Irp, IrpHandler};
use crate::pdu::drive_io::{
    glob_match, normalize_wire_path, BasicInformation, CreateDisposition, CreateOptions, DeviceControlRequest,
    DeviceCreateRequest, DeviceReadRequest, DeviceWriteRequest, FileAttributes, FsInformationClass,
    QueryDirectoryRequest, QueryOrSetInformationRequest, RenameInformation, StandardInformation,
};
use crate::pdu::efs::{
    status, ClientDriveQueryDirectoryResponse, DeviceCloseResponse, DeviceControlResponse, DeviceCreateResponse,
    DeviceIoResponse, DeviceReadResponse, DeviceWriteResponse, IoCompletionHeader, MajorFunction,
};
use crate::pdu::RdpdrPdu;
use rdpcore_core::Decode;

/// Automount roots polled for hotplug detection; at most one path segment below the base
/// is considered a candidate drive (§4.10).
pub const AUTOMOUNT_ROOTS: &[&str] = &["/run/user", "/run/media", "/media", "/mnt"];

struct OpenEntry {
    full_path: PathBuf,
    is_dir: bool,
    file: Option<File>,
    delete_on_close: bool,
    /// Set on the first `QUERY_DIRECTORY` IRP for this handle; `None` until then.
    dir_state: Option<DirState>,
}

struct DirState {
    pattern: String,
    entries: Vec<std::fs::DirEntry>,
    next: usize,
}

pub struct DriveDevice {
    id: u32,
    base_path: PathBuf,
    next_file_id: AtomicU32,
    open: Mutex<HashMap<u32, OpenEntry>>,
}

impl DriveDevice {
    pub fn new(id: u32, base_path: PathBuf) -> Self {
        Self {
            id,
            base_path,
            next_file_id: AtomicU32::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, wire_path: &str) -> PathBuf {
        self.base_path.join(normalize_wire_path(wire_path))
    }

    fn completion(&self, irp: &Irp, io_status: u32) -> IoCompletionHeader {
        IoCompletionHeader::new(self.id, irp.completion_id, io_status)
    }

    fn handle_create(&self, irp: Irp) {
        let req = match rdpcore_core::decode::<DeviceCreateRequest>(&irp.payload) {
            Ok(req) => req,
            Err(_) => {
                let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
                irp.complete(RdpdrPdu::DeviceCreateResponse(DeviceCreateResponse {
                    completion,
                    file_id: 0,
                    information: 0,
                }));
                return;
            }
        };

        let full_path = self.resolve(&req.path);
        let wants_dir = req.create_options.contains(CreateOptions::FILE_DIRECTORY_FILE);

        let result = open_entry(&full_path, wants_dir, req.create_disposition, req.desired_access);
        match result {
            Ok((file, is_dir, created)) => {
                let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
                let delete_on_close =
                    req.create_options.contains(CreateOptions::FILE_DELETE_ON_CLOSE) && (created || !is_dir);
                self.open.lock().expect("poisoned").insert(
                    file_id,
                    OpenEntry {
                        full_path,
                        is_dir,
                        file,
                        delete_on_close,
                        dir_state: None,
                    },
                );
                let information = req.create_disposition.information() as u8;
                let completion = self.completion(&irp, status::STATUS_SUCCESS);
                irp.complete(RdpdrPdu::DeviceCreateResponse(DeviceCreateResponse {
                    completion,
                    file_id,
                    information,
                }));
            }
            Err(err) => {
                let completion = self.completion(&irp, status::from_io_error(&err));
                irp.complete(RdpdrPdu::DeviceCreateResponse(DeviceCreateResponse {
                    completion,
                    file_id: 0,
                    information: 0,
                }));
            }
        }
    }

    fn handle_close(&self, irp: Irp) {
        let entry = self.open.lock().expect("poisoned").remove(&irp.file_id);
        let status_code = if let Some(entry) = entry {
            let result = if entry.delete_on_close {
                if entry.is_dir {
                    fs::remove_dir_all(&entry.full_path)
                } else {
                    fs::remove_file(&entry.full_path)
                }
            } else {
                Ok(())
            };
            result.err().map_or(status::STATUS_SUCCESS, |e| status::from_io_error(&e))
        } else {
            status::STATUS_UNSUCCESSFUL
        };
        let completion = self.completion(&irp, status_code);
        irp.complete(RdpdrPdu::DeviceCloseResponse(DeviceCloseResponse { completion }));
    }

    fn handle_read(&self, irp: Irp) {
        let req = match rdpcore_core::decode::<DeviceReadRequest>(&irp.payload) {
            Ok(req) => req,
            Err(_) => {
                let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
                irp.complete(RdpdrPdu::DeviceReadResponse(DeviceReadResponse { completion, data: Vec::new() }));
                return;
            }
        };
        let mut guard = self.open.lock().expect("poisoned");
        let Some(entry) = guard.get_mut(&irp.file_id) else {
            drop(guard);
            let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
            irp.complete(RdpdrPdu::DeviceReadResponse(DeviceReadResponse { completion, data: Vec::new() }));
            return;
        };
        let Some(file) = entry.file.as_mut() else {
            drop(guard);
            let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
            irp.complete(RdpdrPdu::DeviceReadResponse(DeviceReadResponse { completion, data: Vec::new() }));
            return;
        };
        let mut buf = vec![0u8; req.length as usize];
        let outcome = file.seek(SeekFrom::Start(req.offset)).and_then(|_| file.read(&mut buf));
        drop(guard);
        match outcome {
            Ok(n) => {
                buf.truncate(n);
                let completion = self.completion(&irp, status::STATUS_SUCCESS);
                irp.complete(RdpdrPdu::DeviceReadResponse(DeviceReadResponse { completion, data: buf }));
            }
            Err(err) => {
                let completion = self.completion(&irp, status::from_io_error(&err));
                irp.complete(RdpdrPdu::DeviceReadResponse(DeviceReadResponse { completion, data: Vec::new() }));
            }
        }
    }

    fn handle_write(&self, irp: Irp) {
        let req = match rdpcore_core::decode::<DeviceWriteRequest>(&irp.payload) {
            Ok(req) => req,
            Err(_) => {
                let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
                irp.complete(RdpdrPdu::DeviceWriteResponse(DeviceWriteResponse { completion, length: 0 }));
                return;
            }
        };
        let mut guard = self.open.lock().expect("poisoned");
        let outcome = guard.get_mut(&irp.file_id).and_then(|e| e.file.as_mut()).map(|file| {
            file.seek(SeekFrom::Start(req.offset)).and_then(|_| file.write(&req.data))
        });
        drop(guard);
        match outcome {
            Some(Ok(n)) => {
                let completion = self.completion(&irp, status::STATUS_SUCCESS);
                irp.complete(RdpdrPdu::DeviceWriteResponse(DeviceWriteResponse {
                    completion,
                    length: n as u32,
                }));
            }
            Some(Err(err)) => {
                let completion = self.completion(&irp, status::from_io_error(&err));
                irp.complete(RdpdrPdu::DeviceWriteResponse(DeviceWriteResponse { completion, length: 0 }));
            }
            None => {
                let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
                irp.complete(RdpdrPdu::DeviceWriteResponse(DeviceWriteResponse { completion, length: 0 }));
            }
        }
    }

    fn handle_query_information(&self, irp: Irp) {
        let req = match rdpcore_core::decode::<QueryOrSetInformationRequest>(&irp.payload) {
            Ok(req) => req,
            Err(_) => {
                let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
                irp.complete(RdpdrPdu::DeviceIoResponse(DeviceIoResponse::new(completion, Vec::new())));
                return;
            }
        };
        let guard = self.open.lock().expect("poisoned");
        let Some(entry) = guard.get(&irp.file_id) else {
            drop(guard);
            let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
            irp.complete(RdpdrPdu::DeviceIoResponse(DeviceIoResponse::new(completion, Vec::new())));
            return;
        };
        let meta = fs::metadata(&entry.full_path);
        let is_dir = entry.is_dir;
        let hidden = entry
            .full_path
            .file_name()
            .map(|n| is_hidden(&n.to_string_lossy()))
            .unwrap_or(false);
        drop(guard);

        let Ok(meta) = meta else {
            let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
            irp.complete(RdpdrPdu::DeviceIoResponse(DeviceIoResponse::new(completion, Vec::new())));
            return;
        };

        let body = match req.fs_information_class {
            FsInformationClass::BasicInfo => {
                let t = filetime_of(&meta);
                let mut attrs = FileAttributes::empty();
                if is_dir {
                    attrs |= FileAttributes::DIRECTORY;
                }
                if meta.permissions().readonly() {
                    attrs |= FileAttributes::READONLY;
                }
                if hidden {
                    attrs |= FileAttributes::HIDDEN;
                }
                let info = BasicInformation {
                    creation_time: t,
                    last_access_time: t,
                    last_write_time: t,
                    change_time: t,
                    file_attributes: attrs,
                };
                rdpcore_core::encode_vec(&info).unwrap_or_default()
            }
            FsInformationClass::StandardInfo => {
                let info = StandardInformation {
                    allocation_size: meta.len(),
                    end_of_file: meta.len(),
                    number_of_links: 1,
                    delete_pending: false,
                    directory: is_dir,
                };
                rdpcore_core::encode_vec(&info).unwrap_or_default()
            }
            FsInformationClass::AttributeTagInfo => {
                let mut attrs = FileAttributes::empty();
                if is_dir {
                    attrs |= FileAttributes::DIRECTORY;
                }
                let mut body = Vec::with_capacity(8);
                body.extend_from_slice(&attrs.bits().to_le_bytes());
                body.extend_from_slice(&0u32.to_le_bytes());
                body
            }
            FsInformationClass::RenameInfo | FsInformationClass::DispositionInfo | FsInformationClass::EndOfFileInfo => {
                Vec::new()
            }
        };
        let completion = self.completion(&irp, status::STATUS_SUCCESS);
        irp.complete(RdpdrPdu::DeviceIoResponse(DeviceIoResponse::new(completion, body)));
    }

    fn handle_set_information(&self, irp: Irp) {
        let req = match rdpcore_core::decode::<QueryOrSetInformationRequest>(&irp.payload) {
            Ok(req) => req,
            Err(_) => {
                let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
                irp.complete(RdpdrPdu::DeviceIoResponse(DeviceIoResponse::new(completion, Vec::new())));
                return;
            }
        };

        let status_code = match req.fs_information_class {
            FsInformationClass::EndOfFileInfo if req.buffer.len() >= 8 => {
                let new_len = u64::from_le_bytes(req.buffer[..8].try_into().unwrap());
                let guard = self.open.lock().expect("poisoned");
                match guard.get(&irp.file_id).and_then(|e| e.file.as_ref()) {
                    Some(file) => file.set_len(new_len).err().map_or(status::STATUS_SUCCESS, |e| status::from_io_error(&e)),
                    None => status::STATUS_UNSUCCESSFUL,
                }
            }
            FsInformationClass::DispositionInfo => {
                let delete_pending = req.buffer.first().copied().unwrap_or(0) != 0;
                let mut guard = self.open.lock().expect("poisoned");
                if let Some(entry) = guard.get_mut(&irp.file_id) {
                    entry.delete_on_close = delete_pending;
                    status::STATUS_SUCCESS
                } else {
                    status::STATUS_UNSUCCESSFUL
                }
            }
            FsInformationClass::RenameInfo => {
                let mut cursor = rdpcore_core::ReadCursor::new(&req.buffer);
                match RenameInformation::decode(&mut cursor) {
                    Ok(rename) => self.rename(&irp, rename),
                    Err(_) => status::STATUS_UNSUCCESSFUL,
                }
            }
            FsInformationClass::BasicInfo if req.buffer.len() >= 36 => {
                let mut cursor = rdpcore_core::ReadCursor::new(&req.buffer);
                match BasicInformation::decode(&mut cursor) {
                    Ok(basic) => self.apply_basic_info(&irp, basic),
                    Err(_) => status::STATUS_UNSUCCESSFUL,
                }
            }
            _ => status::STATUS_SUCCESS,
        };
        let completion = self.completion(&irp, status_code);
        irp.complete(RdpdrPdu::DeviceIoResponse(DeviceIoResponse::new(completion, Vec::new())));
    }

    fn rename(&self, irp: &Irp, rename: RenameInformation) -> u32 {
        let mut guard = self.open.lock().expect("poisoned");
        let Some(entry) = guard.get_mut(&irp.file_id) else {
            return status::STATUS_UNSUCCESSFUL;
        };
        let new_path = self.resolve(&rename.new_path);
        if new_path.exists() && !rename.replace_if_exists {
            return status::STATUS_OBJECT_NAME_COLLISION;
        }
        match fs::rename(&entry.full_path, &new_path) {
            Ok(()) => {
                entry.full_path = new_path;
                status::STATUS_SUCCESS
            }
            Err(err) => status::from_io_error(&err),
        }
    }

    fn apply_basic_info(&self, irp: &Irp, basic: BasicInformation) -> u32 {
        let guard = self.open.lock().expect("poisoned");
        let Some(entry) = guard.get(&irp.file_id) else {
            return status::STATUS_UNSUCCESSFUL;
        };
        if basic.file_attributes.contains(FileAttributes::READONLY) {
            if let Ok(meta) = fs::metadata(&entry.full_path) {
                let mut perms = meta.permissions();
                perms.set_readonly(true);
                let _ = fs::set_permissions(&entry.full_path, perms);
            }
        }
        status::STATUS_SUCCESS
    }

    fn handle_query_volume_information(&self, irp: Irp) {
        // Minimal, statvfs-backed volume info: label "FREERDP", filesystem "FAT32" (§4.10).
        let body = volume_body(&self.base_path);
        let completion = self.completion(&irp, status::STATUS_SUCCESS);
        irp.complete(RdpdrPdu::DeviceIoResponse(DeviceIoResponse::new(completion, body)));
    }

    fn handle_directory_control(&self, irp: Irp) {
        if irp.minor_function != 0x0000_0002 {
            // Only QUERY_DIRECTORY (minor 0x02) is implemented; NOTIFY_CHANGE_DIRECTORY is not.
            let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
            irp.complete(RdpdrPdu::DeviceIoResponse(DeviceIoResponse::new(completion, Vec::new())));
            return;
        }
        let req = match rdpcore_core::decode::<QueryDirectoryRequest>(&irp.payload) {
            Ok(req) => req,
            Err(_) => {
                let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
                irp.complete(RdpdrPdu::ClientDriveQueryDirectoryResponse(ClientDriveQueryDirectoryResponse {
                    completion,
                    entry: None,
                }));
                return;
            }
        };

        let mut guard = self.open.lock().expect("poisoned");
        let Some(open_entry) = guard.get_mut(&irp.file_id) else {
            drop(guard);
            let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
            irp.complete(RdpdrPdu::ClientDriveQueryDirectoryResponse(ClientDriveQueryDirectoryResponse {
                completion,
                entry: None,
            }));
            return;
        };

        if req.initial_query || open_entry.dir_state.is_none() {
            let pattern = Path::new(&req.path)
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "*".to_owned());
            let entries: Vec<_> = fs::read_dir(&open_entry.full_path)
                .map(|rd| rd.filter_map(Result::ok).collect())
                .unwrap_or_default();
            open_entry.dir_state = Some(DirState { pattern, entries, next: 0 });
        }

        let dir_state = open_entry.dir_state.as_mut().expect("just set");
        let found = loop {
            if dir_state.next >= dir_state.entries.len() {
                break None;
            }
            let candidate = &dir_state.entries[dir_state.next];
            dir_state.next += 1;
            let name = candidate.file_name().to_string_lossy().into_owned();
            if glob_match(&dir_state.pattern, &name) {
                break Some((name, candidate.metadata().ok()));
            }
        };

        let response_entry = found.map(|(name, meta)| build_directory_entry(&name, meta.as_ref()));
        drop(guard);

        let status_code = if response_entry.is_some() {
            status::STATUS_SUCCESS
        } else {
            status::STATUS_NO_MORE_FILES
        };
        let completion = self.completion(&irp, status_code);
        irp.complete(RdpdrPdu::ClientDriveQueryDirectoryResponse(ClientDriveQueryDirectoryResponse {
            completion,
            entry: response_entry,
        }));
    }

    fn handle_device_control(&self, irp: Irp) {
        let _req = rdpcore_core::decode::<DeviceControlRequest>(&irp.payload);
        let completion = self.completion(&irp, status::STATUS_SUCCESS);
        irp.complete(RdpdrPdu::DeviceControlResponse(DeviceControlResponse { completion, output: Vec::new() }));
    }
}

/// Unix has no native hidden-file attribute; dotfiles are treated as hidden, matching the
/// convention the backend already follows for directory listings.
fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn filetime_of(meta: &fs::Metadata) -> i64 {
    let unix_time = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    unix_time * 10_000_000 + 116_444_736_000_000_000
}

fn open_entry(
    full_path: &Path,
    wants_dir: bool,
    disposition: CreateDisposition,
    desired_access: crate::pdu::drive_io::DesiredAccess,
) -> std::io::Result<(Option<File>, bool, bool)> {
    use crate::pdu::drive_io::DesiredAccess;

    if wants_dir {
        match disposition {
            CreateDisposition::Open | CreateDisposition::OpenIf => {
                if !full_path.exists() {
                    if matches!(disposition, CreateDisposition::OpenIf) {
                        fs::create_dir_all(full_path)?;
                        return Ok((None, true, true));
                    }
                    return Err(std::io::Error::from(std::io::ErrorKind::NotFound));
                }
                Ok((None, true, false))
            }
            CreateDisposition::Create => {
                fs::create_dir(full_path)?;
                Ok((None, true, true))
            }
            _ => Ok((None, true, false)),
        }
    } else {
        let writable = desired_access.intersects(
            DesiredAccess::GENERIC_ALL | DesiredAccess::GENERIC_WRITE | DesiredAccess::FILE_WRITE_DATA | DesiredAccess::FILE_APPEND_DATA,
        );
        let mut options = OpenOptions::new();
        options.read(true).write(writable);
        let created = match disposition {
            CreateDisposition::Supersede => {
                options.create(true).truncate(true);
                true
            }
            CreateDisposition::Open => false,
            CreateDisposition::Create => {
                options.create_new(true);
                true
            }
            CreateDisposition::OpenIf => {
                options.create(true);
                !full_path.exists()
            }
            CreateDisposition::Overwrite => {
                options.truncate(true);
                false
            }
            CreateDisposition::OverwriteIf => {
                options.create(true).truncate(true);
                !full_path.exists()
            }
        };
        let file = options.open(full_path)?;
        Ok((Some(file), false, created))
    }
}

fn build_directory_entry(name: &str, meta: Option<&fs::Metadata>) -> Vec<u8> {
    let is_dir = meta.map(fs::Metadata::is_dir).unwrap_or(false);
    let len = meta.map(fs::Metadata::len).unwrap_or(0);
    let t = meta.map(filetime_of).unwrap_or(0);
    let mut attrs = FileAttributes::empty();
    if is_dir {
        attrs |= FileAttributes::DIRECTORY;
    }
    if is_hidden(name) {
        attrs |= FileAttributes::HIDDEN;
    }

    let units: Vec<u16> = name.encode_utf16().collect();
    let name_len = units.len() * 2;
    let mut buf = Vec::with_capacity(64 + name_len);
    buf.extend_from_slice(&t.to_le_bytes()); // CreationTime
    buf.extend_from_slice(&t.to_le_bytes()); // LastAccessTime
    buf.extend_from_slice(&t.to_le_bytes()); // LastWriteTime
    buf.extend_from_slice(&t.to_le_bytes()); // ChangeTime
    buf.extend_from_slice(&len.to_le_bytes()); // EndOfFile
    buf.extend_from_slice(&len.to_le_bytes()); // AllocationSize
    buf.extend_from_slice(&attrs.bits().to_le_bytes());
    buf.extend_from_slice(&(name_len as u32).to_le_bytes());
    for unit in units {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf
}

fn volume_body(base_path: &Path) -> Vec<u8> {
    #[cfg(unix)]
    let (total, free) = nix::sys::statvfs::statvfs(base_path)
        .map(|s| (s.blocks() * s.fragment_size(), s.blocks_available() * s.fragment_size()))
        .unwrap_or((0, 0));
    #[cfg(not(unix))]
    let (total, free): (u64, u64) = (0, 0);

    let label = "FREERDP";
    let fs_name = "FAT32";
    let label_units: Vec<u16> = label.encode_utf16().collect();
    let fs_units: Vec<u16> = fs_name.encode_utf16().collect();

    let mut buf = Vec::new();
    buf.extend_from_slice(&total.to_le_bytes());
    buf.extend_from_slice(&free.to_le_bytes());
    buf.extend_from_slice(&(4096u32).to_le_bytes()); // bytes per sector
    buf.extend_from_slice(&(label_units.len() as u32 * 2).to_le_bytes());
    for unit in &label_units {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf.extend_from_slice(&(fs_units.len() as u32 * 2).to_le_bytes());
    for unit in &fs_units {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf
}

impl IrpHandler for DriveDevice {
    fn handle(&self, irp: Irp) {
        match irp.major_function {
            MajorFunction::Create => self.handle_create(irp),
            MajorFunction::Close | MajorFunction::Cleanup => self.handle_close(irp),
            MajorFunction::Read => self.handle_read(irp),
            MajorFunction::Write => self.handle_write(irp),
            MajorFunction::QueryInformation => self.handle_query_information(irp),
            MajorFunction::SetInformation => self.handle_set_information(irp),
            MajorFunction::QueryVolumeInformation => self.handle_query_volume_information(irp),
            MajorFunction::SetVolumeInformation => {
                let completion = self.completion(&irp, status::STATUS_SUCCESS);
                irp.complete(RdpdrPdu::DeviceIoResponse(DeviceIoResponse::new(completion, Vec::new())));
            }
            MajorFunction::DirectoryControl => self.handle_directory_control(irp),
            MajorFunction::DeviceControl => self.handle_device_control(irp),
            MajorFunction::LockControl => {
                let completion = self.completion(&irp, status::STATUS_SUCCESS);
                irp.complete(RdpdrPdu::DeviceIoResponse(DeviceIoResponse::new(completion, Vec::new())));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn create_then_write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let device = DriveDevice::new(1, dir.path().to_path_buf());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let create_req = DeviceCreateRequest {
            desired_access: crate::pdu::drive_io::DesiredAccess::GENERIC_WRITE,
            allocation_size: 0,
            file_attributes: FileAttributes::empty(),
            shared_access: 0,
            create_disposition: CreateDisposition::OpenIf,
            create_options: CreateOptions::empty(),
            path: "hello.txt".to_owned(),
        };
        let payload = encode_create(&create_req);
        let irp = Irp::new(
            crate::pdu::efs::DeviceIoRequestHeader {
                device_id: 1,
                file_id: 0,
                completion_id: 1,
                major_function: MajorFunction::Create,
                minor_function: 0,
            },
            payload,
            tx.clone(),
        );
        device.handle(irp);
        let RdpdrPdu::DeviceCreateResponse(resp) = rx.recv().await.unwrap() else {
            panic!("expected create response");
        };
        assert_eq!(resp.completion.io_status, status::STATUS_SUCCESS);
        assert!(dir.path().join("hello.txt").exists());
    }

    fn encode_create(req: &DeviceCreateRequest) -> Vec<u8> {
        let mut buf = vec![0u8; 32 + req.path.encode_utf16().count() * 2 + 2];
        let mut cursor = rdpcore_core::WriteCursor::new(&mut buf);
        cursor.write_u32(req.desired_access.bits());
        cursor.write_u64(req.allocation_size);
        cursor.write_u32(req.file_attributes.bits());
        cursor.write_u32(req.shared_access);
        cursor.write_u32(req.create_disposition as u32);
        cursor.write_u32(req.create_options.bits());
        let units: Vec<u16> = req.path.encode_utf16().chain(std::iter::once(0)).collect();
        cursor.write_u32((units.len() * 2) as u32);
        for unit in units {
            cursor.write_u16(unit);
        }
        buf
    }
}
