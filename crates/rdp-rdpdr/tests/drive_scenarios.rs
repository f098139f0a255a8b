//! End-to-end drive device scenarios driving `DriveDevice` the same way the channel's IRP
//! worker would: build a wire-encoded request payload, hand it to `device.handle()` inside
//! an `Irp`, and read the reply back off the IRP's reply channel.

use std::fs;

use rdp_rdpdr::device::drive::DriveDevice;
use rdp_rdpdr::irp::{Irp, IrpHandler};
use rdp_rdpdr::pdu::drive_io::{
    CreateDisposition, CreateOptions, DesiredAccess, FileAttributes, FsInformationClass,
};
use rdp_rdpdr::pdu::efs::{status, DeviceIoRequestHeader, MajorFunction};
use rdp_rdpdr::pdu::RdpdrPdu;
use rdpcore_core::WriteCursor;
use tempfile::tempdir;

fn encode_create(path: &str, desired_access: DesiredAccess, disposition: CreateDisposition, options: CreateOptions) -> Vec<u8> {
    let units: Vec<u16> = path.encode_utf16().chain(std::iter::once(0)).collect();
    let mut buf = vec![0u8; 32 + units.len() * 2];
    let mut cursor = WriteCursor::new(&mut buf);
    cursor.write_u32(desired_access.bits());
    cursor.write_u64(0); // allocation_size
    cursor.write_u32(FileAttributes::empty().bits());
    cursor.write_u32(0); // shared_access
    cursor.write_u32(disposition as u32);
    cursor.write_u32(options.bits());
    cursor.write_u32((units.len() * 2) as u32);
    for unit in units {
        cursor.write_u16(unit);
    }
    buf
}

fn encode_read(length: u32, offset: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 32];
    let mut cursor = WriteCursor::new(&mut buf);
    cursor.write_u32(length);
    cursor.write_u64(offset);
    cursor.write_array([0u8; 20]);
    buf
}

fn encode_write(offset: u64, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 32 + data.len()];
    let mut cursor = WriteCursor::new(&mut buf);
    cursor.write_u32(data.len() as u32);
    cursor.write_u64(offset);
    cursor.write_array([0u8; 20]);
    cursor.write_slice(data);
    buf
}

fn encode_query_directory(initial_query: bool, pattern: &str) -> Vec<u8> {
    let units: Vec<u16> = pattern.encode_utf16().collect();
    let mut buf = vec![0u8; 32 + units.len() * 2];
    let mut cursor = WriteCursor::new(&mut buf);
    cursor.write_u32(FsInformationClass::BasicInfo as u32);
    cursor.write_u8(u8::from(initial_query));
    cursor.write_u32((units.len() * 2) as u32);
    cursor.write_array([0u8; 23]);
    for unit in units {
        cursor.write_u16(unit);
    }
    buf
}

fn header(file_id: u32, completion_id: u32, major_function: MajorFunction, minor_function: u32) -> DeviceIoRequestHeader {
    DeviceIoRequestHeader {
        device_id: 1,
        file_id,
        completion_id,
        major_function,
        minor_function,
    }
}

/// Directory entry names are packed as `CreationTime(8) LastAccessTime(8) LastWriteTime(8)
/// ChangeTime(8) EndOfFile(8) AllocationSize(8) FileAttributes(4) FileNameLength(4) FileName`;
/// pull the name back out to assert on it without caring about the fixed-field values.
fn entry_name(entry: &[u8]) -> String {
    let name_len = u32::from_le_bytes(entry[52..56].try_into().unwrap()) as usize;
    let units: Vec<u16> = entry[56..56 + name_len]
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

#[tokio::test]
async fn create_read_close_round_trips_with_offset() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("foo"), b"ABCDE").unwrap();
    let device = DriveDevice::new(1, dir.path().to_path_buf());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let create_payload = encode_create(
        "foo",
        DesiredAccess::GENERIC_READ,
        CreateDisposition::Open,
        CreateOptions::empty(),
    );
    device.handle(Irp::new(header(0, 1, MajorFunction::Create, 0), create_payload, tx.clone()));
    let RdpdrPdu::DeviceCreateResponse(create_resp) = rx.recv().await.unwrap() else {
        panic!("expected create response");
    };
    assert_eq!(create_resp.completion.io_status, status::STATUS_SUCCESS);
    assert_eq!(create_resp.information, 0); // CreateInformation::Superseded
    let file_id = create_resp.file_id;

    let read_payload = encode_read(3, 1);
    device.handle(Irp::new(header(file_id, 2, MajorFunction::Read, 0), read_payload, tx.clone()));
    let RdpdrPdu::DeviceReadResponse(read_resp) = rx.recv().await.unwrap() else {
        panic!("expected read response");
    };
    assert_eq!(read_resp.completion.io_status, status::STATUS_SUCCESS);
    assert_eq!(read_resp.data, b"BCD");

    device.handle(Irp::new(header(file_id, 3, MajorFunction::Close, 0), Vec::new(), tx.clone()));
    let RdpdrPdu::DeviceCloseResponse(close_resp) = rx.recv().await.unwrap() else {
        panic!("expected close response");
    };
    assert_eq!(close_resp.completion.io_status, status::STATUS_SUCCESS);
    assert!(dir.path().join("foo").exists());
}

#[tokio::test]
async fn write_then_read_back_round_trips() {
    let dir = tempdir().unwrap();
    let device = DriveDevice::new(1, dir.path().to_path_buf());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let create_payload = encode_create(
        "bar",
        DesiredAccess::GENERIC_WRITE,
        CreateDisposition::OpenIf,
        CreateOptions::empty(),
    );
    device.handle(Irp::new(header(0, 1, MajorFunction::Create, 0), create_payload, tx.clone()));
    let RdpdrPdu::DeviceCreateResponse(create_resp) = rx.recv().await.unwrap() else {
        panic!("expected create response");
    };
    let file_id = create_resp.file_id;

    let write_payload = encode_write(0, b"hello world");
    device.handle(Irp::new(header(file_id, 2, MajorFunction::Write, 0), write_payload, tx.clone()));
    let RdpdrPdu::DeviceWriteResponse(write_resp) = rx.recv().await.unwrap() else {
        panic!("expected write response");
    };
    assert_eq!(write_resp.completion.io_status, status::STATUS_SUCCESS);
    assert_eq!(write_resp.length, 11);

    assert_eq!(fs::read(dir.path().join("bar")).unwrap(), b"hello world");
}

#[tokio::test]
async fn query_directory_matches_pattern_then_reports_no_more_files() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), b"").unwrap();
    fs::write(dir.path().join("b.txt"), b"").unwrap();
    fs::write(dir.path().join("c.log"), b"").unwrap();
    let device = DriveDevice::new(1, dir.path().to_path_buf());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let create_payload = encode_create(
        "",
        DesiredAccess::GENERIC_READ,
        CreateDisposition::Open,
        CreateOptions::FILE_DIRECTORY_FILE,
    );
    device.handle(Irp::new(header(0, 1, MajorFunction::Create, 0), create_payload, tx.clone()));
    let RdpdrPdu::DeviceCreateResponse(create_resp) = rx.recv().await.unwrap() else {
        panic!("expected create response");
    };
    assert_eq!(create_resp.completion.io_status, status::STATUS_SUCCESS);
    let file_id = create_resp.file_id;

    let mut seen = Vec::new();
    for (initial, completion_id) in [(true, 2u32), (false, 3), (false, 4)] {
        let query_payload = encode_query_directory(initial, "*.txt");
        device.handle(Irp::new(
            header(file_id, completion_id, MajorFunction::DirectoryControl, 0x0000_0002),
            query_payload,
            tx.clone(),
        ));
        let RdpdrPdu::ClientDriveQueryDirectoryResponse(resp) = rx.recv().await.unwrap() else {
            panic!("expected query directory response");
        };
        match resp.entry {
            Some(entry) => {
                assert_eq!(resp.completion.io_status, status::STATUS_SUCCESS);
                seen.push(entry_name(&entry));
            }
            None => {
                assert_eq!(resp.completion.io_status, status::STATUS_NO_MORE_FILES);
            }
        }
    }

    seen.sort();
    assert_eq!(seen, vec!["a.txt".to_owned(), "b.txt".to_owned()]);
}

#[tokio::test]
async fn delete_on_close_removes_file() {
    let dir = tempdir().unwrap();
    let device = DriveDevice::new(1, dir.path().to_path_buf());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let create_payload = encode_create(
        "doomed.txt",
        DesiredAccess::GENERIC_WRITE,
        CreateDisposition::OpenIf,
        CreateOptions::FILE_DELETE_ON_CLOSE,
    );
    device.handle(Irp::new(header(0, 1, MajorFunction::Create, 0), create_payload, tx.clone()));
    let RdpdrPdu::DeviceCreateResponse(create_resp) = rx.recv().await.unwrap() else {
        panic!("expected create response");
    };
    let file_id = create_resp.file_id;
    assert!(dir.path().join("doomed.txt").exists());

    let write_payload = encode_write(0, b"temp");
    device.handle(Irp::new(header(file_id, 2, MajorFunction::Write, 0), write_payload, tx.clone()));
    let RdpdrPdu::DeviceWriteResponse(write_resp) = rx.recv().await.unwrap() else {
        panic!("expected write response");
    };
    assert_eq!(write_resp.completion.io_status, status::STATUS_SUCCESS);

    device.handle(Irp::new(header(file_id, 3, MajorFunction::Close, 0), Vec::new(), tx.clone()));
    let RdpdrPdu::DeviceCloseResponse(close_resp) = rx.recv().await.unwrap() else {
        panic!("expected close response");
    };
    assert_eq!(close_resp.completion.io_status, status::STATUS_SUCCESS);
    assert!(!dir.path().join("doomed.txt").exists());
}
