//! Serial & parallel devices (C12, §4.12): non-blocking fd I/O, with the serial device
//! additionally tracking termios-like line state and completing `READ`/`WRITE` IRPs
//! asynchronously against configurable timeouts and an abort-io cancellation path.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write as _};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;

use crate::irp::{Irp, IrpHandler};
use crate::pdu::drive_io::{DeviceControlRequest, DeviceReadRequest, DeviceWriteRequest};
use crate::pdu::efs::{
    status, DeviceCloseResponse, DeviceControlResponse, DeviceCreateResponse, DeviceIoResponse, DeviceReadResponse,
    DeviceWriteResponse, IoCompletionHeader, MajorFunction,
};
use crate::pdu::RdpdrPdu;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// [MS-RDPESP] §2.2.2 IOCTL codes this implementation understands; everything else is
/// acknowledged with `STATUS_SUCCESS` and an empty output buffer.
mod ioctl {
    pub const SET_BAUD_RATE: u32 = 0x001B_0004;
    pub const SET_TIMEOUTS: u32 = 0x001B_001C;
    pub const GET_TIMEOUTS: u32 = 0x001B_0020;
    pub const SET_WAIT_MASK: u32 = 0x001B_0040;
    pub const PURGE: u32 = 0x001B_004C;

    pub const PURGE_TXABORT: u32 = 0x0000_0001;
    pub const PURGE_RXABORT: u32 = 0x0000_0002;
}

#[derive(Clone)]
struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        if !self.cancelled.load(Ordering::SeqCst) {
            self.notify.notified().await;
        }
    }
}

#[derive(Clone, Copy, Default)]
struct SerialTimeouts {
    read_interval: u32,
    read_total_multiplier: u32,
    read_total_constant: u32,
    write_total_multiplier: u32,
    write_total_constant: u32,
}

impl SerialTimeouts {
    fn read_timeout(&self, length: u32) -> Duration {
        let ms = (self.read_total_multiplier as u64) * (length as u64) + self.read_total_constant as u64;
        if ms == 0 {
            DEFAULT_TIMEOUT
        } else {
            Duration::from_millis(ms).min(DEFAULT_TIMEOUT)
        }
    }

    fn write_timeout(&self, length: u32) -> Duration {
        let ms = (self.write_total_multiplier as u64) * (length as u64) + self.write_total_constant as u64;
        if ms == 0 {
            DEFAULT_TIMEOUT
        } else {
            Duration::from_millis(ms).min(DEFAULT_TIMEOUT)
        }
    }
}

struct SerialSession {
    fd: Arc<AsyncFd<File>>,
    read_cancel: CancelToken,
    write_cancel: CancelToken,
}

pub struct SerialDevice {
    id: u32,
    path: PathBuf,
    reply_tx: UnboundedSender<RdpdrPdu>,
    sessions: Mutex<HashMap<u32, SerialSession>>,
    timeouts: Mutex<SerialTimeouts>,
    next_file_id: AtomicU32,
}

impl SerialDevice {
    pub fn new(id: u32, path: PathBuf, reply_tx: UnboundedSender<RdpdrPdu>) -> Self {
        Self {
            id,
            path,
            reply_tx,
            sessions: Mutex::new(HashMap::new()),
            timeouts: Mutex::new(SerialTimeouts::default()),
            next_file_id: AtomicU32::new(1),
        }
    }

    fn completion(&self, device_id: u32, completion_id: u32, io_status: u32) -> IoCompletionHeader {
        IoCompletionHeader::new(device_id, completion_id, io_status)
    }

    fn handle_create(&self, irp: Irp) {
        let result = OpenOptions::new().read(true).write(true).custom_flags(libc_o_nonblock()).open(&self.path);
        match result {
            Ok(file) => {
                let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
                match AsyncFd::new(file) {
                    Ok(fd) => {
                        self.sessions.lock().expect("poisoned").insert(
                            file_id,
                            SerialSession {
                                fd: Arc::new(fd),
                                read_cancel: CancelToken::new(),
                                write_cancel: CancelToken::new(),
                            },
                        );
                        let completion = self.completion(irp.device_id, irp.completion_id, status::STATUS_SUCCESS);
                        irp.complete(RdpdrPdu::DeviceCreateResponse(DeviceCreateResponse { completion, file_id, information: 0 }));
                    }
                    Err(_) => {
                        let completion = self.completion(irp.device_id, irp.completion_id, status::STATUS_UNSUCCESSFUL);
                        irp.complete(RdpdrPdu::DeviceCreateResponse(DeviceCreateResponse { completion, file_id: 0, information: 0 }));
                    }
                }
            }
            Err(err) => {
                let completion = self.completion(irp.device_id, irp.completion_id, status::from_io_error(&err));
                irp.complete(RdpdrPdu::DeviceCreateResponse(DeviceCreateResponse { completion, file_id: 0, information: 0 }));
            }
        }
    }

    fn handle_close(&self, irp: Irp) {
        let session = self.sessions.lock().expect("poisoned").remove(&irp.file_id);
        if let Some(session) = &session {
            session.read_cancel.cancel();
            session.write_cancel.cancel();
        }
        let status_code = if session.is_some() { status::STATUS_SUCCESS } else { status::STATUS_UNSUCCESSFUL };
        let completion = self.completion(irp.device_id, irp.completion_id, status_code);
        irp.complete(RdpdrPdu::DeviceCloseResponse(DeviceCloseResponse { completion }));
    }

    fn handle_read(&self, irp: Irp) {
        let req = match rdpcore_core::decode::<DeviceReadRequest>(&irp.payload) {
            Ok(req) => req,
            Err(_) => {
                let completion = self.completion(irp.device_id, irp.completion_id, status::STATUS_UNSUCCESSFUL);
                irp.complete(RdpdrPdu::DeviceReadResponse(DeviceReadResponse { completion, data: Vec::new() }));
                return;
            }
        };
        let Some((fd, cancel)) = self
            .sessions
            .lock()
            .expect("poisoned")
            .get(&irp.file_id)
            .map(|s| (s.fd.clone(), s.read_cancel.clone()))
        else {
            let completion = self.completion(irp.device_id, irp.completion_id, status::STATUS_UNSUCCESSFUL);
            irp.complete(RdpdrPdu::DeviceReadResponse(DeviceReadResponse { completion, data: Vec::new() }));
            return;
        };
        let timeout = self.timeouts.lock().expect("poisoned").read_timeout(req.length);
        let device_id = irp.device_id;

        tokio::spawn(async move {
            let length = req.length as usize;
            let outcome = tokio::select! {
                _ = cancel.wait() => Outcome::Cancelled,
                _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
                res = read_ready(&fd, length) => Outcome::Done(res),
            };
            let (io_status, data) = match outcome {
                Outcome::Cancelled => (status::STATUS_CANCELLED, Vec::new()),
                Outcome::TimedOut => (status::STATUS_TIMEOUT, Vec::new()),
                Outcome::Done(Ok(data)) => (status::STATUS_SUCCESS, data),
                Outcome::Done(Err(err)) => (status::from_io_error(&err), Vec::new()),
            };
            let completion = IoCompletionHeader::new(device_id, irp.completion_id, io_status);
            irp.complete(RdpdrPdu::DeviceReadResponse(DeviceReadResponse { completion, data }));
        });
    }

    fn handle_write(&self, irp: Irp) {
        let req = match rdpcore_core::decode::<DeviceWriteRequest>(&irp.payload) {
            Ok(req) => req,
            Err(_) => {
                let completion = self.completion(irp.device_id, irp.completion_id, status::STATUS_UNSUCCESSFUL);
                irp.complete(RdpdrPdu::DeviceWriteResponse(DeviceWriteResponse { completion, length: 0 }));
                return;
            }
        };
        let Some((fd, cancel)) = self
            .sessions
            .lock()
            .expect("poisoned")
            .get(&irp.file_id)
            .map(|s| (s.fd.clone(), s.write_cancel.clone()))
        else {
            let completion = self.completion(irp.device_id, irp.completion_id, status::STATUS_UNSUCCESSFUL);
            irp.complete(RdpdrPdu::DeviceWriteResponse(DeviceWriteResponse { completion, length: 0 }));
            return;
        };
        let timeout = self.timeouts.lock().expect("poisoned").write_timeout(req.data.len() as u32);
        let device_id = irp.device_id;

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.wait() => Outcome::Cancelled,
                _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
                res = write_ready(&fd, &req.data) => Outcome::Done(res),
            };
            let (io_status, length) = match outcome {
                Outcome::Cancelled => (status::STATUS_CANCELLED, 0),
                Outcome::TimedOut => (status::STATUS_TIMEOUT, 0),
                Outcome::Done(Ok(n)) => (status::STATUS_SUCCESS, n as u32),
                Outcome::Done(Err(err)) => (status::from_io_error(&err), 0),
            };
            let completion = IoCompletionHeader::new(device_id, irp.completion_id, io_status);
            irp.complete(RdpdrPdu::DeviceWriteResponse(DeviceWriteResponse { completion, length }));
        });
    }

    fn handle_device_control(&self, irp: Irp) {
        let req = match rdpcore_core::decode::<DeviceControlRequest>(&irp.payload) {
            Ok(req) => req,
            Err(_) => {
                let completion = self.completion(irp.device_id, irp.completion_id, status::STATUS_UNSUCCESSFUL);
                irp.complete(RdpdrPdu::DeviceControlResponse(DeviceControlResponse { completion, output: Vec::new() }));
                return;
            }
        };

        match req.io_control_code {
            ioctl::SET_TIMEOUTS if req.input_buffer.len() >= 20 => {
                let b = &req.input_buffer;
                let mut timeouts = self.timeouts.lock().expect("poisoned");
                timeouts.read_interval = u32::from_le_bytes(b[0..4].try_into().unwrap());
                timeouts.read_total_multiplier = u32::from_le_bytes(b[4..8].try_into().unwrap());
                timeouts.read_total_constant = u32::from_le_bytes(b[8..12].try_into().unwrap());
                timeouts.write_total_multiplier = u32::from_le_bytes(b[12..16].try_into().unwrap());
                timeouts.write_total_constant = u32::from_le_bytes(b[16..20].try_into().unwrap());
            }
            ioctl::GET_TIMEOUTS => {}
            ioctl::PURGE if req.input_buffer.len() >= 4 => {
                let flags = u32::from_le_bytes(req.input_buffer[0..4].try_into().unwrap());
                if let Some(session) = self.sessions.lock().expect("poisoned").get(&irp.file_id) {
                    if flags & ioctl::PURGE_RXABORT != 0 {
                        session.read_cancel.cancel();
                    }
                    if flags & ioctl::PURGE_TXABORT != 0 {
                        session.write_cancel.cancel();
                    }
                }
            }
            ioctl::SET_BAUD_RATE | ioctl::SET_WAIT_MASK => {}
            _ => {}
        }

        let completion = self.completion(irp.device_id, irp.completion_id, status::STATUS_SUCCESS);
        irp.complete(RdpdrPdu::DeviceControlResponse(DeviceControlResponse { completion, output: Vec::new() }));
    }
}

impl IrpHandler for SerialDevice {
    fn handle(&self, irp: Irp) {
        match irp.major_function {
            MajorFunction::Create => self.handle_create(irp),
            MajorFunction::Close | MajorFunction::Cleanup => self.handle_close(irp),
            MajorFunction::Read => self.handle_read(irp),
            MajorFunction::Write => self.handle_write(irp),
            MajorFunction::DeviceControl => self.handle_device_control(irp),
            _ => {
                let completion = self.completion(irp.device_id, irp.completion_id, status::STATUS_SUCCESS);
                irp.complete(RdpdrPdu::DeviceIoResponse(DeviceIoResponse::new(completion, Vec::new())));
            }
        }
    }
}

enum Outcome<T> {
    Cancelled,
    TimedOut,
    Done(T),
}

async fn read_ready(fd: &AsyncFd<File>, length: usize) -> std::io::Result<Vec<u8>> {
    loop {
        let mut guard = fd.readable().await?;
        let mut buf = vec![0u8; length];
        match guard.try_io(|inner| inner.get_ref().try_clone()?.read(&mut buf)) {
            Ok(Ok(n)) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Ok(Err(err)) => return Err(err),
            Err(_would_block) => continue,
        }
    }
}

async fn write_ready(fd: &AsyncFd<File>, data: &[u8]) -> std::io::Result<usize> {
    loop {
        let mut guard = fd.writable().await?;
        match guard.try_io(|inner| inner.get_ref().try_clone()?.write(data)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

#[cfg(unix)]
fn libc_o_nonblock() -> i32 {
    nix::fcntl::OFlag::O_NONBLOCK.bits()
}

/// Parallel port device: non-blocking fd open, partial read/write, no termios state
/// (§4.12). Short writes loop until the caller's buffer is exhausted.
pub struct ParallelDevice {
    id: u32,
    path: PathBuf,
    open: Mutex<HashMap<u32, File>>,
    next_file_id: AtomicU32,
}

impl ParallelDevice {
    pub fn new(id: u32, path: PathBuf) -> Self {
        Self {
            id,
            path,
            open: Mutex::new(HashMap::new()),
            next_file_id: AtomicU32::new(1),
        }
    }

    fn completion(&self, irp: &Irp, io_status: u32) -> IoCompletionHeader {
        IoCompletionHeader::new(self.id, irp.completion_id, io_status)
    }

    fn map_errno(err: &std::io::Error) -> u32 {
        match err.raw_os_error() {
            Some(libc_enxio) if libc_enxio == nix::libc::ENXIO => status::STATUS_DEVICE_OFF_LINE,
            Some(libc_enospc) if libc_enospc == nix::libc::ENOSPC => status::STATUS_DEVICE_PAPER_EMPTY,
            _ => status::from_io_error(err),
        }
    }
}

impl IrpHandler for ParallelDevice {
    fn handle(&self, irp: Irp) {
        match irp.major_function {
            MajorFunction::Create => {
                let result = OpenOptions::new().read(true).write(true).custom_flags(libc_o_nonblock()).open(&self.path);
                match result {
                    Ok(file) => {
                        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
                        self.open.lock().expect("poisoned").insert(file_id, file);
                        let completion = self.completion(&irp, status::STATUS_SUCCESS);
                        irp.complete(RdpdrPdu::DeviceCreateResponse(DeviceCreateResponse { completion, file_id, information: 0 }));
                    }
                    Err(err) => {
                        let completion = self.completion(&irp, Self::map_errno(&err));
                        irp.complete(RdpdrPdu::DeviceCreateResponse(DeviceCreateResponse { completion, file_id: 0, information: 0 }));
                    }
                }
            }
            MajorFunction::Close | MajorFunction::Cleanup => {
                let existed = self.open.lock().expect("poisoned").remove(&irp.file_id).is_some();
                let status_code = if existed { status::STATUS_SUCCESS } else { status::STATUS_UNSUCCESSFUL };
                let completion = self.completion(&irp, status_code);
                irp.complete(RdpdrPdu::DeviceCloseResponse(DeviceCloseResponse { completion }));
            }
            MajorFunction::Read => {
                let req = match rdpcore_core::decode::<DeviceReadRequest>(&irp.payload) {
                    Ok(req) => req,
                    Err(_) => {
                        let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
                        irp.complete(RdpdrPdu::DeviceReadResponse(DeviceReadResponse { completion, data: Vec::new() }));
                        return;
                    }
                };
                let mut guard = self.open.lock().expect("poisoned");
                let outcome = guard.get_mut(&irp.file_id).map(|file| {
                    let mut buf = vec![0u8; req.length as usize];
                    file.read(&mut buf).map(|n| {
                        buf.truncate(n);
                        buf
                    })
                });
                drop(guard);
                match outcome {
                    Some(Ok(data)) => {
                        let completion = self.completion(&irp, status::STATUS_SUCCESS);
                        irp.complete(RdpdrPdu::DeviceReadResponse(DeviceReadResponse { completion, data }));
                    }
                    Some(Err(err)) => {
                        let completion = self.completion(&irp, Self::map_errno(&err));
                        irp.complete(RdpdrPdu::DeviceReadResponse(DeviceReadResponse { completion, data: Vec::new() }));
                    }
                    None => {
                        let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
                        irp.complete(RdpdrPdu::DeviceReadResponse(DeviceReadResponse { completion, data: Vec::new() }));
                    }
                }
            }
            MajorFunction::Write => {
                let req = match rdpcore_core::decode::<DeviceWriteRequest>(&irp.payload) {
                    Ok(req) => req,
                    Err(_) => {
                        let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
                        irp.complete(RdpdrPdu::DeviceWriteResponse(DeviceWriteResponse { completion, length: 0 }));
                        return;
                    }
                };
                let mut guard = self.open.lock().expect("poisoned");
                let result = guard.get_mut(&irp.file_id).map(|file| write_all_partial(file, &req.data));
                drop(guard);
                match result {
                    Some(Ok(n)) => {
                        let completion = self.completion(&irp, status::STATUS_SUCCESS);
                        irp.complete(RdpdrPdu::DeviceWriteResponse(DeviceWriteResponse { completion, length: n as u32 }));
                    }
                    Some(Err(err)) => {
                        let completion = self.completion(&irp, Self::map_errno(&err));
                        irp.complete(RdpdrPdu::DeviceWriteResponse(DeviceWriteResponse { completion, length: 0 }));
                    }
                    None => {
                        let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
                        irp.complete(RdpdrPdu::DeviceWriteResponse(DeviceWriteResponse { completion, length: 0 }));
                    }
                }
            }
            MajorFunction::DeviceControl => {
                let completion = self.completion(&irp, status::STATUS_SUCCESS);
                irp.complete(RdpdrPdu::DeviceControlResponse(DeviceControlResponse { completion, output: Vec::new() }));
            }
            _ => {
                let completion = self.completion(&irp, status::STATUS_SUCCESS);
                irp.complete(RdpdrPdu::DeviceIoResponse(DeviceIoResponse::new(completion, Vec::new())));
            }
        }
    }
}

/// Retries on `WouldBlock` until the whole buffer is consumed or a hard error occurs,
/// matching the spec's "on short write, loop until input exhausted" (§4.12).
fn write_all_partial(file: &mut File, data: &[u8]) -> std::io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match file.write(&data[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_fall_back_to_default_when_unconfigured() {
        let timeouts = SerialTimeouts::default();
        assert_eq!(timeouts.read_timeout(100), DEFAULT_TIMEOUT);
    }

    #[test]
    fn timeouts_scale_with_length() {
        let timeouts = SerialTimeouts {
            read_total_multiplier: 2,
            read_total_constant: 10,
            ..Default::default()
        };
        assert_eq!(timeouts.read_timeout(5), Duration::from_millis(20));
    }
}
