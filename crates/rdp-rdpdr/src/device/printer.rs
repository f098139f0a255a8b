//! Printer device (C11, §4.11): spools `WRITE` payloads to a print job opened at `CREATE`
//! and closed at `CLOSE`, through a small backend seam so the default build needs no real
//! printing stack.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::irp::{Irp, IrpHandler};
use crate::pdu::efs::{status, DeviceCloseResponse, DeviceControlResponse, DeviceCreateResponse, DeviceIoResponse, DeviceWriteResponse, MajorFunction};
use crate::pdu::RdpdrPdu;

/// One host printer as reported by [`PrinterBackend::enumerate`] (§4.11 supplemental
/// feature): the CUPS/`printer_main.c` enum-printers contract, trimmed to the fields the
/// redirector needs to pick a printer and build its announce blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterInfo {
    pub name: String,
    pub driver_name: String,
    /// Whether the host reports this as its default printer; used to auto-select a
    /// printer when a `DeviceConfig::Printer` is configured without an explicit name.
    pub default: bool,
}

/// What a printer device needs from the host print system; swappable so tests and headless
/// builds can run without CUPS or a spooler present.
pub trait PrinterBackend: Send + Sync {
    fn create_print_job(&self, printer_name: &str) -> std::io::Result<u32>;
    fn write_print_job(&self, job_id: u32, data: &[u8]) -> std::io::Result<()>;
    fn close_print_job(&self, job_id: u32) -> std::io::Result<()>;
    /// Lists host printers available for redirection (§4.11 supplemental feature).
    fn enumerate(&self) -> Vec<PrinterInfo>;
}

/// Accepts every job and discards written bytes; the backend used when no host print
/// system is wired in (§4.11 Non-goal: "printer driver installation").
struct NoopBackend {
    next_job_id: AtomicU32,
}

impl PrinterBackend for NoopBackend {
    fn create_print_job(&self, _printer_name: &str) -> std::io::Result<u32> {
        Ok(self.next_job_id.fetch_add(1, Ordering::Relaxed))
    }

    fn write_print_job(&self, _job_id: u32, _data: &[u8]) -> std::io::Result<()> {
        Ok(())
    }

    fn close_print_job(&self, _job_id: u32) -> std::io::Result<()> {
        Ok(())
    }

    fn enumerate(&self) -> Vec<PrinterInfo> {
        Vec::new()
    }
}

pub fn noop_backend() -> Arc<dyn PrinterBackend> {
    Arc::new(NoopBackend { next_job_id: AtomicU32::new(1) })
}

/// Builds the `DeviceAnnounce.device_data` blob for a printer (§4.11): capability flags,
/// ANSI code page, PnP device id (unused, length 0), then the driver and friendly names as
/// NUL-terminated UTF-16, then an empty cached printer-config block.
pub fn announce_blob(driver_name: &str, print_name: &str) -> Vec<u8> {
    const RDPDR_PRINTER_ANNOUNCE_FLAG_ASCII: u32 = 0x0000_0001;

    let driver_units: Vec<u16> = driver_name.encode_utf16().collect();
    let print_units: Vec<u16> = print_name.encode_utf16().collect();
    let driver_len = (driver_units.len() + 1) * 2;
    let print_len = (print_units.len() + 1) * 2;

    let mut buf = Vec::with_capacity(24 + driver_len + print_len);
    buf.extend_from_slice(&RDPDR_PRINTER_ANNOUNCE_FLAG_ASCII.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // CodePage
    buf.extend_from_slice(&0u32.to_le_bytes()); // PnPNameLen
    buf.extend_from_slice(&(driver_len as u32).to_le_bytes());
    buf.extend_from_slice(&(print_len as u32).to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // CachedFieldsLen
    for unit in &driver_units {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf.extend_from_slice(&0u16.to_le_bytes());
    for unit in &print_units {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf
}

struct OpenJob {
    job_id: u32,
}

pub struct PrinterDevice {
    id: u32,
    name: String,
    backend: Arc<dyn PrinterBackend>,
    open: Mutex<std::collections::HashMap<u32, OpenJob>>,
    next_file_id: AtomicU32,
}

impl PrinterDevice {
    pub fn new(id: u32, backend: Arc<dyn PrinterBackend>) -> Self {
        Self {
            id,
            name: format!("printer{id}"),
            backend,
            open: Mutex::new(std::collections::HashMap::new()),
            next_file_id: AtomicU32::new(1),
        }
    }

    fn completion(&self, irp: &Irp, io_status: u32) -> crate::pdu::efs::IoCompletionHeader {
        crate::pdu::efs::IoCompletionHeader::new(self.id, irp.completion_id, io_status)
    }
}

impl IrpHandler for PrinterDevice {
    fn handle(&self, irp: Irp) {
        match irp.major_function {
            MajorFunction::Create => {
                let status_code = match self.backend.create_print_job(&self.name) {
                    Ok(job_id) => {
                        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
                        self.open.lock().expect("poisoned").insert(file_id, OpenJob { job_id });
                        let completion = self.completion(&irp, status::STATUS_SUCCESS);
                        irp.complete(RdpdrPdu::DeviceCreateResponse(DeviceCreateResponse {
                            completion,
                            file_id,
                            information: 0,
                        }));
                        return;
                    }
                    Err(err) => status::from_io_error(&err),
                };
                let completion = self.completion(&irp, status_code);
                irp.complete(RdpdrPdu::DeviceCreateResponse(DeviceCreateResponse {
                    completion,
                    file_id: 0,
                    information: 0,
                }));
            }
            MajorFunction::Close | MajorFunction::Cleanup => {
                let job = self.open.lock().expect("poisoned").remove(&irp.file_id);
                let status_code = match job {
                    Some(job) => self
                        .backend
                        .close_print_job(job.job_id)
                        .err()
                        .map_or(status::STATUS_SUCCESS, |e| status::from_io_error(&e)),
                    None => status::STATUS_UNSUCCESSFUL,
                };
                let completion = self.completion(&irp, status_code);
                irp.complete(RdpdrPdu::DeviceCloseResponse(DeviceCloseResponse { completion }));
            }
            MajorFunction::Write => {
                let req = match rdpcore_core::decode::<crate::pdu::drive_io::DeviceWriteRequest>(&irp.payload) {
                    Ok(req) => req,
                    Err(_) => {
                        let completion = self.completion(&irp, status::STATUS_UNSUCCESSFUL);
                        irp.complete(RdpdrPdu::DeviceWriteResponse(DeviceWriteResponse { completion, length: 0 }));
                        return;
                    }
                };
                let job_id = self.open.lock().expect("poisoned").get(&irp.file_id).map(|j| j.job_id);
                let status_code = match job_id {
                    Some(job_id) => self
                        .backend
                        .write_print_job(job_id, &req.data)
                        .err()
                        .map_or(status::STATUS_SUCCESS, |e| status::from_io_error(&e)),
                    None => status::STATUS_UNSUCCESSFUL,
                };
                let length = if status_code == status::STATUS_SUCCESS { req.data.len() as u32 } else { 0 };
                let completion = self.completion(&irp, status_code);
                irp.complete(RdpdrPdu::DeviceWriteResponse(DeviceWriteResponse { completion, length }));
            }
            MajorFunction::DeviceControl => {
                // Printer-specific IOCTLs (port enumeration, driver data) are not modeled; every
                // call succeeds with an empty output buffer.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_blob_layout_has_nul_terminated_names() {
        let blob = announce_blob("MS Publisher Imagesetter", "Redirected Printer");
        let driver_len = u32::from_le_bytes(blob[12..16].try_into().unwrap()) as usize;
        let print_len = u32::from_le_bytes(blob[16..20].try_into().unwrap()) as usize;
        assert_eq!(driver_len, ("MS Publisher Imagesetter".encode_utf16().count() + 1) * 2);
        assert_eq!(blob.len(), 24 + driver_len + print_len);
    }

    #[tokio::test]
    async fn create_write_close_round_trips_through_noop_backend() {
        let device = PrinterDevice::new(1, noop_backend());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let header = crate::pdu::efs::DeviceIoRequestHeader {
            device_id: 1,
            file_id: 0,
            completion_id: 1,
            major_function: MajorFunction::Create,
            minor_function: 0,
        };
        device.handle(Irp::new(header, Vec::new(), tx.clone()));
        let RdpdrPdu::DeviceCreateResponse(resp) = rx.recv().await.unwrap() else {
            panic!("expected create response");
        };
        assert_eq!(resp.completion.io_status, status::STATUS_SUCCESS);
    }

    #[test]
    fn noop_backend_enumerates_no_printers() {
        assert!(noop_backend().enumerate().is_empty());
    }

    struct FixedBackend(Vec<PrinterInfo>);

    impl PrinterBackend for FixedBackend {
        fn create_print_job(&self, _printer_name: &str) -> std::io::Result<u32> {
            Ok(1)
        }
        fn write_print_job(&self, _job_id: u32, _data: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
        fn close_print_job(&self, _job_id: u32) -> std::io::Result<()> {
            Ok(())
        }
        fn enumerate(&self) -> Vec<PrinterInfo> {
            self.0.clone()
        }
    }

    #[test]
    fn enumerate_reports_the_default_printer_among_several() {
        let backend = FixedBackend(vec![
            PrinterInfo {
                name: "Office".to_owned(),
                driver_name: "Generic".to_owned(),
                default: false,
            },
            PrinterInfo {
                name: "Home".to_owned(),
                driver_name: "Generic PostScript".to_owned(),
                default: true,
            },
        ]);
        let default = backend.enumerate().into_iter().find(|p| p.default).expect("a default printer");
        assert_eq!(default.name, "Home");
    }
}
