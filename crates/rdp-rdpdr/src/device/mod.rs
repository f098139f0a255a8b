//! Device implementations (C10-C13) and the service loader that turns a [`DeviceConfig`]
//! into a registered, worker-backed device (§4.8).

pub mod drive;
pub mod printer;
pub mod serial;
pub mod smartcard;

use tokio::sync::mpsc::UnboundedSender;

use crate::devman::DeviceManager;
use crate::irp::spawn_worker;
use crate::pdu::efs::DeviceAnnounceHeader;
use crate::pdu::RdpdrPdu;

/// Per-type construction parameters, selected by the service loader (§4.8).
pub enum DeviceConfig {
    Drive { name: String, base_path: std::path::PathBuf },
    Printer { name: String, driver_name: String },
    Smartcard { name: String },
    Serial { name: String, path: std::path::PathBuf },
    Parallel { name: String, path: std::path::PathBuf },
}

/// Constructs the device named by `config`, spawns its IRP worker, and registers it with
/// `devman`. Returns the assigned device id.
pub fn load(devman: &DeviceManager, config: DeviceConfig, reply_tx: UnboundedSender<RdpdrPdu>) -> u32 {
    let id = devman.reserve_id();
    match config {
        DeviceConfig::Drive { name, base_path } => {
            let handler = drive::DriveDevice::new(id, base_path);
            let announce = DeviceAnnounceHeader::new(crate::pdu::efs::DeviceType::Filesystem, id, &name, Vec::new());
            let (tx, worker) = spawn_worker(handler);
            devman.register(id, announce, tx, worker);
        }
        DeviceConfig::Printer { name, driver_name } => {
            let backend = printer::noop_backend();
            // An empty configured name means "let the backend pick"; fall back to the
            // host's default printer from `enumerate()` (§4.11 supplemental feature), the
            // way `printer_main.c` auto-selects a printer when none is named explicitly.
            let (name, driver_name) = if name.is_empty() {
                backend
                    .enumerate()
                    .into_iter()
                    .find(|printer| printer.default)
                    .map(|printer| (printer.name, printer.driver_name))
                    .unwrap_or((name, driver_name))
            } else {
                (name, driver_name)
            };
            let blob = printer::announce_blob(&driver_name, &name);
            let announce = DeviceAnnounceHeader::new(crate::pdu::efs::DeviceType::Print, id, &name, blob);
            let handler = printer::PrinterDevice::new(id, backend);
            let (tx, worker) = spawn_worker(handler);
            devman.register(id, announce, tx, worker);
        }
        DeviceConfig::Smartcard { name } => {
            let handler = smartcard::SmartcardDevice::new(id, reply_tx.clone());
            let announce = DeviceAnnounceHeader::new(crate::pdu::efs::DeviceType::Smartcard, id, &name, Vec::new());
            let (tx, worker) = spawn_worker(handler);
            devman.register(id, announce, tx, worker);
        }
        DeviceConfig::Serial { name, path } => {
            let handler = serial::SerialDevice::new(id, path, reply_tx.clone());
            let announce = DeviceAnnounceHeader::new(crate::pdu::efs::DeviceType::Serial, id, &name, Vec::new());
            let (tx, worker) = spawn_worker(handler);
            devman.register(id, announce, tx, worker);
        }
        DeviceConfig::Parallel { name, path } => {
            let handler = serial::ParallelDevice::new(id, path);
            let announce = DeviceAnnounceHeader::new(crate::pdu::efs::DeviceType::Parallel, id, &name, Vec::new());
            let (tx, worker) = spawn_worker(handler);
            devman.register(id, announce, tx, worker);
        }
    }
    id
}
