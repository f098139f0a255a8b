//! RDPDR channel core (C14, §4.14): the top-level handshake state machine, device
//! announce/remove bookkeeping, IRP demultiplexing, and the drive hotplug poller.
//!
//! Chunking of virtual-channel frames (`CHANNEL_FLAG_FIRST`/`LAST`, `SUSPEND`/`RESUME`) is
//! handled generically by [`rdpcore_svc::StaticVirtualChannelProcessor`]'s contract before
//! [`RdpdrChannel::process`] ever sees a payload, so this module only deals in complete
//! RDPDR PDUs.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use rdpcore_svc::{impl_as_any, ChannelName, ChannelResult, CompressionCondition, StaticVirtualChannelProcessor, SvcMessage};

use crate::device::{self, DeviceConfig};
use crate::devman::DeviceManager;
use crate::irp::Irp;
use crate::pdu::caps::{
    CapabilitySet, CoreCapability, CoreCapabilityKind, ExtendedPdu, ExtraFlags1, GeneralCapabilitySet, GeneralIoCode1,
};
use crate::pdu::efs::{status, ClientDeviceListAnnounce, ClientNameRequest, DeviceAnnounceHeader, DeviceListRemove, DeviceType, VersionAndIdPdu, VersionAndIdPduKind};
use crate::pdu::RdpdrPdu;

const CHANNEL_NAME: ChannelName = ChannelName::from_static(b"rdpdr\0\0\0");

/// Whitelisted mount bases under which a hotplugged filesystem is offered as a drive
/// device (§4.14 Hotplug); re-exported from [`crate::device::drive`] so both modules agree.
pub use crate::device::drive::AUTOMOUNT_ROOTS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    NameSent,
    CapsSent,
    Ready { user_logged_on: bool },
}

/// Top-level RDPDR static virtual channel.
///
/// Owns the device manager and a channel shared with every device worker and the hotplug
/// task: async completions and hotplug announces are queued on it and drained at the top
/// of every [`process`](StaticVirtualChannelProcessor::process) call, since that method's
/// synchronous `&mut self -> Vec<SvcMessage>` signature has no other way to push traffic
/// the server didn't just prompt.
pub struct RdpdrChannel {
    state: State,
    devman: Arc<DeviceManager>,
    reply_tx: UnboundedSender<RdpdrPdu>,
    reply_rx: UnboundedReceiver<RdpdrPdu>,
    /// Devices announced immediately (smartcards); everything else waits for `UserLoggedOn`.
    smartcard_ids: Vec<u32>,
    pending_ids: Vec<u32>,
    ignore_invalid_devices: bool,
    computer_name: String,
    hotplug: Option<JoinHandle<()>>,
    /// Negotiated GENERAL capability bitmasks (§4.2), filled in once the server's
    /// `ServerCoreCapabilityRequest` is decoded; `None` until then.
    negotiated_io_code_1: Option<GeneralIoCode1>,
    negotiated_extended_pdu: Option<ExtendedPdu>,
}

impl RdpdrChannel {
    /// Builds the channel, loads the statically configured devices, and optionally spawns
    /// the hotplug poller (§4.14).
    pub fn new(configs: Vec<DeviceConfig>, computer_name: String, ignore_invalid_devices: bool, automount: bool) -> Self {
        let devman = Arc::new(DeviceManager::new());
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        let mut smartcard_ids = Vec::new();
        let mut pending_ids = Vec::new();
        for config in configs {
            let is_smartcard = matches!(config, DeviceConfig::Smartcard { .. });
            let id = device::load(&devman, config, reply_tx.clone());
            if is_smartcard {
                smartcard_ids.push(id);
            } else {
                pending_ids.push(id);
            }
        }

        let hotplug = automount.then(|| spawn_hotplug(devman.clone(), reply_tx.clone()));

        Self {
            state: State::Initial,
            devman,
            reply_tx,
            reply_rx,
            smartcard_ids,
            pending_ids,
            ignore_invalid_devices,
            computer_name,
            hotplug,
            negotiated_io_code_1: None,
            negotiated_extended_pdu: None,
        }
    }

    /// Whether the server's advertised GENERAL capability set includes
    /// `RDPDR_DEVICE_REMOVE_PDUS`, gating client-initiated [`Self::remove_devices`] (§4.14).
    fn server_supports_device_remove(&self) -> bool {
        self.negotiated_extended_pdu
            .is_some_and(|flags| flags.contains(ExtendedPdu::RDPDR_DEVICE_REMOVE_PDUS))
    }

    fn drain_async_replies(&mut self, out: &mut Vec<SvcMessage>) {
        while let Ok(pdu) = self.reply_rx.try_recv() {
            out.push(pdu.into());
        }
    }

    fn our_capabilities() -> Vec<CapabilitySet> {
        let general = GeneralCapabilitySet {
            os_type: 0,
            os_version: 0,
            protocol_major_version: VersionAndIdPdu::CLIENT_VERSION_MAJOR,
            protocol_minor_version: VersionAndIdPdu::CLIENT_VERSION_MINOR,
            io_code_1: GeneralIoCode1::RDPDR_IRP_MJ_CREATE
                | GeneralIoCode1::RDPDR_IRP_MJ_CLEANUP
                | GeneralIoCode1::RDPDR_IRP_MJ_CLOSE
                | GeneralIoCode1::RDPDR_IRP_MJ_READ
                | GeneralIoCode1::RDPDR_IRP_MJ_WRITE
                | GeneralIoCode1::RDPDR_IRP_MJ_FLUSH_BUFFERS
                | GeneralIoCode1::RDPDR_IRP_MJ_SHUTDOWN
                | GeneralIoCode1::RDPDR_IRP_MJ_DEVICE_CONTROL
                | GeneralIoCode1::RDPDR_IRP_MJ_QUERY_VOLUME_INFORMATION
                | GeneralIoCode1::RDPDR_IRP_MJ_SET_VOLUME_INFORMATION
                | GeneralIoCode1::RDPDR_IRP_MJ_QUERY_INFORMATION
                | GeneralIoCode1::RDPDR_IRP_MJ_SET_INFORMATION
                | GeneralIoCode1::RDPDR_IRP_MJ_DIRECTORY_CONTROL
                | GeneralIoCode1::RDPDR_IRP_MJ_LOCK_CONTROL,
            io_code_2: 0,
            extended_pdu: ExtendedPdu::RDPDR_DEVICE_REMOVE_PDUS | ExtendedPdu::RDPDR_CLIENT_DISPLAY_NAME_PDU | ExtendedPdu::RDPDR_USER_LOGGEDON_PDU,
            extra_flags_1: ExtraFlags1::ENABLE_ASYNCIO,
            extra_flags_2: 0,
            special_type_device_cap: None,
        };
        vec![
            CapabilitySet::General(general),
            CapabilitySet::Printer,
            CapabilitySet::Port,
            CapabilitySet::Drive,
            CapabilitySet::Smartcard,
        ]
    }

    fn announce(&self, ids: &[u32]) -> Option<RdpdrPdu> {
        if ids.is_empty() {
            return None;
        }
        let devices = ids
            .iter()
            .filter_map(|id| self.devman.get(*id))
            .map(|entry| entry.announce.clone())
            .collect::<Vec<_>>();
        Some(RdpdrPdu::ClientDeviceListAnnounce(ClientDeviceListAnnounce::new(devices)))
    }

    fn handle_pdu(&mut self, pdu: RdpdrPdu, out: &mut Vec<SvcMessage>) -> ChannelResult<()> {
        match (self.state, pdu) {
            (State::Initial, RdpdrPdu::VersionAndId(req)) if req.kind == VersionAndIdPduKind::ServerAnnounceRequest => {
                out.push(VersionAndIdPdu::new_client_announce_reply(req.client_id).into());
                out.push(RdpdrPdu::ClientNameRequest(ClientNameRequest::new(self.computer_name.clone())).into());
                self.state = State::NameSent;
            }
            (State::NameSent, RdpdrPdu::CoreCapability(caps)) if caps.kind == CoreCapabilityKind::ServerCoreCapabilityRequest => {
                if let Some(CapabilitySet::General(general)) = caps.capabilities.iter().find_map(|cap| match cap {
                    CapabilitySet::General(set) => Some(CapabilitySet::General(*set)),
                    _ => None,
                }) {
                    self.negotiated_io_code_1 = Some(general.io_code_1);
                    self.negotiated_extended_pdu = Some(general.extended_pdu);
                }
                let response = CoreCapability::new(Self::our_capabilities(), CoreCapabilityKind::ClientCoreCapabilityResponse);
                out.push(RdpdrPdu::CoreCapability(response).into());
                self.state = State::CapsSent;
            }
            (State::CapsSent, RdpdrPdu::VersionAndId(req)) if req.kind == VersionAndIdPduKind::ServerClientIdConfirm => {
                if let Some(pdu) = self.announce(&self.smartcard_ids.clone()) {
                    out.push(pdu.into());
                }
                self.state = State::Ready { user_logged_on: false };
            }
            (State::Ready { user_logged_on: false }, RdpdrPdu::UserLoggedOn(_)) => {
                if let Some(pdu) = self.announce(&self.pending_ids.clone()) {
                    out.push(pdu.into());
                }
                self.state = State::Ready { user_logged_on: true };
            }
            (State::Ready { .. }, RdpdrPdu::DeviceIoRequest(req)) => self.dispatch_irp(req, out),
            (State::Ready { .. }, RdpdrPdu::ServerDeviceAnnounceResponse(resp)) => {
                if resp.result_code != status::STATUS_SUCCESS {
                    warn!(device_id = resp.device_id, result_code = resp.result_code, "server rejected device announce");
                    self.devman.remove(resp.device_id);
                }
            }
            (State::Ready { .. }, RdpdrPdu::Unimplemented) => {}
            (state, pdu) => {
                warn!(?state, pdu = ?pdu, "unexpected RDPDR PDU for current state, ignoring");
            }
        }
        Ok(())
    }

    fn dispatch_irp(&self, req: crate::pdu::efs::DeviceIoRequest, out: &mut Vec<SvcMessage>) {
        let header = req.header;
        match self.devman.get(header.device_id) {
            Some(entry) => {
                let irp = Irp::new(header, req.payload, self.reply_tx.clone());
                if entry.irp_tx.send(irp).is_err() {
                    warn!(device_id = header.device_id, "device worker gone, dropping IRP");
                }
            }
            None if self.ignore_invalid_devices => {
                trace!(device_id = header.device_id, "IRP for unknown device, synthesizing failure completion");
                let completion = crate::pdu::efs::IoCompletionHeader::new(header.device_id, header.completion_id, status::STATUS_UNSUCCESSFUL);
                out.push(RdpdrPdu::DeviceIoResponse(crate::pdu::efs::DeviceIoResponse::new(completion, Vec::new())).into());
            }
            None => {
                warn!(device_id = header.device_id, "IRP for unknown device, dropped (ignore_invalid_devices is false)");
            }
        }
    }

    /// Emits `DeviceListRemove` for client-initiated removal (e.g. a host-driven hot-unplug
    /// outside the hotplug poller); dropped silently if the server never advertised
    /// `RDPDR_DEVICE_REMOVE_PDUS` in its GENERAL capability set (§4.14).
    pub fn remove_devices(&mut self, ids: Vec<u32>, out: &mut Vec<SvcMessage>) {
        if !self.server_supports_device_remove() || ids.is_empty() {
            return;
        }
        for id in &ids {
            self.devman.remove(*id);
        }
        out.push(RdpdrPdu::DeviceListRemove(DeviceListRemove::new(ids)).into());
    }
}

impl Drop for RdpdrChannel {
    fn drop(&mut self) {
        if let Some(hotplug) = self.hotplug.take() {
            hotplug.abort();
        }
    }
}

impl fmt::Debug for RdpdrChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdpdrChannel")
            .field("state", &self.state)
            .field("device_count", &self.devman.len())
            .finish()
    }
}

impl_as_any!(RdpdrChannel);

impl StaticVirtualChannelProcessor for RdpdrChannel {
    fn channel_name(&self) -> ChannelName {
        CHANNEL_NAME
    }

    fn compression_condition(&self) -> CompressionCondition {
        CompressionCondition::Never
    }

    fn process(&mut self, payload: &[u8]) -> ChannelResult<Vec<SvcMessage>> {
        let mut out = Vec::new();
        self.drain_async_replies(&mut out);

        let pdu = rdpcore_core::decode::<RdpdrPdu>(payload)?;
        debug!(pdu = ?pdu, state = ?self.state, "received RDPDR pdu");
        self.handle_pdu(pdu, &mut out)?;
        Ok(out)
    }
}

/// Polls `/proc/mounts` every second, registering a drive device for each newly seen
/// mount under [`AUTOMOUNT_ROOTS`] and removing it once the mount disappears (§4.14).
fn spawn_hotplug(devman: Arc<DeviceManager>, reply_tx: UnboundedSender<RdpdrPdu>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut known: HashMap<PathBuf, u32> = HashMap::new();
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let mounts = match read_mount_points() {
                Ok(mounts) => mounts,
                Err(err) => {
                    trace!(%err, "hotplug: could not read mount table, skipping tick");
                    continue;
                }
            };
            let candidates: Vec<PathBuf> = mounts.into_iter().filter(|p| is_automount_candidate(p)).collect();

            let removed: Vec<PathBuf> = known.keys().filter(|path| !candidates.contains(path)).cloned().collect();
            for path in removed {
                if let Some(id) = known.remove(&path) {
                    devman.remove(id);
                    let _ = reply_tx.send(RdpdrPdu::DeviceListRemove(DeviceListRemove::new(vec![id])));
                    debug!(?path, device_id = id, "hotplug: drive removed");
                }
            }

            for path in candidates {
                if known.contains_key(&path) {
                    continue;
                }
                let id = devman.reserve_id();
                let name = drive_name(&path);
                let handler = device::drive::DriveDevice::new(id, path.clone());
                let announce = DeviceAnnounceHeader::new(DeviceType::Filesystem, id, &name, Vec::new());
                let (tx, worker) = crate::irp::spawn_worker(handler);
                devman.register(id, announce.clone(), tx, worker);
                known.insert(path.clone(), id);
                let _ = reply_tx.send(RdpdrPdu::ClientDeviceListAnnounce(ClientDeviceListAnnounce::new(vec![announce])));
                debug!(?path, device_id = id, "hotplug: drive added");
            }
        }
    })
}

fn drive_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "drive".to_owned())
}

fn read_mount_points() -> std::io::Result<Vec<PathBuf>> {
    let contents = std::fs::read_to_string("/proc/mounts")?;
    Ok(contents
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(PathBuf::from)
        .collect())
}

/// At most one path segment below a whitelisted root (§4.14 Hotplug).
fn is_automount_candidate(path: &Path) -> bool {
    AUTOMOUNT_ROOTS.iter().any(|root| {
        let root = Path::new(root);
        match path.strip_prefix(root) {
            Ok(rest) => rest.components().count() <= 1 && rest.components().count() >= 1,
            Err(_) => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn automount_candidate_accepts_one_segment_below_root() {
        assert!(is_automount_candidate(Path::new("/media/usb1")));
        assert!(is_automount_candidate(Path::new("/run/user/1000")));
        assert!(!is_automount_candidate(Path::new("/media")));
        assert!(!is_automount_candidate(Path::new("/media/user/usb1")));
        assert!(!is_automount_candidate(Path::new("/home/user")));
    }

    #[tokio::test]
    async fn handshake_reaches_ready_after_announce_caps_and_id_confirm() {
        let mut channel = RdpdrChannel::new(Vec::new(), "workstation".to_owned(), true, false);

        let server_announce = VersionAndIdPdu {
            version_major: 1,
            version_minor: 12,
            client_id: 7,
            kind: VersionAndIdPduKind::ServerAnnounceRequest,
        };
        let mut out = Vec::new();
        channel.handle_pdu(RdpdrPdu::VersionAndId(server_announce), &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(channel.state, State::NameSent);

        let mut out = Vec::new();
        channel
            .handle_pdu(
                RdpdrPdu::CoreCapability(CoreCapability::new(Vec::new(), CoreCapabilityKind::ServerCoreCapabilityRequest)),
                &mut out,
            )
            .unwrap();
        assert_eq!(channel.state, State::CapsSent);

        let mut out = Vec::new();
        channel
            .handle_pdu(
                RdpdrPdu::VersionAndId(VersionAndIdPdu {
                    version_major: 1,
                    version_minor: 12,
                    client_id: 7,
                    kind: VersionAndIdPduKind::ServerClientIdConfirm,
                }),
                &mut out,
            )
            .unwrap();
        assert_eq!(channel.state, State::Ready { user_logged_on: false });
    }

    #[tokio::test]
    async fn core_capability_negotiation_persists_general_bitmasks() {
        let mut channel = RdpdrChannel::new(Vec::new(), "workstation".to_owned(), true, false);
        assert!(channel.negotiated_io_code_1.is_none());
        assert!(!channel.server_supports_device_remove());

        channel.state = State::NameSent;
        let server_general = GeneralCapabilitySet {
            os_type: 0,
            os_version: 0,
            protocol_major_version: 1,
            protocol_minor_version: 12,
            io_code_1: GeneralIoCode1::RDPDR_IRP_MJ_CREATE | GeneralIoCode1::RDPDR_IRP_MJ_READ,
            io_code_2: 0,
            extended_pdu: ExtendedPdu::RDPDR_DEVICE_REMOVE_PDUS | ExtendedPdu::RDPDR_USER_LOGGEDON_PDU,
            extra_flags_1: ExtraFlags1::ENABLE_ASYNCIO,
            extra_flags_2: 0,
            special_type_device_cap: None,
        };
        let mut out = Vec::new();
        channel
            .handle_pdu(
                RdpdrPdu::CoreCapability(CoreCapability::new(
                    vec![CapabilitySet::General(server_general)],
                    CoreCapabilityKind::ServerCoreCapabilityRequest,
                )),
                &mut out,
            )
            .unwrap();

        assert_eq!(channel.negotiated_io_code_1, Some(server_general.io_code_1));
        assert_eq!(channel.negotiated_extended_pdu, Some(server_general.extended_pdu));
        assert!(channel.server_supports_device_remove());
    }

    #[tokio::test]
    async fn remove_devices_is_dropped_unless_server_advertised_remove_pdus() {
        let mut channel = RdpdrChannel::new(Vec::new(), "workstation".to_owned(), true, false);

        let mut out = Vec::new();
        channel.remove_devices(vec![1], &mut out);
        assert!(out.is_empty(), "remove must be dropped before capability negotiation");

        channel.negotiated_extended_pdu = Some(ExtendedPdu::RDPDR_DEVICE_REMOVE_PDUS);
        let mut out = Vec::new();
        channel.remove_devices(vec![1], &mut out);
        assert_eq!(out.len(), 1);
    }
}
