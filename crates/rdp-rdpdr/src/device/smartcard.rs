//! Smartcard device (C13, §4.13): every call rides inside a `DEVICE_CONTROL` IRP as an
//! [MS-RDPESC] function wrapped in the [MS-RPCE] NDR envelope from [`crate::pdu::rpce`].
//!
//! `GetStatusChange`, `Transmit` and `Status` can block for an arbitrary amount of time
//! against real hardware, so they run on their own spawned task instead of the device's
//! single worker thread; every other call is answered inline. Windows occasionally
//! retransmits a `GetStatusChange` request with the same `CompletionId` while the original
//! is still outstanding (used as an implicit cancel-by-resend). Per §4.13, the *older*
//! outstanding entry is the one flagged duplicate and its eventual response is the one
//! dropped via [`Irp::discard`]; the new, retransmitted request is dispatched and answered
//! normally.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Notify};
use std::time::Duration;

use rdpcore_core::{ReadCursor, WriteCursor};

use crate::irp::{Irp, IrpHandler};
use crate::pdu::drive_io::DeviceControlRequest;
use crate::pdu::efs::{status, DeviceCloseResponse, DeviceControlResponse, DeviceCreateResponse, IoCompletionHeader, MajorFunction};
use crate::pdu::esc::{
    ConnectCall, ConnectReturn, ContextCall, ControlCall, ControlReturn, EstablishContextCall, EstablishContextReturn, GetAttribCall,
    GetAttribReturn, GetDeviceTypeIdCall, GetDeviceTypeIdReturn, GetStatusChangeCall, GetStatusChangeReturn, HCardAndDispositionCall,
    ListReadersCall, ListReadersReturn, ReadCacheCall, ReadCacheReturn, ReaderStateCommon, ScardCall, ScardContext, ScardHandle,
    ScardIoCtlCode, StatusCall, StatusReturn, TransmitCall, TransmitReturn, WriteCacheCall, WriteCacheReturn,
};
use crate::pdu::rpce::{HeaderlessEncode, RpcePdu};
use crate::pdu::RdpdrPdu;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
const INFINITE: u32 = 0xFFFF_FFFF;

/// What a smartcard device needs from the host PC/SC stack. Hooking up a real reader
/// (pcsc-lite or winscard) is out of scope; [`NoopBackend`] stands in as a reader-less
/// default that answers every query as "no card, no readers present".
pub trait ScardBackend: Send + Sync {
    fn establish_context(&self) -> io::Result<ScardContext>;
    fn list_readers(&self, context: ScardContext) -> io::Result<Vec<String>>;
    /// Polls for a change against the caller-supplied reader states; never blocks. The
    /// caller is responsible for waiting out the timeout or an abort between polls.
    fn poll_status_change(&self, context: ScardContext, states: &[(String, ReaderStateCommon)]) -> Vec<ReaderStateCommon>;
    fn connect(&self, call: &ConnectCall) -> io::Result<ConnectReturn>;
    fn reconnect(&self, handle: ScardHandle, disposition: u32) -> io::Result<u32>;
    fn disconnect(&self, handle: ScardHandle, disposition: u32) -> io::Result<()>;
    fn begin_transaction(&self, handle: ScardHandle) -> io::Result<()>;
    fn end_transaction(&self, handle: ScardHandle, disposition: u32) -> io::Result<()>;
    fn status(&self, handle: ScardHandle) -> io::Result<StatusReturn>;
    fn transmit(&self, call: &TransmitCall) -> io::Result<Vec<u8>>;
    fn control(&self, call: &ControlCall) -> io::Result<Vec<u8>>;
    fn get_attrib(&self, handle: ScardHandle, attrib_id: u32) -> io::Result<Vec<u8>>;
    fn get_device_type_id(&self, context: ScardContext, reader_name: &str) -> io::Result<u32>;
    fn read_cache(&self, call: &ReadCacheCall) -> io::Result<Vec<u8>>;
    fn write_cache(&self, call: &WriteCacheCall) -> io::Result<()>;
}

fn no_reader() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "no smartcard reader present")
}

/// Reader-less backend: contexts are granted freely, but anything that needs an actual
/// card or reader fails with `NotFound` (mapped to `STATUS_NO_SUCH_FILE`).
struct NoopBackend {
    next_context: AtomicU32,
}

impl ScardBackend for NoopBackend {
    fn establish_context(&self) -> io::Result<ScardContext> {
        Ok(ScardContext::new(self.next_context.fetch_add(1, Ordering::Relaxed)))
    }

    fn list_readers(&self, _context: ScardContext) -> io::Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn poll_status_change(&self, _context: ScardContext, states: &[(String, ReaderStateCommon)]) -> Vec<ReaderStateCommon> {
        states.iter().map(|(_, common)| common.clone()).collect()
    }

    fn connect(&self, _call: &ConnectCall) -> io::Result<ConnectReturn> {
        Err(no_reader())
    }

    fn reconnect(&self, _handle: ScardHandle, _disposition: u32) -> io::Result<u32> {
        Err(no_reader())
    }

    fn disconnect(&self, _handle: ScardHandle, _disposition: u32) -> io::Result<()> {
        Ok(())
    }

    fn begin_transaction(&self, _handle: ScardHandle) -> io::Result<()> {
        Err(no_reader())
    }

    fn end_transaction(&self, _handle: ScardHandle, _disposition: u32) -> io::Result<()> {
        Err(no_reader())
    }

    fn status(&self, _handle: ScardHandle) -> io::Result<StatusReturn> {
        Err(no_reader())
    }

    fn transmit(&self, _call: &TransmitCall) -> io::Result<Vec<u8>> {
        Err(no_reader())
    }

    fn control(&self, _call: &ControlCall) -> io::Result<Vec<u8>> {
        Err(no_reader())
    }

    fn get_attrib(&self, _handle: ScardHandle, _attrib_id: u32) -> io::Result<Vec<u8>> {
        Err(no_reader())
    }

    fn get_device_type_id(&self, _context: ScardContext, _reader_name: &str) -> io::Result<u32> {
        Ok(0)
    }

    fn read_cache(&self, _call: &ReadCacheCall) -> io::Result<Vec<u8>> {
        Err(no_reader())
    }

    fn write_cache(&self, _call: &WriteCacheCall) -> io::Result<()> {
        Ok(())
    }
}

pub fn noop_backend() -> Arc<dyn ScardBackend> {
    Arc::new(NoopBackend {
        next_context: AtomicU32::new(1),
    })
}

/// Signals an outstanding `GetStatusChange` to stop waiting, either because its
/// `CompletionId` was cancelled via an explicit `Cancel` call or the device is closing.
#[derive(Clone)]
struct CancelToken {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        self.notify.notified().await;
    }
}

/// One blocking call currently running on its own task, tracked so a retransmitted
/// duplicate `CompletionId` can mark this (older) entry for response suppression (§4.13).
struct OutstandingCall {
    completion_id: u32,
    /// Set on this entry by a *later* dispatch sharing its `completion_id`; checked by this
    /// entry's own task when it finishes, to decide whether to discard instead of complete.
    duplicate: Arc<std::sync::atomic::AtomicBool>,
}

pub struct SmartcardDevice {
    id: u32,
    backend: Arc<dyn ScardBackend>,
    /// Blocking calls currently running on their own task, so a retransmitted duplicate
    /// `completion_id` can be detected and the *older* call's response suppressed (§4.13).
    outstanding: Arc<Mutex<Vec<OutstandingCall>>>,
    /// Cancel tokens for in-flight `GetStatusChange` calls, keyed by context value so an
    /// incoming `Cancel` call can find and wake the matching waiter.
    cancels: Arc<Mutex<HashMap<u32, CancelToken>>>,
    next_file_id: AtomicU32,
}

impl SmartcardDevice {
    pub fn new(id: u32, _reply_tx: tokio::sync::mpsc::UnboundedSender<RdpdrPdu>) -> Self {
        Self {
            id,
            backend: noop_backend(),
            outstanding: Arc::new(Mutex::new(Vec::new())),
            cancels: Arc::new(Mutex::new(HashMap::new())),
            next_file_id: AtomicU32::new(1),
        }
    }

    pub fn with_backend(id: u32, backend: Arc<dyn ScardBackend>) -> Self {
        Self {
            id,
            backend,
            outstanding: Arc::new(Mutex::new(Vec::new())),
            cancels: Arc::new(Mutex::new(HashMap::new())),
            next_file_id: AtomicU32::new(1),
        }
    }

    fn completion(&self, irp: &Irp, io_status: u32) -> IoCompletionHeader {
        IoCompletionHeader::new(self.id, irp.completion_id, io_status)
    }

    fn reply_control(&self, irp: Irp, io_status: u32, output: Vec<u8>) {
        let completion = self.completion(&irp, io_status);
        irp.complete(RdpdrPdu::DeviceControlResponse(DeviceControlResponse { completion, output }));
    }

    fn handle_create(&self, irp: Irp) {
        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        let completion = self.completion(&irp, status::STATUS_SUCCESS);
        irp.complete(RdpdrPdu::DeviceCreateResponse(DeviceCreateResponse {
            completion,
            file_id,
            information: 0,
        }));
    }

    fn handle_close(&self, irp: Irp) {
        let completion = self.completion(&irp, status::STATUS_SUCCESS);
        irp.complete(RdpdrPdu::DeviceCloseResponse(DeviceCloseResponse { completion }));
    }

    fn handle_device_control(&self, irp: Irp) {
        let req = match rdpcore_core::decode::<DeviceControlRequest>(&irp.payload) {
            Ok(req) => req,
            Err(_) => return self.reply_control(irp, status::STATUS_UNSUCCESSFUL, Vec::new()),
        };
        let code = match ScardIoCtlCode::from_raw(req.io_control_code) {
            Ok(code) => code,
            Err(_) => return self.reply_control(irp, status::STATUS_UNSUCCESSFUL, Vec::new()),
        };
        let mut cursor = ReadCursor::new(&req.input_buffer);
        let call = match ScardCall::decode(code, &mut cursor) {
            Ok(call) => call,
            Err(_) => return self.reply_control(irp, status::STATUS_UNSUCCESSFUL, Vec::new()),
        };

        if call.is_blocking() {
            self.dispatch_blocking(irp, call);
        } else {
            let (io_status, output) = self.dispatch_inline(call);
            self.reply_control(irp, io_status, output);
        }
    }

    fn dispatch_inline(&self, call: ScardCall) -> (u32, Vec<u8>) {
        match call {
            ScardCall::AccessStartedEvent => (status::STATUS_SUCCESS, Vec::new()),
            ScardCall::EstablishContext(EstablishContextCall { .. }) => match self.backend.establish_context() {
                Ok(context) => ok(EstablishContextReturn { context }),
                Err(err) => err_status(&err),
            },
            ScardCall::ReleaseContext(ContextCall { .. }) => (status::STATUS_SUCCESS, Vec::new()),
            ScardCall::IsValidContext(ContextCall { .. }) => (status::STATUS_SUCCESS, Vec::new()),
            ScardCall::Cancel(ContextCall { context }) => {
                if let Some(token) = self.cancels.lock().expect("poisoned").get(&context.value) {
                    token.cancel();
                }
                (status::STATUS_SUCCESS, Vec::new())
            }
            ScardCall::Connect(call) => match self.backend.connect(&call) {
                Ok(ret) => ok(ret),
                Err(err) => err_status(&err),
            },
            ScardCall::Reconnect(HCardAndDispositionCall { handle, disposition }) => {
                match self.backend.reconnect(handle, disposition) {
                    Ok(active_protocol) => ok(ConnectReturn { handle, active_protocol }),
                    Err(err) => err_status(&err),
                }
            }
            ScardCall::Disconnect(HCardAndDispositionCall { handle, disposition }) => {
                match self.backend.disconnect(handle, disposition) {
                    Ok(()) => (status::STATUS_SUCCESS, Vec::new()),
                    Err(err) => err_status(&err),
                }
            }
            ScardCall::BeginTransaction(HCardAndDispositionCall { handle, .. }) => match self.backend.begin_transaction(handle) {
                Ok(()) => (status::STATUS_SUCCESS, Vec::new()),
                Err(err) => err_status(&err),
            },
            ScardCall::EndTransaction(HCardAndDispositionCall { handle, disposition }) => {
                match self.backend.end_transaction(handle, disposition) {
                    Ok(()) => (status::STATUS_SUCCESS, Vec::new()),
                    Err(err) => err_status(&err),
                }
            }
            ScardCall::Control(call) => match self.backend.control(&call) {
                Ok(output) => ok(ControlReturn { output }),
                Err(err) => err_status(&err),
            },
            ScardCall::GetAttrib(GetAttribCall { handle, attrib_id, .. }) => match self.backend.get_attrib(handle, attrib_id) {
                Ok(attrib) => ok(GetAttribReturn { attrib }),
                Err(err) => err_status(&err),
            },
            ScardCall::GetDeviceTypeId(GetDeviceTypeIdCall { context, reader_name }) => {
                match self.backend.get_device_type_id(context, &reader_name) {
                    Ok(device_type_id) => ok(GetDeviceTypeIdReturn { device_type_id }),
                    Err(err) => err_status(&err),
                }
            }
            ScardCall::ReadCache(call) => match self.backend.read_cache(&call) {
                Ok(data) => ok(ReadCacheReturn { data }),
                Err(err) => err_status(&err),
            },
            ScardCall::WriteCache(call) => match self.backend.write_cache(&call) {
                Ok(()) => ok(WriteCacheReturn),
                Err(err) => err_status(&err),
            },
            // ListReaders rides the non-blocking path even though it can touch real hardware
            // briefly; FreeRDP dispatches it inline as well.
            ScardCall::ListReaders(call) => match self.backend.list_readers(call.context) {
                Ok(readers) => ok(ListReadersReturn { readers }),
                Err(err) => err_status(&err),
            },
            ScardCall::GetStatusChange(_) | ScardCall::Transmit(_) | ScardCall::Status(_) => {
                unreachable!("blocking calls are routed through dispatch_blocking")
            }
        }
    }

    fn dispatch_blocking(&self, irp: Irp, call: ScardCall) {
        let completion_id = irp.completion_id;
        let duplicate = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let mut outstanding = self.outstanding.lock().expect("poisoned");
            // A client reusing `completion_id` while the earlier call is still running is
            // treated as an implicit cancel-by-resend: the *older* entry is the one marked
            // duplicate (its response gets suppressed below), while this new request is
            // dispatched and answered normally.
            for entry in outstanding.iter() {
                if entry.completion_id == completion_id {
                    entry.duplicate.store(true, Ordering::SeqCst);
                }
            }
            outstanding.push(OutstandingCall {
                completion_id,
                duplicate: duplicate.clone(),
            });
        }

        let backend = self.backend.clone();
        let outstanding = self.outstanding.clone();
        let cancels = self.cancels.clone();
        let device_id = self.id;

        tokio::spawn(async move {
            let (io_status, output) = match call {
                ScardCall::GetStatusChange(req) => run_get_status_change(&backend, &cancels, req).await,
                ScardCall::Transmit(req) => match backend.transmit(&req) {
                    Ok(recv_buffer) => ok(TransmitReturn { recv_buffer }),
                    Err(err) => err_status(&err),
                },
                ScardCall::Status(StatusCall { handle, .. }) => match backend.status(handle) {
                    Ok(ret) => ok(ret),
                    Err(err) => err_status(&err),
                },
                _ => unreachable!("only GetStatusChange/Transmit/Status are dispatched here"),
            };

            {
                let mut outstanding = outstanding.lock().expect("poisoned");
                if let Some(pos) = outstanding
                    .iter()
                    .position(|entry| entry.completion_id == completion_id && Arc::ptr_eq(&entry.duplicate, &duplicate))
                {
                    outstanding.remove(pos);
                }
            }

            if duplicate.load(Ordering::SeqCst) {
                trace!(device_id, completion_id, "discarding response for duplicate-flagged CompletionId");
                irp.discard();
                return;
            }

            let completion = IoCompletionHeader::new(device_id, completion_id, io_status);
            irp.complete(RdpdrPdu::DeviceControlResponse(DeviceControlResponse { completion, output }));
        });
    }
}

async fn run_get_status_change(
    backend: &Arc<dyn ScardBackend>,
    cancels: &Arc<Mutex<HashMap<u32, CancelToken>>>,
    req: GetStatusChangeCall,
) -> (u32, Vec<u8>) {
    let token = CancelToken::new();
    cancels.lock().expect("poisoned").insert(req.context.value, token.clone());

    let timeout = if req.timeout == INFINITE {
        DEFAULT_TIMEOUT
    } else {
        Duration::from_millis(req.timeout as u64).min(DEFAULT_TIMEOUT)
    };

    tokio::select! {
        _ = token.wait() => {}
        _ = tokio::time::sleep(timeout) => {}
    }
    cancels.lock().expect("poisoned").remove(&req.context.value);

    let states = backend.poll_status_change(req.context, &req.states);
    ok(GetStatusChangeReturn { states })
}

fn ok(value: impl HeaderlessEncode) -> (u32, Vec<u8>) {
    let pdu = RpcePdu(value);
    let mut buf = vec![0u8; pdu.size()];
    let mut cursor = WriteCursor::new(&mut buf);
    match pdu.encode(&mut cursor) {
        Ok(()) => (status::STATUS_SUCCESS, buf),
        Err(_) => (status::STATUS_UNSUCCESSFUL, Vec::new()),
    }
}

fn err_status(err: &io::Error) -> (u32, Vec<u8>) {
    (status::from_io_error(err), Vec::new())
}

impl IrpHandler for SmartcardDevice {
    fn handle(&self, irp: Irp) {
        match irp.major_function {
            MajorFunction::Create => self.handle_create(irp),
            MajorFunction::Close | MajorFunction::Cleanup => self.handle_close(irp),
            MajorFunction::DeviceControl => self.handle_device_control(irp),
            _ => {
                let completion = self.completion(&irp, status::STATUS_SUCCESS);
                irp.complete(RdpdrPdu::DeviceControlResponse(DeviceControlResponse { completion, output: Vec::new() }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_backend_grants_contexts_but_refuses_connect() {
        let backend = noop_backend();
        let ctx = backend.establish_context().unwrap();
        assert!(backend.list_readers(ctx).unwrap().is_empty());
    }

    #[test]
    fn cancel_token_wait_returns_immediately_once_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn create_then_device_control_round_trips_establish_context() {
        let device = SmartcardDevice::new(1, tokio::sync::mpsc::unbounded_channel().0);
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

    #[tokio::test]
    async fn retransmitted_completion_id_suppresses_the_older_response() {
        let device = SmartcardDevice::new(1, tokio::sync::mpsc::unbounded_channel().0);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = ScardHandle {
            context: ScardContext { value: 1 },
            value: 7,
        };

        let header = crate::pdu::efs::DeviceIoRequestHeader {
            device_id: 1,
            file_id: 0,
            completion_id: 42,
            major_function: MajorFunction::DeviceControl,
            minor_function: 0,
        };
        // Dispatch the original call, then a retransmit sharing the same CompletionId while
        // the first is still outstanding.
        device.dispatch_blocking(Irp::new(header, Vec::new(), tx.clone()), ScardCall::Status(StatusCall { handle, wide: false }));
        device.dispatch_blocking(
            Irp::new(header, Vec::new(), tx.clone()),
            ScardCall::Status(StatusCall { handle, wide: false }),
        );

        let first = rx.recv().await.unwrap();
        let RdpdrPdu::DeviceControlResponse(resp) = first else {
            panic!("expected device control response");
        };
        assert_eq!(resp.completion.completion_id, 42);

        // The older, duplicate-flagged call's response was discarded, not sent: only the
        // retransmit's reply reaches the channel for the shared CompletionId.
        let second = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(second.is_err(), "no second response should ever be sent for the suppressed duplicate");
        assert!(device.outstanding.lock().unwrap().is_empty());
    }
}
