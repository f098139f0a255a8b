//! Per-device IRP worker task (C9, §4.9): a lock-free MPSC queue feeding a single
//! dispatch loop, plus the `complete`/`discard` contract that guarantees each [`Irp`]
//! yields exactly one outcome.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::pdu::efs::{DeviceIoRequestHeader, MajorFunction};
use crate::pdu::RdpdrPdu;

/// One dispatched I/O request, borrowed from the channel frame that carried it.
///
/// `complete`/`discard` take `self` by value: the Rust type system enforces the "exactly
/// one of complete or discard" invariant at compile time rather than at runtime.
pub struct Irp {
    pub device_id: u32,
    pub file_id: u32,
    pub completion_id: u32,
    pub major_function: MajorFunction,
    pub minor_function: u32,
    pub payload: Vec<u8>,
    reply_tx: mpsc::UnboundedSender<RdpdrPdu>,
}

impl Irp {
    pub fn new(header: DeviceIoRequestHeader, payload: Vec<u8>, reply_tx: mpsc::UnboundedSender<RdpdrPdu>) -> Self {
        Self {
            device_id: header.device_id,
            file_id: header.file_id,
            completion_id: header.completion_id,
            major_function: header.major_function,
            minor_function: header.minor_function,
            payload,
            reply_tx,
        }
    }

    /// Delivers the reply PDU to the channel core for transmission.
    pub fn complete(self, pdu: RdpdrPdu) {
        // The channel's outbound task may already be gone if the session is tearing down;
        // there is nowhere useful to report that, so it is silently dropped.
        let _ = self.reply_tx.send(pdu);
    }

    /// Drops the IRP without sending a reply: used only for the smartcard duplicate
    /// `completion_id` workaround (§4.13).
    pub fn discard(self) {}

    /// Clones the sender half so async handlers can move the IRP into a spawned task while
    /// still being able to build further replies against the same channel.
    pub fn reply_sender(&self) -> mpsc::UnboundedSender<RdpdrPdu> {
        self.reply_tx.clone()
    }
}

/// A type that can dispatch IRPs; implemented by every device kind (§4.10-§4.13).
pub trait IrpHandler: Send + Sync + 'static {
    fn handle(&self, irp: Irp);
}

/// Spawns the per-device worker task described in §4.9: pop queued IRPs and dispatch them
/// to the device until the sender side is dropped (device torn down).
pub fn spawn_worker<H>(handler: H) -> (mpsc::UnboundedSender<Irp>, JoinHandle<()>)
where
    H: IrpHandler,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Irp>();
    let join = tokio::spawn(async move {
        while let Some(irp) = rx.recv().await {
            handler.handle(irp);
        }
    });
    (tx, join)
}
