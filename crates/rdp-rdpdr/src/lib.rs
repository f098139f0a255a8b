#![doc = include_str!("../README.md")]

//! Device redirection ([MS-RDPEFS]) static virtual channel: capability negotiation, the
//! device manager (C8), per-device IRP worker threads (C9), and the drive / printer /
//! serial / parallel / smartcard device backends (C10-C13).
//!
//! [MS-RDPEFS]: https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpefs/34d9de58-b2b5-40b6-b970-f82d4603bdb5

#[macro_use]
extern crate tracing;

pub mod channel;
pub mod device;
pub mod devman;
mod error;
pub mod irp;
pub mod pdu;

pub use channel::RdpdrChannel;
pub use device::DeviceConfig;
pub use devman::DeviceManager;
pub use error::{RdpdrError, RdpdrErrorKind, RdpdrResult};
pub use irp::{Irp, IrpHandler};
