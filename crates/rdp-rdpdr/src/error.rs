//! Top-level error type for the RDPDR channel runtime.
//!
//! PDU codec functions return [`rdpcore_core::DecodeResult`]/[`rdpcore_core::EncodeResult`]
//! directly, as required by the `Decode`/`Encode` trait signatures. Everything above the
//! codec layer (device handlers, the IRP engine, the channel state machine) returns
//! [`RdpdrResult`], which can be built from a codec error, an NTSTATUS mapping failure, or
//! a host I/O error.

use std::fmt;
use std::io;

use rdpcore_core::{DecodeError, EncodeError};

pub type RdpdrResult<T> = Result<T, RdpdrError>;

#[derive(Debug)]
pub struct RdpdrError {
    context: &'static str,
    kind: RdpdrErrorKind,
}

#[derive(Debug)]
#[non_exhaustive]
pub enum RdpdrErrorKind {
    /// A PDU failed to decode or encode.
    Codec(String),
    /// The channel received a PDU that is not legal in its current state.
    Protocol(&'static str),
    /// A device-level I/O error that could not be mapped (should not happen: device
    /// handlers are expected to map every `io::Error` to an NTSTATUS before this point).
    Io(io::Error),
    /// Generic failure with a static description.
    Other(&'static str),
}

impl RdpdrError {
    #[must_use]
    pub fn new(context: &'static str, kind: RdpdrErrorKind) -> Self {
        Self { context, kind }
    }

    #[must_use]
    pub fn protocol(context: &'static str, reason: &'static str) -> Self {
        Self::new(context, RdpdrErrorKind::Protocol(reason))
    }

    #[must_use]
    pub fn other(context: &'static str, reason: &'static str) -> Self {
        Self::new(context, RdpdrErrorKind::Other(reason))
    }

    #[must_use]
    pub fn kind(&self) -> &RdpdrErrorKind {
        &self.kind
    }
}

impl fmt::Display for RdpdrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.context, self.kind)
    }
}

impl fmt::Display for RdpdrErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(msg) => write!(f, "codec error: {msg}"),
            Self::Protocol(reason) => write!(f, "protocol error: {reason}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Other(reason) => write!(f, "{reason}"),
        }
    }
}

impl std::error::Error for RdpdrError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RdpdrErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DecodeError> for RdpdrError {
    fn from(err: DecodeError) -> Self {
        Self::new("rdpdr::decode", RdpdrErrorKind::Codec(err.to_string()))
    }
}

impl From<EncodeError> for RdpdrError {
    fn from(err: EncodeError) -> Self {
        Self::new("rdpdr::encode", RdpdrErrorKind::Codec(err.to_string()))
    }
}
