//! Top-level error type for the gateway transport (C3–C7, §4.3–§4.7).
//!
//! Mirrors `rdp_rdpdr::error::RdpdrError`: codec functions return
//! [`rdpcore_core::DecodeResult`]/[`rdpcore_core::EncodeResult`] directly, and everything
//! above the codec layer collapses into [`GatewayResult`].

use std::fmt;
use std::io;

use rdpcore_core::{DecodeError, EncodeError};

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug)]
pub struct GatewayError {
    context: &'static str,
    kind: GatewayErrorKind,
}

#[derive(Debug)]
#[non_exhaustive]
pub enum GatewayErrorKind {
    /// A PDU failed to decode or encode.
    Codec(String),
    /// A PDU was received that is not legal in the channel's/tunnel's current state
    /// (§8 Testable properties, "state-machine totality").
    Protocol { state: &'static str, ptype: &'static str },
    /// NTLM negotiation failed, or a message signature did not verify.
    AuthFailed(String),
    /// The server reported a `PTYPE_FAULT` for an outstanding call (§4.6 "Inbound").
    Fault(u32),
    /// The HTTP layer received a non-200 status, or the gateway closed a tunnel.
    Transport(io::Error),
    /// The stream pool or a fixed-size buffer could not satisfy an allocation.
    OutOfMemory,
    /// Generic failure with a static description.
    Other(&'static str),
}

impl GatewayError {
    #[must_use]
    pub fn new(context: &'static str, kind: GatewayErrorKind) -> Self {
        Self { context, kind }
    }

    #[must_use]
    pub fn protocol(context: &'static str, state: &'static str, ptype: &'static str) -> Self {
        Self::new(context, GatewayErrorKind::Protocol { state, ptype })
    }

    #[must_use]
    pub fn auth_failed(context: &'static str, reason: impl Into<String>) -> Self {
        Self::new(context, GatewayErrorKind::AuthFailed(reason.into()))
    }

    #[must_use]
    pub fn fault(context: &'static str, status: u32) -> Self {
        Self::new(context, GatewayErrorKind::Fault(status))
    }

    #[must_use]
    pub fn other(context: &'static str, reason: &'static str) -> Self {
        Self::new(context, GatewayErrorKind::Other(reason))
    }

    #[must_use]
    pub fn kind(&self) -> &GatewayErrorKind {
        &self.kind
    }

    #[must_use]
    pub fn context(&self) -> &'static str {
        self.context
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.context, self.kind)
    }
}

impl fmt::Display for GatewayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(msg) => write!(f, "codec error: {msg}"),
            Self::Protocol { state, ptype } => write!(f, "unexpected PDU {ptype} in state {state}"),
            Self::AuthFailed(reason) => write!(f, "credentials rejected by gateway: {reason}"),
            Self::Fault(status) => write!(f, "RPC fault: status=0x{status:08X}"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
            Self::OutOfMemory => write!(f, "allocation failed"),
            Self::Other(reason) => write!(f, "{reason}"),
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            GatewayErrorKind::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DecodeError> for GatewayError {
    fn from(err: DecodeError) -> Self {
        Self::new("gateway::decode", GatewayErrorKind::Codec(err.to_string()))
    }
}

impl From<EncodeError> for GatewayError {
    fn from(err: EncodeError) -> Self {
        Self::new("gateway::encode", GatewayErrorKind::Codec(err.to_string()))
    }
}

impl From<io::Error> for GatewayError {
    fn from(err: io::Error) -> Self {
        Self::new("gateway::io", GatewayErrorKind::Transport(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context_and_state() {
        let err = GatewayError::protocol("rpc_client::dispatch", "ContextNegotiated", "PTYPE_BIND_NAK");
        let rendered = err.to_string();
        assert!(rendered.contains("ContextNegotiated"));
        assert!(rendered.contains("PTYPE_BIND_NAK"));
    }
}
