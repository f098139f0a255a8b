#![doc = include_str!("../README.md")]

#[macro_use]
extern crate tracing;

pub mod channel;
pub mod config;
mod error;
pub mod http;
pub mod ntlm;
pub mod pdu;
pub mod rpc_client;
pub mod tsg;

pub use config::{Credentials, GatewayConfig, Proxy};
pub use error::{GatewayError, GatewayErrorKind, GatewayResult};
pub use rpc_client::{CallOutcome, RpcClient};
pub use tsg::{GatewayStream, Tsg, TsgPipe, TunnelState};
