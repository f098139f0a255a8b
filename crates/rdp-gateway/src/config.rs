//! Host-supplied configuration consumed by the gateway transport (§6 External interfaces).
//!
//! Plain data, constructed by the host and passed by value, matching
//! `GwConnectTarget` in `ironrdp-mstsgu`: no configuration file format is introduced here,
//! the host owns configuration sourcing.

use std::time::Duration;

/// Credentials presented to the gateway's NTLM authentication.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub domain: Option<String>,
}

/// An upstream HTTP(S) proxy the gateway connection is dialed through.
#[derive(Clone, Debug)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
}

/// Connection parameters for [`crate::tsg::Tsg::connect`].
#[derive(Clone)]
pub struct GatewayConfig {
    /// Gateway server hostname (used both for the TCP dial and the TLS SNI / HTTP `Host`).
    pub gateway_hostname: String,
    pub gateway_port: u16,
    pub proxy: Option<Proxy>,

    pub credentials: Credentials,

    /// Reported as the RDP client's hostname in the NTLM workstation field.
    pub client_hostname: String,

    /// Target RDP server the gateway should open a channel to.
    pub target_hostname: String,
    pub target_port: u16,

    /// RTS `ChannelLifetime`, default matches FreeRDP's `0x40000000` (~12 days in ms).
    pub channel_lifetime: u32,
    /// RTS `ReceiveWindowSize` advertised on the OUT channel.
    pub receive_window: u32,
    /// IN-channel RTS Ping cadence (`ClientKeepalive`), default 300_000 ms.
    pub keep_alive_interval: Duration,

    /// Overall handshake timeout (TLS + NTLM + RTS connection establishment + RPC bind +
    /// the five TSG opnums through `SetupReceivePipe`).
    pub connect_timeout: Duration,
}

impl GatewayConfig {
    pub const DEFAULT_RECEIVE_WINDOW: u32 = 0x0001_0000;
    pub const DEFAULT_CHANNEL_LIFETIME: u32 = 0x4000_0000;
    pub const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u64 = 300_000;

    #[must_use]
    pub fn new(
        gateway_hostname: impl Into<String>,
        credentials: Credentials,
        target_hostname: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            gateway_hostname: gateway_hostname.into(),
            gateway_port: 443,
            proxy: None,
            credentials,
            client_hostname: "localhost".to_owned(),
            target_hostname: target_hostname.into(),
            target_port,
            channel_lifetime: Self::DEFAULT_CHANNEL_LIFETIME,
            receive_window: Self::DEFAULT_RECEIVE_WINDOW,
            keep_alive_interval: Duration::from_millis(Self::DEFAULT_KEEP_ALIVE_INTERVAL_MS),
            connect_timeout: Duration::from_secs(30),
        }
    }
}
