//! RPC channel pair (C5, §4.5): two TLS-wrapped HTTP tunnels (IN, OUT), the
//! connection-establishment handshake, flow control and channel recycling.
//!
//! Each channel owns one [`rdpcore_tls::TlsStream`]; the HTTP request head is written once
//! at tunnel open (via [`crate::http`]) and never again — after the 401/NTLM round trip the
//! socket becomes a raw, arbitrarily long byte pipe carrying RPC PDUs.

use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use rdpcore_core::{Decode, ReadCursor, WriteCursor};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::http::{self, RequestParams, RpcHttpMethod};
use crate::ntlm::NtlmClient;
use crate::pdu::{PacketType, RpcCommonHeader, RtsCommand, RtsFlags, RtsPdu, RtsPduKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    In,
    Out,
}

/// States an IN channel passes through up to "opened" (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InChannelState {
    Initial,
    Connected,
    Security,
    Negotiated,
    Opened,
    OpenedA4w,
    Final,
}

/// States an OUT channel passes through, including recycling (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutChannelState {
    Initial,
    Connected,
    Security,
    Negotiated,
    Opened,
    OpenedA6w,
    OpenedA10w,
    OpenedB3w,
    Recycled,
    Final,
}

/// Performs the HTTP request line + NTLM 401 round trip that precedes every RPC-over-HTTP
/// tunnel (§4.4, §4.5 steps 1-2): write the request head, read the `401`, feed the NTLM
/// challenge back through `ntlm`, then replay the request with the `AUTHENTICATE_MESSAGE`.
/// Returns once the server accepts the tunnel (a `200` with no further body expected).
pub async fn open_http_tunnel<S>(
    stream: &mut S,
    method: RpcHttpMethod,
    config: &GatewayConfig,
    ntlm: &mut NtlmClient,
    session_id: uuid::Uuid,
) -> GatewayResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let content_length = match method {
        RpcHttpMethod::RpcInData => http::IN_CHANNEL_CONTENT_LENGTH,
        RpcHttpMethod::RpcOutData => 0x4000_0000,
    };

    let (negotiate, _) = ntlm.init_security_context(&config.gateway_hostname, None)?;
    http::write_request_head(
        stream,
        &RequestParams {
            method,
            gateway_host: &config.gateway_hostname,
            session_id,
            content_length,
            ntlm_authorization: Some(&negotiate),
        },
    )
    .await?;

    let head = http::read_response_head(stream).await?;
    if head.status == 401 {
        let challenge = head
            .ntlm_challenge()
            .ok_or_else(|| GatewayError::auth_failed("channel::open_http_tunnel", "401 with no NTLM challenge"))?;
        let (authenticate, done) = ntlm.init_security_context(&config.gateway_hostname, Some(&challenge))?;
        if !done {
            return Err(GatewayError::auth_failed("channel::open_http_tunnel", "NTLM did not complete in two legs"));
        }
        http::write_request_head(
            stream,
            &RequestParams {
                method,
                gateway_host: &config.gateway_hostname,
                session_id,
                content_length,
                ntlm_authorization: Some(&authenticate),
            },
        )
        .await?;
        let head = http::read_response_head(stream).await?;
        if head.status != 200 {
            return Err(GatewayError::auth_failed("channel::open_http_tunnel", "gateway rejected NTLM credentials"));
        }
    } else if head.status != 200 {
        return Err(GatewayError::new(
            "channel::open_http_tunnel",
            crate::error::GatewayErrorKind::Transport(std::io::Error::other(format!("unexpected HTTP status {}", head.status))),
        ));
    }

    Ok(())
}

/// A single TLS-wrapped HTTP tunnel. `S` is the raw transport (`TcpStream`, or the pipe
/// handed back by a CONNECT-proxy dial); callers apply `rdpcore_tls::upgrade` before
/// constructing this.
pub struct RpcChannel<S> {
    pub role: ChannelRole,
    pub cookie: [u8; 16],
    stream: S,
}

impl<S> RpcChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(role: ChannelRole, cookie: [u8; 16], stream: S) -> Self {
        Self { role, cookie, stream }
    }

    /// Writes one full RTS or RPC PDU fragment.
    pub async fn write_pdu(&mut self, bytes: &[u8]) -> GatewayResult<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads exactly one RPC fragment: the 16-byte common header, then `frag_length - 16`
    /// more bytes.
    pub async fn read_fragment(&mut self) -> GatewayResult<(RpcCommonHeader, Vec<u8>)> {
        let mut header_buf = [0u8; RpcCommonHeader::FIXED_PART_SIZE];
        self.stream.read_exact(&mut header_buf).await?;
        let mut cursor = ReadCursor::new(&header_buf);
        let header = RpcCommonHeader::decode(&mut cursor)?;

        let body_len = usize::from(header.frag_length).saturating_sub(RpcCommonHeader::FIXED_PART_SIZE);
        let mut body = vec![0u8; body_len];
        self.stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

/// Cadence the IN channel uses to keep the underlying TCP/TLS connection and the gateway's
/// RPC runtime from timing the tunnel out (§4.5 "Keepalive").
pub struct PingOriginator {
    pub conn_timeout: Duration,
    pub keepalive_interval: Duration,
    pub last_send: Instant,
}

impl PingOriginator {
    #[must_use]
    pub fn new(keepalive_interval: Duration) -> Self {
        Self {
            conn_timeout: Duration::from_secs(60),
            keepalive_interval,
            last_send: Instant::now(),
        }
    }

    #[must_use]
    pub fn due(&self) -> bool {
        self.last_send.elapsed() >= self.keepalive_interval
    }

    pub fn reset(&mut self) {
        self.last_send = Instant::now();
    }
}

/// The IN channel: client-to-server RPC requests and RTS control traffic (§3 Data model).
pub struct RpcInChannel<S> {
    pub channel: RpcChannel<S>,
    pub state: InChannelState,
    pub bytes_sent: u32,
    pub sender_available_window: u32,
    pub peer_receive_window: u32,
    pub ping_originator: PingOriginator,
}

impl<S> RpcInChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(cookie: [u8; 16], stream: S, keepalive_interval: Duration) -> Self {
        Self {
            channel: RpcChannel::new(ChannelRole::In, cookie, stream),
            state: InChannelState::Initial,
            bytes_sent: 0,
            sender_available_window: 0,
            peer_receive_window: 0,
            ping_originator: PingOriginator::new(keepalive_interval),
        }
    }

    pub async fn send_rts(&mut self, pdu: &RtsPdu) -> GatewayResult<()> {
        let mut buf = vec![0u8; pdu.full_size()];
        {
            let mut writer = WriteCursor::new(&mut buf);
            pdu.encode_full(&mut writer)?;
        }
        self.channel.write_pdu(&buf).await?;
        self.ping_originator.reset();
        Ok(())
    }

    /// Sends RTS Ping if the keepalive interval has elapsed (§4.5 "Keepalive").
    pub async fn keepalive_tick(&mut self) -> GatewayResult<()> {
        if self.ping_originator.due() {
            self.send_rts(&RtsPdu::new(RtsFlags::PING, vec![])).await?;
        }
        Ok(())
    }

    /// Emits a `FlowControlAck` to credit the OUT channel, per the half-window threshold
    /// the caller (the RPC client) evaluates against its running received-bytes counter.
    pub async fn send_flow_control_ack(&mut self, bytes_received: u32, available_window: u32, out_cookie: [u8; 16]) -> GatewayResult<()> {
        let pdu = RtsPdu::new(
            RtsFlags::OTHER_CMD,
            vec![RtsCommand::FlowControlAck {
                bytes_received,
                available_window,
                channel_cookie: out_cookie,
            }],
        );
        self.send_rts(&pdu).await
    }

    /// Recomputes `sender_available_window` from a server `FlowControlAck` (§4.5):
    /// `available_window − (bytes_sent − bytes_received)`.
    pub fn apply_flow_control_ack(&mut self, bytes_received: u32, available_window: u32) {
        let in_flight = self.bytes_sent.wrapping_sub(bytes_received);
        self.sender_available_window = available_window.saturating_sub(in_flight);
    }

    /// Writes a raw RPC PDU (bind, request, auth3 …) and updates the byte counters the flow
    /// control formula above depends on.
    pub async fn write_rpc_pdu(&mut self, bytes: &[u8]) -> GatewayResult<()> {
        self.channel.write_pdu(bytes).await?;
        self.bytes_sent = self.bytes_sent.wrapping_add(u32::try_from(bytes.len()).unwrap_or(u32::MAX));
        self.sender_available_window = self.sender_available_window.saturating_sub(u32::try_from(bytes.len()).unwrap_or(0));
        self.ping_originator.reset();
        Ok(())
    }
}

/// The OUT channel: server-to-client RPC responses and RTS control traffic.
pub struct RpcOutChannel<S> {
    pub channel: RpcChannel<S>,
    pub state: OutChannelState,
    pub receive_window: u32,
    pub receive_window_size: u32,
    pub receiver_available_window: u32,
    pub bytes_received: u32,
    pub available_window_advertised: u32,
}

impl<S> RpcOutChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(cookie: [u8; 16], stream: S, receive_window: u32) -> Self {
        Self {
            channel: RpcChannel::new(ChannelRole::Out, cookie, stream),
            state: OutChannelState::Initial,
            receive_window,
            receive_window_size: receive_window,
            receiver_available_window: receive_window,
            bytes_received: 0,
            available_window_advertised: receive_window,
        }
    }

    /// Reads one fragment and, if it is an RTS PDU, classifies and returns it (along with
    /// its decoded commands, so a caller that needs a command's payload — e.g. the
    /// `FlowControlAck`'s `BytesReceived`/`AvailableWindow` fields — doesn't have to
    /// re-decode the body) for the caller's RTS dispatcher; otherwise returns `None` and
    /// leaves the fragment for the RPC client's ordinary response path (the caller
    /// re-decodes from the returned bytes).
    pub async fn read_rts_or_pdu(&mut self) -> GatewayResult<(RpcCommonHeader, Vec<u8>, Option<RtsPduKind>, Vec<RtsCommand>)> {
        let (header, body) = self.channel.read_fragment().await?;
        if header.ptype != PacketType::Rts {
            return Ok((header, body, None, Vec::new()));
        }
        let mut cursor = ReadCursor::new(&body);
        let rts = RtsPdu::decode_body(header, &mut cursor)?;
        let kind = RtsPduKind::classify(&rts);
        trace!(?kind, "received RTS PDU on OUT channel");
        Ok((header, body, kind, rts.commands))
    }

    /// Folds `len` freshly-received bytes into the running counters and reports whether the
    /// half-window threshold has been crossed, so the caller knows to emit a
    /// `FlowControlAck` on the IN channel (§4.5 "Flow control").
    pub fn account_received(&mut self, len: usize) -> bool {
        self.bytes_received = self.bytes_received.wrapping_add(u32::try_from(len).unwrap_or(u32::MAX));
        self.receiver_available_window = self.receiver_available_window.saturating_sub(u32::try_from(len).unwrap_or(0));
        self.receiver_available_window <= self.receive_window_size / 2
    }

    /// Resets the credited window after a `FlowControlAck` has been sent (§4.5).
    pub fn replenish_window(&mut self) {
        self.receiver_available_window = self.receive_window_size;
        self.available_window_advertised = self.receive_window_size;
    }
}

fn random_cookie() -> [u8; 16] {
    let mut cookie = [0u8; 16];
    rand::Rng::fill(&mut rand::rng(), &mut cookie);
    cookie
}

/// `{ conn_cookie, assoc_group_id, state, default_in, default_out, nondefault_in?,
/// nondefault_out? }` (§3 Data model). The `nondefault_*` slots exist only while an OUT
/// channel is being recycled.
pub struct VirtualConnection<S> {
    pub conn_cookie: [u8; 16],
    pub assoc_group_id: [u8; 16],
    pub default_in: RpcInChannel<S>,
    pub default_out: RpcOutChannel<S>,
    pub nondefault_out: Option<RpcOutChannel<S>>,
}

impl<S> VirtualConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs the full virtual-connection handshake (§4.5 steps 3-6) over already-opened and
    /// NTLM-authenticated IN/OUT tunnels: `CONN/A1` on OUT, `CONN/B1` on IN, then waits for
    /// the server's `CONN/A3` and `CONN/C2` on OUT.
    pub async fn establish(config: &GatewayConfig, in_stream: S, out_stream: S) -> GatewayResult<Self> {
        let conn_cookie = random_cookie();
        let assoc_group_id = random_cookie();
        let in_cookie = random_cookie();
        let out_cookie = random_cookie();

        let mut default_in = RpcInChannel::new(in_cookie, in_stream, config.keep_alive_interval);
        let mut default_out = RpcOutChannel::new(out_cookie, out_stream, config.receive_window);

        default_out.state = OutChannelState::Connected;
        let conn_a1 = RtsPdu::new(
            RtsFlags::NONE,
            vec![
                RtsCommand::Version(1),
                RtsCommand::Cookie(conn_cookie),
                RtsCommand::Cookie(out_cookie),
                RtsCommand::ReceiveWindowSize(config.receive_window),
            ],
        );
        send_rts_on(&mut default_out.channel, &conn_a1).await?;

        default_in.state = InChannelState::Connected;
        let conn_b1 = RtsPdu::new(
            RtsFlags::NONE,
            vec![
                RtsCommand::Version(1),
                RtsCommand::Cookie(conn_cookie),
                RtsCommand::Cookie(in_cookie),
                RtsCommand::ChannelLifetime(config.channel_lifetime),
                RtsCommand::ClientKeepalive(u32::try_from(config.keep_alive_interval.as_millis()).unwrap_or(u32::MAX)),
                RtsCommand::AssociationGroupId(assoc_group_id),
            ],
        );
        default_in.send_rts(&conn_b1).await?;
        default_in.state = InChannelState::Opened;

        loop {
            let (_header, _body, kind, _commands) = default_out.read_rts_or_pdu().await?;
            match kind {
                Some(RtsPduKind::ConnA3) => debug!("received CONN/A3"),
                Some(RtsPduKind::ConnC2) => {
                    debug!("received CONN/C2, virtual connection opened");
                    default_out.state = OutChannelState::Opened;
                    break;
                }
                other => warn!(?other, "unexpected PDU while waiting for CONN/A3+C2"),
            }
        }

        Ok(Self {
            conn_cookie,
            assoc_group_id,
            default_in,
            default_out,
            nondefault_out: None,
        })
    }

    /// Begins OUT-channel recycling on receipt of `OUT_R1/A2` (§4.5 "Recycling"): opens a
    /// replacement OUT channel, authenticates it, and sends `OUT_R1/A3` announcing both the
    /// predecessor and successor cookies.
    pub async fn begin_recycle(&mut self, successor_stream: S, ntlm: &mut NtlmClient, config: &GatewayConfig, session_id: uuid::Uuid) -> GatewayResult<()> {
        let mut successor_stream = successor_stream;
        open_http_tunnel(&mut successor_stream, RpcHttpMethod::RpcOutData, config, ntlm, session_id).await?;

        let successor_cookie = random_cookie();
        let mut successor = RpcOutChannel::new(successor_cookie, successor_stream, config.receive_window);
        successor.state = OutChannelState::Connected;

        let predecessor_cookie = self.default_out.channel.cookie;
        let out_r1_a3 = RtsPdu::new(
            RtsFlags::RECYCLE_CHANNEL,
            vec![
                RtsCommand::Version(1),
                RtsCommand::Cookie(self.conn_cookie),
                RtsCommand::Cookie(predecessor_cookie),
                RtsCommand::Cookie(successor_cookie),
                RtsCommand::ReceiveWindowSize(config.receive_window),
            ],
        );
        send_rts_on(&mut successor.channel, &out_r1_a3).await?;
        self.nondefault_out = Some(successor);
        Ok(())
    }

    /// Completes recycling once `OUT_R2/A6` arrives on the successor and `OUT_R2/B3` (EOF)
    /// arrives on the predecessor: pings the new channel, acks on IN, then swaps it in.
    pub async fn complete_recycle(&mut self) -> GatewayResult<()> {
        let mut successor = self
            .nondefault_out
            .take()
            .ok_or_else(|| GatewayError::other("channel::complete_recycle", "no recycling in progress"))?;

        loop {
            let (_header, _body, kind, _commands) = successor.read_rts_or_pdu().await?;
            if matches!(kind, Some(RtsPduKind::OutR2A6)) {
                successor.state = OutChannelState::OpenedA6w;
                break;
            }
        }
        send_rts_on(&mut successor.channel, &RtsPdu::new(RtsFlags::PING, vec![])).await?;
        self.default_in.send_rts(&RtsPdu::new(RtsFlags::NONE, vec![])).await?;

        loop {
            let (_header, _body, kind, _commands) = self.default_out.read_rts_or_pdu().await?;
            if matches!(kind, Some(RtsPduKind::OutR2B3)) {
                break;
            }
        }

        successor.state = OutChannelState::Recycled;
        self.default_out = successor;
        self.default_out.state = OutChannelState::Opened;
        Ok(())
    }
}

async fn send_rts_on<S>(channel: &mut RpcChannel<S>, pdu: &RtsPdu) -> GatewayResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; pdu.full_size()];
    {
        let mut writer = WriteCursor::new(&mut buf);
        pdu.encode_full(&mut writer)?;
    }
    channel.write_pdu(&buf).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_control_ack_recomputes_sender_window() {
        let mut in_channel = RpcInChannel {
            channel: RpcChannel {
                role: ChannelRole::In,
                cookie: [0u8; 16],
                stream: tokio::io::empty(),
            },
            state: InChannelState::Opened,
            bytes_sent: 0x20000,
            sender_available_window: 0,
            peer_receive_window: 0,
            ping_originator: PingOriginator::new(Duration::from_secs(300)),
        };
        in_channel.apply_flow_control_ack(0x10000, 0x10000);
        assert_eq!(in_channel.sender_available_window, 0);
    }

    #[test]
    fn account_received_reports_half_window_threshold() {
        let mut out = RpcOutChannel {
            channel: RpcChannel {
                role: ChannelRole::Out,
                cookie: [0u8; 16],
                stream: tokio::io::empty(),
            },
            state: OutChannelState::Opened,
            receive_window: 0x10000,
            receive_window_size: 0x10000,
            receiver_available_window: 0x10000,
            bytes_received: 0,
            available_window_advertised: 0x10000,
        };
        assert!(!out.account_received(0x100));
        assert!(out.account_received(0x7F00));
    }
}
