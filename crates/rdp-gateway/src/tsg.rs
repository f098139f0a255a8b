//! TSG tunnel/channel state machine (C7, §4.7): drives the five opnums that turn a bound
//! RPC connection into a byte pipe carrying an RDP stream, and exposes that pipe as
//! `AsyncRead + AsyncWrite` to the host (§6 "External interfaces").

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use rdpcore_core::{EncodeResult, ReadCursor, WriteCursor};

use crate::channel::{open_http_tunnel, VirtualConnection};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::http::RpcHttpMethod;
use crate::ntlm::NtlmClient;
use crate::pdu::{
    AuthorizeTunnelRequest, CloseRequest, CreateChannelRequest, CreateChannelResponse, CreateTunnelRequest,
    CreateTunnelResponse, GatewayMessage, MakeTunnelCallKind, MakeTunnelCallRequest, MakeTunnelCallResponse,
    PacketContext, SendToServerRequest, SetupReceivePipeRequest, TsgOpnum,
};
use crate::rpc_client::{CallOutcome, CallSink, PipeChunk, RpcClient};

/// The transport underneath every RPC channel pair: TLS over a plain (or proxy-tunneled) TCP
/// socket, matching [`rdpcore_tls::upgrade`]'s signature regardless of which backend feature
/// is active.
pub type GatewayStream = rdpcore_tls::TlsStream<TcpStream>;

/// Tunnel lifecycle (§4.7 "Tunnel state machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Initial,
    Connected,
    Authorized,
    ChannelCreated,
    PipeCreated,
    TunnelClosePending,
    ChannelClosePending,
    Final,
}

/// Receives out-of-band gateway messages delivered via `MakeTunnelCall` (§4.7 "MakeTunnelCall
/// response"): consent prompts and service messages a host may want to surface to a user.
/// Reauth messages are handled internally and never reach this sink.
pub trait GatewayMessageSink: Send + Sync {
    fn on_message(&self, message: &GatewayMessage);
}

impl<F: Fn(&GatewayMessage) + Send + Sync> GatewayMessageSink for F {
    fn on_message(&self, message: &GatewayMessage) {
        self(message)
    }
}

/// Entry point mirroring `ironrdp-mstsgu`'s `TsgTransport::connect`: dials the gateway,
/// negotiates both RPC-over-HTTP tunnels, binds the RPC context, and runs the TSG opnum
/// sequence through `SetupReceivePipe`.
pub struct Tsg;

impl Tsg {
    /// Runs the full connect sequence (§4.7, §6): TCP dial (optionally through
    /// `config.proxy`), TLS, the IN/OUT HTTP tunnels with their own NTLM handshakes, the
    /// virtual-connection handshake, the RPC bind, then `CreateTunnel` → `AuthorizeTunnel` →
    /// `CreateChannel` → `SetupReceivePipe`. Returns a pipe the host can use as a drop-in
    /// replacement for the raw TCP stream it would otherwise open directly to the RDP server.
    pub async fn connect(config: &GatewayConfig, message_sink: Option<Arc<dyn GatewayMessageSink>>) -> GatewayResult<TsgPipe> {
        let session_id = uuid::Uuid::new_v4();

        let in_stream = open_tunnel(config, RpcHttpMethod::RpcInData, session_id).await?;
        let out_stream = open_tunnel(config, RpcHttpMethod::RpcOutData, session_id).await?;
        let conn = VirtualConnection::establish(config, in_stream, out_stream).await?;

        let rpc_ntlm = NtlmClient::new(&config.credentials);
        let (rpc, out_channel, _auth3_call_id) = RpcClient::bind(conn, rpc_ntlm, &config.gateway_hostname).await?;
        let recv_task = rpc.spawn(out_channel);

        let state = Arc::new(Mutex::new(TunnelState::Initial));

        let create_stub = encode_stub(256, |w| CreateTunnelRequest { reauth_context: None }.encode(w))?;
        let (_, rx) = rpc.write_call(TsgOpnum::CreateTunnel as u16, create_stub).await?;
        let tunnel_context = match await_call(rx).await? {
            CallOutcome::Response(bytes) => CreateTunnelResponse::decode(&mut ReadCursor::new(&bytes))?.tunnel_context,
            CallOutcome::Fault(status) => return Err(GatewayError::fault("tsg::connect::create_tunnel", status)),
        };
        *state.lock().await = TunnelState::Connected;
        debug!("CreateTunnel complete");

        let authz_cap = 128 + config.client_hostname.len() * 4;
        let authz_stub = encode_stub(authz_cap, |w| {
            AuthorizeTunnelRequest {
                tunnel_context,
                machine_name: config.client_hostname.clone(),
            }
            .encode(w)
        })?;
        let (_, rx) = rpc.write_call(TsgOpnum::AuthorizeTunnel as u16, authz_stub).await?;
        let authorize = match await_call(rx).await? {
            CallOutcome::Response(bytes) => crate::pdu::AuthorizeTunnelResponse::decode(&mut ReadCursor::new(&bytes))?,
            CallOutcome::Fault(status) => return Err(GatewayError::fault("tsg::connect::authorize_tunnel", status)),
        };
        if authorize.redirection.disable_all {
            return Err(GatewayError::auth_failed("tsg::connect", "gateway policy disabled RDP redirection"));
        }
        *state.lock().await = TunnelState::Authorized;
        debug!("AuthorizeTunnel complete");

        let tunnel_context = Arc::new(Mutex::new(tunnel_context));
        let pump_task = spawn_message_pump(rpc.clone(), tunnel_context.clone(), message_sink);

        let ctx = *tunnel_context.lock().await;
        let channel_cap = 160 + config.target_hostname.len() * 4;
        let create_channel_stub = encode_stub(channel_cap, |w| {
            CreateChannelRequest {
                tunnel_context: ctx,
                target_host: config.target_hostname.clone(),
                target_port: config.target_port,
            }
            .encode(w)
        })?;
        let (_, rx) = rpc.write_call(TsgOpnum::CreateChannel as u16, create_channel_stub).await?;
        let channel: CreateChannelResponse = match await_call(rx).await? {
            CallOutcome::Response(bytes) => CreateChannelResponse::decode(&mut ReadCursor::new(&bytes))?,
            CallOutcome::Fault(status) => return Err(GatewayError::fault("tsg::connect::create_channel", status)),
        };
        *state.lock().await = TunnelState::ChannelCreated;
        debug!(channel_id = channel.channel_id, "CreateChannel complete");

        let setup_stub = encode_stub(
            PacketContext::SIZE,
            |w| SetupReceivePipeRequest { channel_context: channel.channel_context }.encode(w),
        )?;
        let (pipe_tx, pipe_rx) = mpsc::unbounded_channel();
        let pipe_call_id = rpc.alloc_call_id();
        rpc.write_call_with_id(pipe_call_id, TsgOpnum::SetupReceivePipe as u16, setup_stub, CallSink::Pipe(pipe_tx))
            .await?;
        *state.lock().await = TunnelState::PipeCreated;
        debug!("SetupReceivePipe armed, tunnel is ready to carry RDP traffic");

        let (send_tx, send_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let send_task = spawn_send_loop(rpc.clone(), channel.channel_context, send_rx);

        Ok(TsgPipe {
            rpc,
            tunnel_context,
            channel_context: channel.channel_context,
            send_tx,
            recv_rx: pipe_rx,
            recv_buf: VecDeque::new(),
            eof: false,
            state,
            _recv_task: recv_task,
            _pump_task: pump_task,
            _send_task: send_task,
        })
    }
}

async fn await_call(rx: tokio::sync::oneshot::Receiver<CallOutcome>) -> GatewayResult<CallOutcome> {
    rx.await.map_err(|_| GatewayError::other("tsg::connect", "RPC call dropped before completion"))
}

async fn open_tunnel(config: &GatewayConfig, method: RpcHttpMethod, session_id: uuid::Uuid) -> GatewayResult<GatewayStream> {
    let tcp = dial(config).await?;
    let (mut tls, _server_public_key) = rdpcore_tls::upgrade(tcp, &config.gateway_hostname).await?;
    let mut ntlm = NtlmClient::new(&config.credentials);
    open_http_tunnel(&mut tls, method, config, &mut ntlm, session_id).await?;
    Ok(tls)
}

/// Dials the gateway directly, or through `config.proxy` via an HTTP `CONNECT` tunnel
/// (§6 "proxy support").
async fn dial(config: &GatewayConfig) -> GatewayResult<TcpStream> {
    let Some(proxy) = &config.proxy else {
        return Ok(TcpStream::connect((config.gateway_hostname.as_str(), config.gateway_port)).await?);
    };

    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
        host = config.gateway_hostname,
        port = config.gateway_port,
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;
    let head = crate::http::read_response_head(&mut stream).await?;
    if head.status != 200 {
        return Err(GatewayError::other("tsg::dial", "CONNECT proxy refused to open a tunnel"));
    }
    Ok(stream)
}

fn encode_stub(cap: usize, f: impl FnOnce(&mut WriteCursor<'_>) -> EncodeResult<()>) -> GatewayResult<Vec<u8>> {
    let mut buf = vec![0u8; cap];
    let len = {
        let mut writer = WriteCursor::new(&mut buf);
        f(&mut writer)?;
        writer.pos()
    };
    buf.truncate(len);
    Ok(buf)
}

/// Keeps one `MakeTunnelCall` perpetually armed (§4.7 "MakeTunnelCall response"): each
/// completion either updates `tunnel_context` in place (reauth) or is forwarded to
/// `message_sink`, and the call is immediately reissued under a fresh `call_id`.
fn spawn_message_pump<S>(
    rpc: RpcClient<S>,
    tunnel_context: Arc<Mutex<PacketContext>>,
    message_sink: Option<Arc<dyn GatewayMessageSink>>,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::unbounded_channel();
        loop {
            let ctx = *tunnel_context.lock().await;
            let stub = match encode_stub(64, |w| {
                MakeTunnelCallRequest {
                    tunnel_context: ctx,
                    kind: MakeTunnelCallKind::ArmAsyncDelivery,
                }
                .encode(w)
            }) {
                Ok(stub) => stub,
                Err(err) => {
                    warn!(%err, "failed to encode MakeTunnelCall, stopping message pump");
                    return;
                }
            };
            let call_id = rpc.alloc_call_id();
            if let Err(err) = rpc
                .write_call_with_id(call_id, TsgOpnum::MakeTunnelCall as u16, stub, CallSink::Recurring(tx.clone()))
                .await
            {
                warn!(%err, "failed to arm MakeTunnelCall, stopping message pump");
                return;
            }

            match rx.recv().await {
                Some(CallOutcome::Response(bytes)) => match MakeTunnelCallResponse::decode(&mut ReadCursor::new(&bytes)) {
                    Ok(response) => {
                        if let Some(message) = response.message {
                            match message {
                                GatewayMessage::Reauth { tunnel_context: new_context } => {
                                    debug!("gateway issued reauth, rebinding tunnel context");
                                    *tunnel_context.lock().await = new_context;
                                }
                                other => {
                                    if let Some(sink) = &message_sink {
                                        sink.on_message(&other);
                                    }
                                }
                            }
                        }
                    }
                    Err(err) => warn!(%err, "failed to decode MakeTunnelCall response"),
                },
                Some(CallOutcome::Fault(status)) => {
                    warn!(status, "MakeTunnelCall faulted, stopping message pump");
                    return;
                }
                None => return,
            }
        }
    })
}

/// Drains outbound RDP bytes and issues one `SendToServer` call per buffer (§4.7
/// "SendToServer").
fn spawn_send_loop<S>(rpc: RpcClient<S>, channel_context: PacketContext, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            let cap = data.len() + 64;
            let stub = match encode_stub(cap, move |w| SendToServerRequest { channel_context, data }.encode(w)) {
                Ok(stub) => stub,
                Err(err) => {
                    warn!(%err, "failed to encode SendToServer, dropping buffer");
                    continue;
                }
            };
            match rpc.write_call(TsgOpnum::SendToServer as u16, stub).await {
                Ok((_, rx)) => {
                    if let Ok(CallOutcome::Fault(status)) = rx.await {
                        warn!(status, "SendToServer faulted");
                    }
                }
                Err(err) => warn!(%err, "failed to write SendToServer"),
            }
        }
    })
}

/// The established tunnel, exposed as a plain byte stream (§6 "Interfaces exposed to
/// host"). Reads drain `TsProxySetupReceivePipe` deliveries; writes are queued to a
/// background task issuing `TsProxySendToServer` calls.
pub struct TsgPipe {
    rpc: RpcClient<GatewayStream>,
    tunnel_context: Arc<Mutex<PacketContext>>,
    channel_context: PacketContext,
    send_tx: mpsc::UnboundedSender<Vec<u8>>,
    recv_rx: mpsc::UnboundedReceiver<PipeChunk>,
    recv_buf: VecDeque<u8>,
    eof: bool,
    state: Arc<Mutex<TunnelState>>,
    _recv_task: JoinHandle<()>,
    _pump_task: JoinHandle<()>,
    _send_task: JoinHandle<()>,
}

impl TsgPipe {
    #[must_use]
    pub fn channel_id_context(&self) -> PacketContext {
        self.channel_context
    }

    /// Tears the tunnel down in order (§4.7 "Tunnel state machine", `ChannelClosePending` →
    /// `TunnelClosePending` → `Final`): `CloseChannel` first, then `CloseTunnel`.
    pub async fn close(self) -> GatewayResult<()> {
        *self.state.lock().await = TunnelState::ChannelClosePending;
        let close_channel_stub = encode_stub(PacketContext::SIZE, |w| CloseRequest { context: self.channel_context }.encode(w))?;
        let (_, rx) = self.rpc.write_call(TsgOpnum::CloseChannel as u16, close_channel_stub).await?;
        let _ = rx.await;

        *self.state.lock().await = TunnelState::TunnelClosePending;
        let ctx = *self.tunnel_context.lock().await;
        let close_tunnel_stub = encode_stub(PacketContext::SIZE, |w| CloseRequest { context: ctx }.encode(w))?;
        let (_, rx) = self.rpc.write_call(TsgOpnum::CloseTunnel as u16, close_tunnel_stub).await?;
        let _ = rx.await;

        *self.state.lock().await = TunnelState::Final;
        Ok(())
    }
}

impl AsyncRead for TsgPipe {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.recv_buf.is_empty() {
                let n = usize::min(buf.remaining(), this.recv_buf.len());
                let chunk: Vec<u8> = this.recv_buf.drain(..n).collect();
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match this.recv_rx.poll_recv(cx) {
                Poll::Ready(Some(PipeChunk::Data(data))) => {
                    this.recv_buf.extend(data);
                }
                Poll::Ready(Some(PipeChunk::Eof(_status))) | Poll::Ready(None) => {
                    this.eof = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for TsgPipe {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut().send_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "TSG send task terminated"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_stub_truncates_to_actual_length() {
        let stub = encode_stub(64, |w| {
            w.write_u32(1);
            Ok(())
        })
        .unwrap();
        assert_eq!(stub.len(), 4);
    }

    #[test]
    fn gateway_message_sink_accepts_closures() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(false));
        let seen_clone = seen.clone();
        let sink: Arc<dyn GatewayMessageSink> = Arc::new(move |_msg: &GatewayMessage| {
            *seen_clone.lock().unwrap() = true;
        });
        sink.on_message(&GatewayMessage::Reauth {
            tunnel_context: PacketContext::default(),
        });
        assert!(*seen.lock().unwrap());
    }
}
