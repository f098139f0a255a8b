//! RPC client / PDU reassembler (C6, §4.6): the bind sequence, per-call state, fragment
//! reassembly, signature verification, and pipe-style stream delivery for the TSG opnum
//! calls built on top of the channel pair (C5, [`crate::channel`]).
//!
//! Ownership mirrors the "two background tasks" concurrency model from SPEC_FULL §5: the
//! IN channel lives behind a [`tokio::sync::Mutex`] so concurrent [`RpcClient::write_call`]
//! callers serialize on it (each still gets its own `call_id` before the first byte, per
//! §5 "Ordering guarantees"), while the OUT channel is moved into [`RpcClient::spawn`]'s
//! background task and read exclusively from there.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use rdpcore_core::{ReadCursor, WriteCursor};

use crate::channel::{RpcInChannel, RpcOutChannel, VirtualConnection};
use crate::error::{GatewayError, GatewayResult};
use crate::ntlm::NtlmClient;
use crate::pdu::{
    split_trailer, Auth3Pdu, BindAckPdu, BindAckResult, BindPdu, FaultPdu, PacketType, RequestPdu, ResponsePdu,
    RpcCommonHeader, RtsCommand, RtsPduKind, SecTrailer,
};

/// `max_recv_frag` this client advertises at bind time (§4.2 "Fragment maximum").
pub const MAX_FRAG_SIZE: u16 = 0x0FF8;

/// Outcome of one completed RPC call, handed to whoever is waiting on it.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Response(Vec<u8>),
    Fault(u32),
}

/// Where a call's result should be delivered once reassembly completes.
pub enum CallSink {
    /// A plain request/response call (§4.7 CreateTunnel/AuthorizeTunnel/CreateChannel/…):
    /// exactly one outcome, then the table entry is removed.
    Once(oneshot::Sender<CallOutcome>),
    /// `TsProxyMakeTunnelCall`'s async-delivery call (§4.7 "MakeTunnelCall response"): the
    /// server may complete it, and the client immediately re-arms by issuing another
    /// `MakeTunnelCall`, so each outcome is forwarded without removing the entry.
    Recurring(mpsc::UnboundedSender<CallOutcome>),
    /// `TsProxySetupReceivePipe`'s long-lived server-to-client stream (§4.6 "Inbound": pipe
    /// delivery). Raw stub bytes are forwarded as they arrive; end-of-pipe is signalled by a
    /// 4-byte final-status stub with `PFC_LAST_FRAG` set.
    Pipe(mpsc::UnboundedSender<PipeChunk>),
}

#[derive(Debug)]
pub enum PipeChunk {
    Data(Vec<u8>),
    Eof(u32),
}

struct CallEntry {
    sink: CallSink,
    buffer: Vec<u8>,
    alloc_hint: u32,
    /// Set on the *surviving* entry when a later `write_call` reuses its `call_id` while it
    /// is still outstanding (§4.6 "Call-table lifecycle", the smartcard-client workaround).
    duplicate: bool,
}

type CallTable = Arc<std::sync::Mutex<HashMap<u32, CallEntry>>>;

/// The RPC client/reassembler sitting on top of one [`VirtualConnection`]. Construct with
/// [`RpcClient::bind`], then [`RpcClient::spawn`] the returned OUT channel before issuing
/// any [`RpcClient::write_call`]s.
pub struct RpcClient<S> {
    in_channel: Arc<Mutex<RpcInChannel<S>>>,
    ntlm: Arc<Mutex<NtlmClient>>,
    calls: CallTable,
    next_call_id: Arc<AtomicU32>,
    send_seq: Arc<AtomicU32>,
}

impl<S> Clone for RpcClient<S> {
    fn clone(&self) -> Self {
        Self {
            in_channel: self.in_channel.clone(),
            ntlm: self.ntlm.clone(),
            calls: self.calls.clone(),
            next_call_id: self.next_call_id.clone(),
            send_seq: self.send_seq.clone(),
        }
    }
}

impl<S> RpcClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Runs the bind sequence (§4.6 "Bind sequence") over an already-established virtual
    /// connection: client `PTYPE_BIND` carrying the NTLM `NEGOTIATE_MESSAGE`, server
    /// `BIND_ACK` carrying the NTLM `CHALLENGE_MESSAGE`, client `RPC_AUTH_3` carrying the
    /// NTLM `AUTHENTICATE_MESSAGE`. Consumes `conn`; the caller gets back the client plus the
    /// OUT channel to hand to [`RpcClient::spawn`].
    pub async fn bind(conn: VirtualConnection<S>, mut ntlm: NtlmClient, target: &str) -> GatewayResult<(Self, RpcOutChannel<S>, u32)> {
        let VirtualConnection {
            mut default_in,
            mut default_out,
            ..
        } = conn;

        let next_call_id = Arc::new(AtomicU32::new(2));

        let (negotiate, _) = ntlm.init_security_context(target, None)?;
        let bind_call_id = next_call_id.fetch_add(1, Ordering::SeqCst);
        let bind = BindPdu::new(bind_call_id, MAX_FRAG_SIZE, Some(negotiate));
        let mut buf = vec![0u8; bind.full_size()];
        {
            let mut writer = WriteCursor::new(&mut buf);
            bind.encode_full(&mut writer)?;
        }
        default_in.write_rpc_pdu(&buf).await?;

        let (header, body) = default_out.channel.read_fragment().await?;
        if header.ptype != PacketType::BindAck {
            return Err(GatewayError::protocol("rpc_client::bind", "Connected", "expected BIND_ACK"));
        }
        let mut cursor = ReadCursor::new(&body);
        let bind_ack = BindAckPdu::decode_body(header, &mut cursor)?;
        if !matches!(bind_ack.result, BindAckResult::Acceptance) {
            return Err(GatewayError::auth_failed("rpc_client::bind", "server rejected TSGU presentation context"));
        }
        let challenge = bind_ack
            .ntlm_challenge
            .ok_or_else(|| GatewayError::auth_failed("rpc_client::bind", "BIND_ACK carried no NTLM challenge"))?;

        let (authenticate, done) = ntlm.init_security_context(target, Some(&challenge))?;
        if !done {
            return Err(GatewayError::auth_failed("rpc_client::bind", "NTLM did not complete at RPC_AUTH_3"));
        }
        let auth3_call_id = next_call_id.fetch_add(1, Ordering::SeqCst);
        let auth3 = Auth3Pdu {
            call_id: auth3_call_id,
            auth_token: authenticate,
        };
        let mut buf = vec![0u8; auth3.full_size()];
        {
            let mut writer = WriteCursor::new(&mut buf);
            auth3.encode_full(&mut writer)?;
        }
        default_in.write_rpc_pdu(&buf).await?;
        debug!(bind_call_id, auth3_call_id, "RPC bind sequence complete, context negotiated");

        let client = Self {
            in_channel: Arc::new(Mutex::new(default_in)),
            ntlm: Arc::new(Mutex::new(ntlm)),
            calls: Arc::new(std::sync::Mutex::new(HashMap::new())),
            next_call_id,
            send_seq: Arc::new(AtomicU32::new(0)),
        };
        Ok((client, default_out, auth3_call_id))
    }

    /// Starts the background reassembly task that owns the OUT channel exclusively for the
    /// remainder of the connection (§5 "two background tasks for the RPC IN and OUT
    /// channels").
    #[must_use]
    pub fn spawn(&self, out_channel: RpcOutChannel<S>) -> JoinHandle<()> {
        let in_channel = self.in_channel.clone();
        let ntlm = self.ntlm.clone();
        let calls = self.calls.clone();
        tokio::spawn(async move {
            if let Err(err) = run_receive_loop(out_channel, in_channel, ntlm, calls).await {
                warn!(%err, "RPC receive loop terminated");
            }
        })
    }

    /// Allocates a fresh `call_id` without sending anything; used by callers (TSG's
    /// `SetupReceivePipe`/`MakeTunnelCall`) that need the id before the registration that
    /// follows.
    pub fn alloc_call_id(&self) -> u32 {
        self.next_call_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Writes one `PTYPE_REQUEST` call and registers a one-shot sink for its reply (§4.6
    /// "Outbound"). Returns the assigned `call_id` and a receiver for the eventual outcome.
    pub async fn write_call(&self, opnum: u16, stub: Vec<u8>) -> GatewayResult<(u32, oneshot::Receiver<CallOutcome>)> {
        let call_id = self.alloc_call_id();
        let (tx, rx) = oneshot::channel();
        self.register(call_id, CallSink::Once(tx));
        self.send_request(call_id, opnum, stub).await?;
        Ok((call_id, rx))
    }

    /// Writes one `PTYPE_REQUEST` call under a caller-chosen `call_id`, registering a
    /// recurring sink (MakeTunnelCall's async-delivery re-arm) or a pipe sink
    /// (SetupReceivePipe).
    pub async fn write_call_with_id(&self, call_id: u32, opnum: u16, stub: Vec<u8>, sink: CallSink) -> GatewayResult<()> {
        self.register(call_id, sink);
        self.send_request(call_id, opnum, stub).await
    }

    fn register(&self, call_id: u32, sink: CallSink) {
        let mut calls = self.calls.lock().expect("call table poisoned");
        if let Some(existing) = calls.get_mut(&call_id) {
            // §4.6 "on duplicate detection, drop the subsequent response output to the
            // dispatcher": keep the original entry, flag it, and let its completion be
            // silently dropped rather than delivered twice.
            existing.duplicate = true;
            return;
        }
        calls.insert(
            call_id,
            CallEntry {
                sink,
                buffer: Vec::new(),
                alloc_hint: 0,
                duplicate: false,
            },
        );
    }

    async fn send_request(&self, call_id: u32, opnum: u16, stub: Vec<u8>) -> GatewayResult<()> {
        let seq = self.send_seq.fetch_add(1, Ordering::SeqCst);
        let signature_size = self.ntlm.lock().await.query_context_max_signature_size() as usize;
        let request = RequestPdu {
            call_id,
            p_cont_id: 0,
            opnum,
            stub,
            auth_token: Some(vec![0u8; signature_size]),
        };
        let mut buf = vec![0u8; request.full_size()];
        {
            let mut writer = WriteCursor::new(&mut buf);
            request.encode_full(&mut writer)?;
        }

        // `encode_full` already laid out a placeholder-zeroed auth token at the tail; sign
        // everything between the common header and the sec_trailer in place and splice the
        // real signature in, leaving `frag_length` and every preceding offset untouched.
        let token_start = buf.len() - signature_size;
        let trailer_start = token_start - SecTrailer::FIXED_PART_SIZE;
        let body_start = RpcCommonHeader::FIXED_PART_SIZE;
        let signature = self.ntlm.lock().await.encrypt(&buf[body_start..trailer_start], seq)?;
        buf[token_start..].copy_from_slice(&signature);

        let mut in_channel = self.in_channel.lock().await;
        in_channel.write_rpc_pdu(&buf).await?;
        trace!(call_id, opnum, "wrote RPC request");
        Ok(())
    }
}

/// The background task started by [`RpcClient::spawn`]: reads fragments off the OUT
/// channel, verifies the NTLM signature, reassembles stub data, and dispatches to the call
/// table or the RTS handler (§4.6 "Inbound").
async fn run_receive_loop<S>(
    mut out_channel: RpcOutChannel<S>,
    in_channel: Arc<Mutex<RpcInChannel<S>>>,
    ntlm: Arc<Mutex<NtlmClient>>,
    calls: CallTable,
) -> GatewayResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut recv_seq: u32 = 0;
    loop {
        let (header, body, rts_kind, rts_commands) = out_channel.read_rts_or_pdu().await?;

        if let Some(kind) = rts_kind {
            handle_rts(kind, &rts_commands, &in_channel).await;
            continue;
        }

        let threshold_crossed = out_channel.account_received(body.len());

        match header.ptype {
            PacketType::Response => {
                let parts = split_trailer(&header, &body)?;
                let seq = recv_seq;
                recv_seq = recv_seq.wrapping_add(1);
                if let Some(trailer_and_token) = parts.sec_trailer_and_auth {
                    if trailer_and_token.len() > SecTrailer::FIXED_PART_SIZE {
                        let signature = &trailer_and_token[SecTrailer::FIXED_PART_SIZE..];
                        if let Err(err) = ntlm.lock().await.decrypt(parts.stub, signature, seq) {
                            warn!(%err, call_id = header.call_id, "dropping RESPONSE with bad NTLM signature");
                            continue;
                        }
                    }
                }
                let mut cursor = ReadCursor::new(parts.stub);
                let response = ResponsePdu::decode_body(header, &mut cursor)?;
                let is_last = header.pfc_flags.contains(crate::pdu::PfcFlags::LAST_FRAG);
                deliver_response(&calls, response, is_last);
            }
            PacketType::Fault => {
                let mut cursor = ReadCursor::new(&body);
                let fault = FaultPdu::decode_body(header, &mut cursor)?;
                deliver_fault(&calls, fault);
            }
            PacketType::BindAck | PacketType::Bind | PacketType::RpcAuth3 => {
                trace!(call_id = header.call_id, "ignoring late bind-phase PDU on established connection");
            }
            other => {
                warn!(?other, call_id = header.call_id, "unexpected ptype on OUT channel, ignoring");
            }
        }

        if threshold_crossed {
            let mut in_channel = in_channel.lock().await;
            in_channel
                .send_flow_control_ack(out_channel.bytes_received, out_channel.available_window_advertised, out_channel.channel.cookie)
                .await?;
            out_channel.replenish_window();
        }
    }
}

fn deliver_response(calls: &CallTable, response: ResponsePdu, is_last_frag: bool) {
    let mut calls = calls.lock().expect("call table poisoned");
    let Some(entry) = calls.get_mut(&response.call_id) else {
        trace!(call_id = response.call_id, "RESPONSE for unknown call_id, dropping");
        return;
    };
    entry.alloc_hint = response.alloc_hint;
    entry.buffer.extend_from_slice(&response.stub);

    let pipe_eof = matches!(entry.sink, CallSink::Pipe(_)) && entry.buffer.len() == 4 && is_last_frag;
    let complete = pipe_eof || u32::try_from(entry.buffer.len()).unwrap_or(u32::MAX) >= entry.alloc_hint;
    if !complete {
        return;
    }

    let Some(entry) = calls.remove(&response.call_id) else { return };
    if entry.duplicate {
        trace!(call_id = response.call_id, "dropping response for duplicate-flagged call_id");
        return;
    }

    match entry.sink {
        CallSink::Pipe(tx) if pipe_eof => {
            let status = u32::from_le_bytes(entry.buffer[..4].try_into().unwrap_or([0; 4]));
            let _ = tx.send(PipeChunk::Eof(status));
        }
        CallSink::Pipe(tx) => {
            let _ = tx.send(PipeChunk::Data(entry.buffer));
            // The pipe stays open for further fragments: reinsert with a fresh buffer.
            calls.insert(
                response.call_id,
                CallEntry {
                    sink: CallSink::Pipe(tx),
                    buffer: Vec::new(),
                    alloc_hint: 0,
                    duplicate: false,
                },
            );
        }
        CallSink::Once(tx) => {
            let _ = tx.send(CallOutcome::Response(entry.buffer));
        }
        CallSink::Recurring(tx) => {
            let _ = tx.send(CallOutcome::Response(entry.buffer));
        }
    }
}

fn deliver_fault(calls: &CallTable, fault: FaultPdu) {
    let mut calls = calls.lock().expect("call table poisoned");
    let Some(entry) = calls.remove(&fault.call_id) else {
        trace!(call_id = fault.call_id, "FAULT for unknown call_id, dropping");
        return;
    };
    if entry.duplicate {
        return;
    }
    match entry.sink {
        CallSink::Once(tx) => {
            let _ = tx.send(CallOutcome::Fault(fault.status));
        }
        CallSink::Recurring(tx) => {
            let _ = tx.send(CallOutcome::Fault(fault.status));
        }
        CallSink::Pipe(tx) => {
            let _ = tx.send(PipeChunk::Eof(fault.status));
        }
    }
}

/// Handles one classified RTS PDU from the OUT channel (§4.5): a `FlowControlAck` carries the
/// server's view of our send window and is fed into the IN channel's recompute formula;
/// recycling solicitation (`OUT_R1/A2` onward) is driven by [`crate::tsg::Tsg`], which owns the
/// [`VirtualConnection`] directly rather than through this reassembly loop.
async fn handle_rts<S>(kind: RtsPduKind, commands: &[RtsCommand], in_channel: &Arc<Mutex<RpcInChannel<S>>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match kind {
        RtsPduKind::FlowControlAck => {
            let ack = commands.iter().find_map(|command| match command {
                RtsCommand::FlowControlAck { bytes_received, available_window, .. } => {
                    Some((*bytes_received, *available_window))
                }
                _ => None,
            });
            match ack {
                Some((bytes_received, available_window)) => {
                    in_channel.lock().await.apply_flow_control_ack(bytes_received, available_window);
                    trace!(bytes_received, available_window, "applied FlowControlAck from server");
                }
                None => warn!("RTS PDU classified as FlowControlAck but carried no FlowControlAck command"),
            }
        }
        RtsPduKind::Ping | RtsPduKind::Echo | RtsPduKind::PingTrafficSentNotify | RtsPduKind::KeepAlive => {
            trace!(?kind, "received keepalive-class RTS PDU");
        }
        other => debug!(?other, "RTS PDU requires tunnel-level handling, deferring to TSG layer"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_table_marks_reused_id_as_duplicate() {
        let calls: CallTable = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (tx1, _rx1) = oneshot::channel();
        {
            let mut table = calls.lock().unwrap();
            table.insert(
                1,
                CallEntry {
                    sink: CallSink::Once(tx1),
                    buffer: Vec::new(),
                    alloc_hint: 0,
                    duplicate: false,
                },
            );
        }
        {
            let mut table = calls.lock().unwrap();
            if let Some(existing) = table.get_mut(&1) {
                existing.duplicate = true;
            }
        }
        let table = calls.lock().unwrap();
        assert!(table.get(&1).unwrap().duplicate);
    }

    #[test]
    fn response_completes_when_buffer_reaches_alloc_hint() {
        let calls: CallTable = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        calls.lock().unwrap().insert(
            7,
            CallEntry {
                sink: CallSink::Once(tx),
                buffer: Vec::new(),
                alloc_hint: 0,
                duplicate: false,
            },
        );
        let response = ResponsePdu {
            call_id: 7,
            p_cont_id: 0,
            alloc_hint: 4,
            stub: vec![1, 2, 3, 4],
        };
        deliver_response(&calls, response, true);
        assert!(calls.lock().unwrap().get(&7).is_none());
        match rx.try_recv() {
            Ok(CallOutcome::Response(buf)) => assert_eq!(buf, vec![1, 2, 3, 4]),
            other => panic!("expected response outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handle_rts_applies_decoded_flow_control_ack() {
        use crate::channel::RpcInChannel;
        use std::time::Duration;

        let mut in_channel = RpcInChannel::new([0u8; 16], tokio::io::empty(), Duration::from_secs(300));
        in_channel.bytes_sent = 0x20000;
        let in_channel = Arc::new(Mutex::new(in_channel));

        let commands = vec![RtsCommand::FlowControlAck {
            bytes_received: 0x10000,
            available_window: 0x10000,
            channel_cookie: [0u8; 16],
        }];
        handle_rts(RtsPduKind::FlowControlAck, &commands, &in_channel).await;

        assert_eq!(in_channel.lock().await.sender_available_window, 0);
    }

    #[tokio::test]
    async fn handle_rts_ignores_flow_control_ack_with_no_matching_command() {
        use crate::channel::RpcInChannel;
        use std::time::Duration;

        let mut in_channel = RpcInChannel::new([0u8; 16], tokio::io::empty(), Duration::from_secs(300));
        in_channel.bytes_sent = 0x20000;
        in_channel.sender_available_window = 0x4000;
        let in_channel = Arc::new(Mutex::new(in_channel));

        handle_rts(RtsPduKind::FlowControlAck, &[], &in_channel).await;

        assert_eq!(in_channel.lock().await.sender_available_window, 0x4000);
    }
}
