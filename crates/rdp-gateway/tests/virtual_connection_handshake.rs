//! End-to-end exercise of the RTS connection-establishment handshake (§4.5 steps 3-6):
//! `VirtualConnection::establish` driven over an in-memory duplex pair standing in for the
//! already-NTLM-authenticated IN/OUT TLS tunnels, with a small fake server task playing the
//! gateway's half of CONN/A1 → CONN/A3 + CONN/C2, CONN/B1.

use rdp_gateway::config::{Credentials, GatewayConfig};
use rdpcore_core::{Decode, ReadCursor, WriteCursor};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use rdp_gateway::pdu::{RpcCommonHeader, RtsCommand, RtsFlags, RtsPdu};

// Re-export the channel module's `VirtualConnection` through the crate root isn't public
// beyond what `rdp-gateway` exposes as `pub mod channel`, so use that path directly.
use rdp_gateway::channel::VirtualConnection;

async fn read_rts(stream: &mut DuplexStream) -> RtsPdu {
    let mut header_buf = [0u8; RpcCommonHeader::FIXED_PART_SIZE];
    stream.read_exact(&mut header_buf).await.unwrap();
    let mut cursor = ReadCursor::new(&header_buf);
    let header = RpcCommonHeader::decode(&mut cursor).unwrap();
    let body_len = usize::from(header.frag_length) - RpcCommonHeader::FIXED_PART_SIZE;
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).await.unwrap();
    let mut cursor = ReadCursor::new(&body);
    RtsPdu::decode_body(header, &mut cursor).unwrap()
}

async fn write_rts(stream: &mut DuplexStream, pdu: &RtsPdu) {
    let mut buf = vec![0u8; pdu.full_size()];
    {
        let mut writer = WriteCursor::new(&mut buf);
        pdu.encode_full(&mut writer).unwrap();
    }
    stream.write_all(&buf).await.unwrap();
    stream.flush().await.unwrap();
}

fn test_config() -> GatewayConfig {
    GatewayConfig::new(
        "gateway.example.com",
        Credentials {
            username: "alice".to_owned(),
            password: "hunter2".to_owned(),
            domain: Some("CONTOSO".to_owned()),
        },
        "target-host.example.com",
        3389,
    )
}

#[tokio::test]
async fn establish_reaches_opened_after_conn_a3_and_c2() {
    let (client_in, mut server_in) = tokio::io::duplex(8192);
    let (client_out, mut server_out) = tokio::io::duplex(8192);
    let config = test_config();

    let server = tokio::spawn(async move {
        // CONN/A1 arrives on the OUT channel (§4.5 step 3).
        let conn_a1 = read_rts(&mut server_out).await;
        assert_eq!(conn_a1.flags, RtsFlags::NONE);
        let out_cookie = match conn_a1.commands.as_slice() {
            [RtsCommand::Version(1), RtsCommand::Cookie(_conn), RtsCommand::Cookie(out_cookie), RtsCommand::ReceiveWindowSize(w)] => {
                assert_eq!(*w, GatewayConfig::DEFAULT_RECEIVE_WINDOW);
                *out_cookie
            }
            other => panic!("unexpected CONN/A1 shape: {other:?}"),
        };

        // CONN/B1 arrives on the IN channel (§4.5 step 4).
        let conn_b1 = read_rts(&mut server_in).await;
        match conn_b1.commands.as_slice() {
            [RtsCommand::Version(1), RtsCommand::Cookie(_conn), RtsCommand::Cookie(_in_cookie), RtsCommand::ChannelLifetime(_), RtsCommand::ClientKeepalive(_), RtsCommand::AssociationGroupId(_)] => {}
            other => panic!("unexpected CONN/B1 shape: {other:?}"),
        }

        // Server replies CONN/A3 then CONN/C2, both on the OUT channel (§4.5 step 5).
        let conn_a3 = RtsPdu::new(RtsFlags::NONE, vec![RtsCommand::ConnectionTimeout(60_000)]);
        write_rts(&mut server_out, &conn_a3).await;
        let conn_c2 = RtsPdu::new(
            RtsFlags::NONE,
            vec![
                RtsCommand::Version(1),
                RtsCommand::ReceiveWindowSize(GatewayConfig::DEFAULT_RECEIVE_WINDOW),
                RtsCommand::ConnectionTimeout(60_000),
            ],
        );
        write_rts(&mut server_out, &conn_c2).await;

        out_cookie
    });

    let conn = VirtualConnection::establish(&config, client_in, client_out).await.unwrap();
    let observed_out_cookie = server.await.unwrap();

    assert_eq!(conn.default_out.channel.cookie, observed_out_cookie);
    assert_eq!(conn.default_out.state, rdp_gateway::channel::OutChannelState::Opened);
    assert_eq!(conn.default_in.state, rdp_gateway::channel::InChannelState::Opened);
}
