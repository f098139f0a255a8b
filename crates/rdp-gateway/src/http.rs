//! Minimal HTTP/1.1 client (C4, §4.4): builds `RPC_IN_DATA`/`RPC_OUT_DATA` request heads,
//! parses response status lines and headers, and extracts the NTLM challenge from a 401
//! `WWW-Authenticate` header. Deliberately not a general-purpose HTTP client: the gateway
//! only ever sends one request per TLS connection and then streams a raw RPC byte pipe
//! through it, so there is no request pipelining, no response-body framing beyond what the
//! 401 handshake needs, and chunked transfer-encoding is only decoded for that handshake
//! body (never for the long-poll RPC payload itself, which ignores `Content-Length`).

use std::io;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{GatewayError, GatewayResult};

/// Sentinel `Content-Length` advertised on the IN channel (§4.4): the client never knows
/// up front how many bytes it will eventually stream, so it claims an effectively unbounded
/// body and keeps writing until the channel is torn down.
pub const IN_CHANNEL_CONTENT_LENGTH: u64 = 0x4000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcHttpMethod {
    RpcInData,
    RpcOutData,
}

impl RpcHttpMethod {
    fn as_str(self) -> &'static str {
        match self {
            Self::RpcInData => "RPC_IN_DATA",
            Self::RpcOutData => "RPC_OUT_DATA",
        }
    }
}

/// Parameters for one `RPC_IN_DATA`/`RPC_OUT_DATA` request (§4.4 mandatory headers).
pub struct RequestParams<'a> {
    pub method: RpcHttpMethod,
    pub gateway_host: &'a str,
    pub session_id: uuid::Uuid,
    pub content_length: u64,
    /// `Authorization: NTLM <base64>` value, present from the second request of the 401
    /// handshake onward.
    pub ntlm_authorization: Option<&'a [u8]>,
}

/// Writes the request line and headers (no body) for one RPC-over-HTTP leg.
pub async fn write_request_head<W>(writer: &mut W, params: &RequestParams<'_>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = String::new();
    head.push_str(&format!("{} /rpc/rpcproxy.dll?localhost:3388 HTTP/1.1\r\n", params.method.as_str()));
    head.push_str(&format!("Host: {}\r\n", params.gateway_host));
    head.push_str(&format!("Content-Length: {}\r\n", params.content_length));
    head.push_str("Accept: application/rpc\r\n");
    head.push_str("Cache-Control: no-cache\r\n");
    head.push_str("Connection: Keep-Alive\r\n");
    head.push_str("User-Agent: MSRPC\r\n");
    head.push_str(&format!(
        "Pragma: ResourceTypeUuid=44e265dd-7daf-42cd-8560-3cdb6e7a2729, SessionId={}\r\n",
        params.session_id
    ));
    if let Some(token) = params.ntlm_authorization {
        head.push_str(&format!("Authorization: NTLM {}\r\n", BASE64.encode(token)));
    }
    head.push_str("\r\n");

    writer.write_all(head.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Extracts the base64 NTLM token from a `WWW-Authenticate: NTLM <token>` header
    /// (§4.4: "401 with `WWW-Authenticate: NTLM <b64>` drives NTLM round trips").
    pub fn ntlm_challenge(&self) -> Option<Vec<u8>> {
        let value = self.header("WWW-Authenticate")?;
        let token = value.strip_prefix("NTLM ")?.trim();
        if token.is_empty() {
            return None;
        }
        BASE64.decode(token).ok()
    }
}

/// Reads one HTTP response head (status line + headers, up to the blank line) from `reader`,
/// one byte at a time. The underlying socket is a long-poll RPC tunnel so buffered bulk reads
/// would risk consuming RPC payload bytes that follow the header on the same TCP segment.
pub async fn read_response_head<R>(reader: &mut R) -> GatewayResult<ResponseHead>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut lines = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                break;
            }
            lines.push(std::mem::take(&mut line));
        } else {
            line.push(byte[0]);
        }
    }

    let status_line = lines.first().ok_or_else(|| GatewayError::other("http::read_head", "missing status line"))?;
    let status_line = String::from_utf8_lossy(status_line);
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| GatewayError::other("http::read_head", "malformed status line"))?;

    let mut headers = Vec::with_capacity(lines.len().saturating_sub(1));
    for raw in &lines[1..] {
        let text = String::from_utf8_lossy(raw);
        if let Some((name, value)) = text.split_once(':') {
            headers.push((name.trim().to_owned(), value.trim().to_owned()));
        }
    }

    Ok(ResponseHead { status, headers })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_status_and_headers() {
        let raw = b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: NTLM dGVzdA==\r\nContent-Length: 0\r\n\r\n";
        let mut cursor = &raw[..];
        let head = read_response_head(&mut cursor).await.unwrap();
        assert_eq!(head.status, 401);
        assert_eq!(head.ntlm_challenge().unwrap(), b"test");
    }

    #[tokio::test]
    async fn request_head_carries_mandatory_headers() {
        let mut buf = Vec::new();
        let params = RequestParams {
            method: RpcHttpMethod::RpcInData,
            gateway_host: "gw.example.com",
            session_id: uuid::Uuid::nil(),
            content_length: IN_CHANNEL_CONTENT_LENGTH,
            ntlm_authorization: None,
        };
        write_request_head(&mut buf, &params).await.unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("RPC_IN_DATA "));
        assert!(text.contains("Accept: application/rpc\r\n"));
        assert!(text.contains("User-Agent: MSRPC\r\n"));
        assert!(text.contains(&format!("Content-Length: {IN_CHANNEL_CONTENT_LENGTH}\r\n")));
    }
}
