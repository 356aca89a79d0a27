//! Control protocol: newline-delimited JSON envelopes `{"type": ..., "payload": ...}`.
//!
//! One frame per line. Payload field order is fixed by the structs below so two
//! implementations produce identical bytes.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

pub const MAX_FRAME_BYTES: usize = 1 << 20; // 1 MiB

pub const TYPE_AUTH: &str = "auth";
pub const TYPE_AUTH_RESP: &str = "auth_resp";
pub const TYPE_REG_TUNNEL: &str = "reg_tunnel";
pub const TYPE_REG_RESP: &str = "reg_resp";
pub const TYPE_NEW_CONN: &str = "new_conn";
pub const TYPE_PROXY_DATA: &str = "proxy_data";
pub const TYPE_PING: &str = "ping";
pub const TYPE_PONG: &str = "pong";

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Peer closed the stream on a frame boundary.
    #[error("connection closed")]
    Closed,
    #[error("frame too large (> {MAX_FRAME_BYTES} bytes)")]
    FrameTooLarge,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    pub fn is_closed(&self) -> bool {
        matches!(self, ProtocolError::Closed)
    }
}

/// Compares a presented token with the expected one without early exit.
pub fn token_matches(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegTunnelRequest {
    pub name: String,
    #[serde(default)]
    pub protocol: String,
    /// Wider than a port so out-of-range requests decode and get a `reg_resp`.
    pub remote_port: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegTunnelResponse {
    pub name: String,
    pub success: bool,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConnRequest {
    pub conn_id: String,
    pub tunnel_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDataRequest {
    pub conn_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Auth(AuthRequest),
    AuthResp(AuthResponse),
    RegTunnel(RegTunnelRequest),
    RegResp(RegTunnelResponse),
    NewConn(NewConnRequest),
    ProxyData(ProxyDataRequest),
    Ping,
    Pong,
    /// A type this build does not know. Receivers skip it.
    Unknown(String),
}

impl Message {
    pub fn type_name(&self) -> &str {
        match self {
            Message::Auth(_) => TYPE_AUTH,
            Message::AuthResp(_) => TYPE_AUTH_RESP,
            Message::RegTunnel(_) => TYPE_REG_TUNNEL,
            Message::RegResp(_) => TYPE_REG_RESP,
            Message::NewConn(_) => TYPE_NEW_CONN,
            Message::ProxyData(_) => TYPE_PROXY_DATA,
            Message::Ping => TYPE_PING,
            Message::Pong => TYPE_PONG,
            Message::Unknown(t) => t,
        }
    }
}

#[derive(Serialize)]
struct OutFrame<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    payload: &'a T,
}

#[derive(Deserialize)]
struct InFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Encodes one message as a single `\n`-terminated frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    fn frame<T: Serialize>(kind: &str, payload: &T) -> Result<Vec<u8>, ProtocolError> {
        let mut b = serde_json::to_vec(&OutFrame { kind, payload })?;
        b.push(b'\n');
        Ok(b)
    }

    let unit: Option<()> = None;
    match msg {
        Message::Auth(p) => frame(TYPE_AUTH, p),
        Message::AuthResp(p) => frame(TYPE_AUTH_RESP, p),
        Message::RegTunnel(p) => frame(TYPE_REG_TUNNEL, p),
        Message::RegResp(p) => frame(TYPE_REG_RESP, p),
        Message::NewConn(p) => frame(TYPE_NEW_CONN, p),
        Message::ProxyData(p) => frame(TYPE_PROXY_DATA, p),
        Message::Ping => frame(TYPE_PING, &unit),
        Message::Pong => frame(TYPE_PONG, &unit),
        Message::Unknown(t) => frame(t, &unit),
    }
}

/// Decodes one frame (without or with its trailing newline).
pub fn decode(line: &[u8]) -> Result<Message, ProtocolError> {
    let f: InFrame = serde_json::from_slice(line)?;
    let p = f.payload;
    let msg = match f.kind.as_str() {
        TYPE_AUTH => Message::Auth(serde_json::from_value(p)?),
        TYPE_AUTH_RESP => Message::AuthResp(serde_json::from_value(p)?),
        TYPE_REG_TUNNEL => Message::RegTunnel(serde_json::from_value(p)?),
        TYPE_REG_RESP => Message::RegResp(serde_json::from_value(p)?),
        TYPE_NEW_CONN => Message::NewConn(serde_json::from_value(p)?),
        TYPE_PROXY_DATA => Message::ProxyData(serde_json::from_value(p)?),
        TYPE_PING => Message::Ping,
        TYPE_PONG => Message::Pong,
        _ => Message::Unknown(f.kind),
    };
    Ok(msg)
}

/// Reads frames from a byte stream.
///
/// Bytes past the last decoded frame stay in the inner `BufReader`; `into_inner`
/// hands them over together with the stream.
pub struct MessageReader<R> {
    inner: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(r: R) -> Self {
        Self {
            inner: BufReader::new(r),
            line: Vec::with_capacity(256),
        }
    }

    pub async fn read_message(&mut self) -> Result<Message, ProtocolError> {
        loop {
            // `line` survives cancellation, so a partially read frame is resumed.
            let room = (MAX_FRAME_BYTES + 1).saturating_sub(self.line.len()) as u64;
            let n = (&mut self.inner)
                .take(room)
                .read_until(b'\n', &mut self.line)
                .await?;

            if self.line.last() == Some(&b'\n') {
                if self.line.iter().all(|b| b.is_ascii_whitespace()) {
                    self.line.clear();
                    continue;
                }
                let msg = decode(&self.line);
                self.line.clear();
                return msg;
            }
            if self.line.len() > MAX_FRAME_BYTES {
                return Err(ProtocolError::FrameTooLarge);
            }
            if n == 0 {
                if self.line.iter().all(|b| b.is_ascii_whitespace()) {
                    return Err(ProtocolError::Closed);
                }
                return Err(ProtocolError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }

    pub fn into_inner(self) -> BufReader<R> {
        self.inner
    }
}

pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(w: W) -> Self {
        Self { inner: w }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        let b = encode(msg)?;
        self.inner.write_all(&b).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Closes the write side. Later sends fail.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_matches_reference_bytes() {
        let b = encode(&Message::RegResp(RegTunnelResponse {
            name: "web".into(),
            success: false,
            remote_port: 10080,
            error: "port in use".into(),
        }))
        .unwrap();
        assert_eq!(
            std::str::from_utf8(&b).unwrap(),
            "{\"type\":\"reg_resp\",\"payload\":{\"name\":\"web\",\"success\":false,\"remote_port\":10080,\"error\":\"port in use\"}}\n"
        );

        let b = encode(&Message::AuthResp(AuthResponse {
            success: true,
            error: String::new(),
        }))
        .unwrap();
        assert_eq!(
            std::str::from_utf8(&b).unwrap(),
            "{\"type\":\"auth_resp\",\"payload\":{\"success\":true}}\n"
        );

        let b = encode(&Message::Ping).unwrap();
        assert_eq!(
            std::str::from_utf8(&b).unwrap(),
            "{\"type\":\"ping\",\"payload\":null}\n"
        );
    }

    #[test]
    fn token_compare() {
        assert!(token_matches("secret", "secret"));
        assert!(!token_matches("secret", "secreT"));
        assert!(!token_matches("secret", "secret2"));
        assert!(token_matches("", ""));
    }

    #[test]
    fn decode_tolerates_missing_payload_and_unknown_types() {
        assert_eq!(decode(br#"{"type":"pong"}"#).unwrap(), Message::Pong);
        assert_eq!(
            decode(br#"{"type":"resize","payload":{"x":1}}"#).unwrap(),
            Message::Unknown("resize".into())
        );
        assert!(matches!(
            decode(br#"{"type":"auth","payload":{}}"#),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn reg_tunnel_port_outside_u16_still_decodes() {
        for (raw, port) in [("70000", 70000), ("-1", -1)] {
            let line = format!(
                r#"{{"type":"reg_tunnel","payload":{{"name":"big","protocol":"tcp","remote_port":{raw}}}}}"#
            );
            match decode(line.as_bytes()).unwrap() {
                Message::RegTunnel(req) => assert_eq!(req.remote_port, port),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn reader_splits_stream_into_frames() {
        let (mut a, b) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut buf = encode(&Message::Auth(AuthRequest { token: "t".into() })).unwrap();
            buf.extend(encode(&Message::Ping).unwrap());
            buf.extend(b"{\"type\":\"x-future\"}\n");
            // Split a frame across two writes.
            let tail = encode(&Message::ProxyData(ProxyDataRequest {
                conn_id: "c-1".into(),
            }))
            .unwrap();
            a.write_all(&buf).await.unwrap();
            a.write_all(&tail[..5]).await.unwrap();
            a.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            a.write_all(&tail[5..]).await.unwrap();
        });

        let mut r = MessageReader::new(b);
        assert_eq!(
            r.read_message().await.unwrap(),
            Message::Auth(AuthRequest { token: "t".into() })
        );
        assert_eq!(r.read_message().await.unwrap(), Message::Ping);
        assert_eq!(
            r.read_message().await.unwrap(),
            Message::Unknown("x-future".into())
        );
        assert_eq!(
            r.read_message().await.unwrap(),
            Message::ProxyData(ProxyDataRequest {
                conn_id: "c-1".into()
            })
        );
        assert!(r.read_message().await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn truncated_frame_is_not_a_clean_close() {
        let (mut a, b) = tokio::io::duplex(128);
        tokio::spawn(async move {
            a.write_all(b"{\"type\":\"pi").await.unwrap();
        });
        let mut r = MessageReader::new(b);
        match r.read_message().await.unwrap_err() {
            ProtocolError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let (mut a, b) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let junk = vec![b'a'; 64 * 1024];
            for _ in 0..=(MAX_FRAME_BYTES / junk.len()) {
                if a.write_all(&junk).await.is_err() {
                    return;
                }
            }
        });
        let mut r = MessageReader::new(b);
        assert!(matches!(
            r.read_message().await,
            Err(ProtocolError::FrameTooLarge)
        ));
    }

    #[tokio::test]
    async fn leftover_bytes_survive_into_inner() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut buf = encode(&Message::Pong).unwrap();
        buf.extend(b"raw payload");
        a.write_all(&buf).await.unwrap();
        drop(a);

        let mut r = MessageReader::new(b);
        assert_eq!(r.read_message().await.unwrap(), Message::Pong);
        let mut rest = Vec::new();
        r.into_inner().read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"raw payload");
    }
}
