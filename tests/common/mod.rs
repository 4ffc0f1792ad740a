#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```ignore
//! mod common;
//! use common::*;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

use hubsock::deflate::{DeflateDecoder, DeflateEncoder};
use hubsock::frame::{Frame, FrameParser, OpCode, encode_frame, encode_frame_with_rsv};
use hubsock::handshake::build_request;
use hubsock::protocol::parse_close;
use hubsock::{CloseReason, Config, Hub, MessageHandler, Result, Termination, serve_connection};

/// Key from the RFC 6455 worked example
pub const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

/// Accept value the server must answer `KEY` with
pub const ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

const TIMEOUT: Duration = Duration::from_secs(5);

pub fn peer() -> SocketAddr {
    "127.0.0.1:50000".parse().unwrap()
}

pub fn random_mask() -> [u8; 4] {
    fastrand::u32(..).to_ne_bytes()
}

/// Run a session over an in-memory pipe and return the client end
pub fn spawn_session(
    hub: &Arc<Hub>,
    handler: Arc<dyn MessageHandler>,
    config: Config,
) -> (DuplexStream, JoinHandle<Result<Termination>>) {
    spawn_session_with_capacity(hub, handler, config, 256 * 1024)
}

/// Like `spawn_session`, over a pipe that buffers at most `capacity` bytes
/// in each direction
pub fn spawn_session_with_capacity(
    hub: &Arc<Hub>,
    handler: Arc<dyn MessageHandler>,
    config: Config,
    capacity: usize,
) -> (DuplexStream, JoinHandle<Result<Termination>>) {
    let (client, server) = tokio::io::duplex(capacity);
    let handle = tokio::spawn(serve_connection(
        server,
        peer(),
        Arc::clone(hub),
        handler,
        Arc::new(config),
    ));
    (client, handle)
}

/// Wait until the hub holds `n` sessions
pub async fn wait_for_sessions(hub: &Hub, n: usize) {
    tokio::time::timeout(TIMEOUT, async {
        while hub.session_count() != n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sessions never registered");
}

/// Encode a masked client frame
pub fn masked(opcode: OpCode, payload: &[u8], fin: bool) -> BytesMut {
    let mut buf = BytesMut::new();
    encode_frame(&mut buf, opcode, payload, fin, Some(random_mask()));
    buf
}

/// A minimal masking client speaking raw frames
pub struct TestClient<S> {
    stream: S,
    buf: BytesMut,
    parser: FrameParser,
    /// Raw 101 response head
    pub response: String,
}

impl<S> TestClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send the upgrade request and read the response head
    pub async fn connect(stream: S, extensions: Option<&str>) -> Self {
        Self::connect_pipelined(stream, extensions, &[]).await
    }

    /// Like `connect`, with `early` written in the same burst as the request
    pub async fn connect_pipelined(mut stream: S, extensions: Option<&str>, early: &[u8]) -> Self {
        let mut request = BytesMut::from(&build_request("localhost", "/", KEY, extensions)[..]);
        request.extend_from_slice(early);
        stream.write_all(&request).await.unwrap();

        let mut buf = BytesMut::with_capacity(4096);
        let head_len = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = tokio::time::timeout(TIMEOUT, stream.read_buf(&mut buf))
                .await
                .expect("handshake timed out")
                .unwrap();
            assert!(n > 0, "connection closed during handshake");
        };

        let head = buf.split_to(head_len);
        let response = String::from_utf8(head.to_vec()).unwrap();

        let mut parser = FrameParser::new(64 * 1024 * 1024, false);
        parser.set_compression(true);

        Self {
            stream,
            buf,
            parser,
            response,
        }
    }

    pub fn compression_accepted(&self) -> bool {
        self.response.contains("Sec-WebSocket-Extensions: permessage-deflate")
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    pub async fn send_frame(&mut self, opcode: OpCode, payload: &[u8], fin: bool) {
        self.send_raw(&masked(opcode, payload, fin)).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.send_frame(OpCode::Text, text.as_bytes(), true).await;
    }

    /// Send a whole message compressed into one RSV1 frame
    pub async fn send_compressed(&mut self, opcode: OpCode, payload: &[u8]) {
        let compressed = DeflateEncoder::new(6).compress(payload).unwrap();
        let mut buf = BytesMut::new();
        encode_frame_with_rsv(&mut buf, opcode, &compressed, true, Some(random_mask()), true);
        self.send_raw(&buf).await;
    }

    pub async fn send_close(&mut self, code: u16, reason: &str) {
        let payload = CloseReason::new(code, reason).to_payload();
        self.send_frame(OpCode::Close, &payload, true).await;
    }

    /// Read the next server frame, `None` once the server hung up
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.parser.parse(&mut self.buf, 0).unwrap() {
                return Some(frame);
            }
            let n = tokio::time::timeout(TIMEOUT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for a frame")
                .ok()?;
            if n == 0 {
                return None;
            }
        }
    }

    /// Read the next frame, inflating it when RSV1 is set
    pub async fn next_payload(&mut self) -> (OpCode, Vec<u8>) {
        let frame = self.next_frame().await.expect("connection closed");
        let payload = if frame.header.rsv1 {
            DeflateDecoder::new(64 * 1024 * 1024)
                .decompress(&frame.payload)
                .unwrap()
                .to_vec()
        } else {
            frame.payload.to_vec()
        };
        (frame.header.opcode, payload)
    }

    /// Read the next frame, which must be a close frame
    pub async fn expect_close(&mut self) -> Option<CloseReason> {
        let frame = self.next_frame().await.expect("connection closed without a close frame");
        assert_eq!(frame.header.opcode, OpCode::Close, "expected close, got {frame:?}");
        parse_close(&frame.payload).unwrap()
    }

    /// Assert the server closed the transport
    pub async fn expect_eof(&mut self) {
        assert!(self.next_frame().await.is_none());
    }
}
