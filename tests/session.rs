//! End-to-end session tests over in-memory pipes

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use hubsock::deflate::DeflateEncoder;
use hubsock::frame::{OpCode, encode_frame, encode_frame_with_rsv};
use hubsock::{BroadcastOthers, CloseReason, Config, Echo, Error, Hub, Termination};

use common::*;

async fn echo_client(config: Config, extensions: Option<&str>) -> (
    TestClient<tokio::io::DuplexStream>,
    tokio::task::JoinHandle<hubsock::Result<Termination>>,
) {
    let hub = Arc::new(Hub::new());
    let (stream, handle) = spawn_session(&hub, Arc::new(Echo), config);
    (TestClient::connect(stream, extensions).await, handle)
}

/// Send `frames` and expect the session to close with `code`
async fn assert_violation(frames: &[u8], code: u16, reason: &str) {
    let (mut client, handle) = echo_client(Config::default(), None).await;
    client.send_raw(frames).await;

    let close = client.expect_close().await.unwrap();
    assert_eq!(close.code, code);
    assert_eq!(close.reason, reason);
    client.expect_eof().await;

    assert_eq!(
        handle.await.unwrap().unwrap(),
        Termination::Violation(CloseReason::new(code, reason))
    );
}

#[tokio::test]
async fn test_handshake_accept_key() {
    let (client, _handle) = echo_client(Config::default(), None).await;

    assert!(client.response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(client.response.contains(&format!("Sec-WebSocket-Accept: {ACCEPT}\r\n")));
    assert!(!client.compression_accepted());
}

#[tokio::test]
async fn test_handshake_without_key_fails() {
    let hub = Arc::new(Hub::new());
    let (mut stream, handle) = spawn_session(&hub, Arc::new(Echo), Config::default());

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
        .await
        .unwrap();

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::HandshakeFailed(_)));

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert!(response.is_empty());
    assert_eq!(hub.session_count(), 0);
}

#[tokio::test]
async fn test_fragmented_text() {
    let (mut client, _handle) = echo_client(Config::default(), None).await;

    client.send_frame(OpCode::Text, b"Hello ", false).await;
    client.send_frame(OpCode::Continuation, b"World", true).await;

    let frame = client.next_frame().await.unwrap();
    assert_eq!(frame.header.opcode, OpCode::Text);
    assert!(frame.header.fin);
    assert_eq!(frame.payload.as_ref(), b"Hello World");
}

#[tokio::test]
async fn test_fragmented_binary() {
    let (mut client, _handle) = echo_client(Config::default(), None).await;

    client.send_frame(OpCode::Binary, &[1, 2], false).await;
    client.send_frame(OpCode::Continuation, &[3, 4, 5], true).await;

    let frame = client.next_frame().await.unwrap();
    assert_eq!(frame.header.opcode, OpCode::Binary);
    assert_eq!(frame.payload.as_ref(), &[1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_ping_between_fragments() {
    let (mut client, _handle) = echo_client(Config::default(), None).await;

    client.send_frame(OpCode::Text, b"Hel", false).await;
    client.send_frame(OpCode::Ping, b"are you there", true).await;
    client.send_frame(OpCode::Continuation, b"lo", true).await;

    let pong = client.next_frame().await.unwrap();
    assert_eq!(pong.header.opcode, OpCode::Pong);
    assert_eq!(pong.payload.as_ref(), b"are you there");

    let text = client.next_frame().await.unwrap();
    assert_eq!(text.header.opcode, OpCode::Text);
    assert_eq!(text.payload.as_ref(), b"Hello");
}

#[tokio::test]
async fn test_pipelined_frame_after_handshake() {
    let hub = Arc::new(Hub::new());
    let (stream, _handle) = spawn_session(&hub, Arc::new(Echo), Config::default());

    let early = masked(OpCode::Text, b"early bird", true);
    let mut client = TestClient::connect_pipelined(stream, None, &early).await;

    let frame = client.next_frame().await.unwrap();
    assert_eq!(frame.payload.as_ref(), b"early bird");
}

#[tokio::test]
async fn test_unmasked_frame() {
    assert_violation(&[0x81, 0x02, b'h', b'i'], 1002, "Client frames MUST be masked").await;
}

#[tokio::test]
async fn test_oversized_ping() {
    let frame = masked(OpCode::Ping, &[0u8; 200], true);
    assert_violation(&frame, 1002, "Control frame too large").await;
}

#[tokio::test]
async fn test_fragmented_ping() {
    let frame = masked(OpCode::Ping, b"x", false);
    assert_violation(&frame, 1002, "Control frames must not be fragmented").await;
}

#[tokio::test]
async fn test_invalid_utf8_text() {
    let frame = masked(OpCode::Text, &[0xC3, 0x28], true);
    assert_violation(&frame, 1007, "Invalid UTF-8").await;
}

#[tokio::test]
async fn test_invalid_utf8_across_fragments() {
    let mut frames = masked(OpCode::Text, b"ok \xC3", false);
    frames.extend_from_slice(&masked(OpCode::Continuation, b"\x28", true));
    assert_violation(&frames, 1007, "Invalid UTF-8 in reassembled text").await;
}

#[tokio::test]
async fn test_reserved_opcode() {
    let mut frame = vec![0x8B, 0x80];
    frame.extend_from_slice(&random_mask());
    assert_violation(&frame, 1003, "Unsupported opcode").await;
}

#[tokio::test]
async fn test_unexpected_continuation() {
    let frame = masked(OpCode::Continuation, b"orphan", true);
    assert_violation(&frame, 1002, "Unexpected continuation").await;
}

#[tokio::test]
async fn test_new_message_during_fragment() {
    let mut frames = masked(OpCode::Text, b"first", false);
    frames.extend_from_slice(&masked(OpCode::Text, b"second", true));
    assert_violation(
        &frames,
        1002,
        "Received new data frame while continuation expected",
    )
    .await;
}

#[tokio::test]
async fn test_rsv1_without_negotiation() {
    let compressed = DeflateEncoder::new(6).compress(b"sneaky").unwrap();
    let mut frame = BytesMut::new();
    encode_frame_with_rsv(&mut frame, OpCode::Text, &compressed, true, Some(random_mask()), true);
    assert_violation(&frame, 1002, "RSV1 set but permessage-deflate not negotiated").await;
}

#[tokio::test]
async fn test_message_too_large() {
    let config = Config::builder().max_message_size(16).build();
    let (mut client, handle) = echo_client(config, None).await;

    client.send_frame(OpCode::Binary, &[7u8; 10], false).await;
    client.send_frame(OpCode::Continuation, &[7u8; 10], true).await;

    let close = client.expect_close().await.unwrap();
    assert_eq!(close.code, 1009);
    assert!(matches!(handle.await.unwrap().unwrap(), Termination::Violation(_)));
}

#[tokio::test]
async fn test_valid_messages_before_violation_are_delivered() {
    let mut frames = masked(OpCode::Text, b"ok", true);
    frames.extend_from_slice(&[0x81, 0x00]);

    let (mut client, _handle) = echo_client(Config::default(), None).await;
    client.send_raw(&frames).await;

    let echoed = client.next_frame().await.unwrap();
    assert_eq!(echoed.payload.as_ref(), b"ok");
    assert_eq!(client.expect_close().await.unwrap().code, 1002);
}

#[tokio::test]
async fn test_ping_pong() {
    let (mut client, _handle) = echo_client(Config::default(), None).await;

    client.send_frame(OpCode::Ping, b"hb-1", true).await;
    let pong = client.next_frame().await.unwrap();
    assert_eq!(pong.header.opcode, OpCode::Pong);
    assert_eq!(pong.payload.as_ref(), b"hb-1");

    // Unsolicited pongs are ignored
    client.send_frame(OpCode::Pong, b"late", true).await;
    client.send_text("still here").await;
    assert_eq!(client.next_frame().await.unwrap().payload.as_ref(), b"still here");
}

#[tokio::test]
async fn test_close_echo() {
    let (mut client, handle) = echo_client(Config::default(), None).await;

    client.send_close(1000, "bye").await;
    assert_eq!(client.expect_close().await, Some(CloseReason::new(1000, "bye")));
    client.expect_eof().await;

    assert_eq!(
        handle.await.unwrap().unwrap(),
        Termination::PeerClosed(CloseReason::new(1000, "bye"))
    );
}

#[tokio::test]
async fn test_close_echoes_application_code() {
    let (mut client, _handle) = echo_client(Config::default(), None).await;

    client.send_close(4001, "custom").await;
    assert_eq!(client.expect_close().await, Some(CloseReason::new(4001, "custom")));
}

#[tokio::test]
async fn test_empty_close() {
    let (mut client, handle) = echo_client(Config::default(), None).await;

    client.send_frame(OpCode::Close, &[], true).await;
    assert_eq!(client.expect_close().await, Some(CloseReason::normal()));
    assert_eq!(
        handle.await.unwrap().unwrap(),
        Termination::PeerClosed(CloseReason::normal())
    );
}

#[tokio::test]
async fn test_one_byte_close() {
    let (mut client, _handle) = echo_client(Config::default(), None).await;

    client.send_frame(OpCode::Close, &[0x03], true).await;
    assert_eq!(client.expect_close().await.unwrap().code, 1000);
}

#[tokio::test]
async fn test_close_reason_invalid_utf8() {
    let frame = masked(OpCode::Close, &[0x03, 0xE8, 0xC3, 0x28], true);
    assert_violation(&frame, 1007, "Invalid UTF-8 in close reason").await;
}

#[tokio::test]
async fn test_compressed_round_trip() {
    let (mut client, _handle) = echo_client(Config::default(), Some("permessage-deflate")).await;
    assert!(client.compression_accepted());
    assert!(client.response.contains("client_no_context_takeover; server_no_context_takeover"));

    let text = "compress me please, compress me please, compress me please";
    client.send_compressed(OpCode::Text, text.as_bytes()).await;

    let frame = client.next_frame().await.unwrap();
    assert!(frame.header.rsv1);
    assert!(frame.payload.len() < text.len());

    client.send_compressed(OpCode::Binary, &[0xAB; 4096]).await;
    let (opcode, payload) = client.next_payload().await;
    assert_eq!(opcode, OpCode::Binary);
    assert_eq!(payload, vec![0xAB; 4096]);
}

#[tokio::test]
async fn test_compressed_fragments() {
    let (mut client, _handle) = echo_client(Config::default(), Some("permessage-deflate")).await;

    let text = "fragmented and compressed ".repeat(20);
    let compressed = DeflateEncoder::new(9).compress(text.as_bytes()).unwrap();
    let (head, tail) = compressed.split_at(compressed.len() / 2);

    let mut frames = BytesMut::new();
    encode_frame_with_rsv(&mut frames, OpCode::Text, head, false, Some(random_mask()), true);
    encode_frame(&mut frames, OpCode::Continuation, tail, true, Some(random_mask()));
    client.send_raw(&frames).await;

    let (opcode, payload) = client.next_payload().await;
    assert_eq!(opcode, OpCode::Text);
    assert_eq!(payload, text.as_bytes());
}

#[tokio::test]
async fn test_uncompressed_message_on_deflate_session() {
    let (mut client, _handle) = echo_client(Config::default(), Some("permessage-deflate")).await;

    client.send_text("plain").await;
    let (opcode, payload) = client.next_payload().await;
    assert_eq!(opcode, OpCode::Text);
    assert_eq!(payload, b"plain");
}

#[tokio::test]
async fn test_empty_message_not_compressed() {
    let (mut client, _handle) = echo_client(Config::default(), Some("permessage-deflate")).await;

    client.send_text("").await;
    let frame = client.next_frame().await.unwrap();
    assert!(!frame.header.rsv1);
    assert!(frame.payload.is_empty());
}

#[tokio::test]
async fn test_broadcast_excludes_sender() {
    let hub = Arc::new(Hub::new());
    let (a, _ha) = spawn_session(&hub, Arc::new(BroadcastOthers), Config::default());
    let (b, _hb) = spawn_session(&hub, Arc::new(BroadcastOthers), Config::default());
    let (c, _hc) = spawn_session(&hub, Arc::new(BroadcastOthers), Config::default());

    let mut a = TestClient::connect(a, None).await;
    let mut b = TestClient::connect(b, None).await;
    let mut c = TestClient::connect(c, None).await;
    wait_for_sessions(&hub, 3).await;

    a.send_text("hi").await;

    for client in [&mut b, &mut c] {
        let frame = client.next_frame().await.unwrap();
        assert_eq!(frame.header.opcode, OpCode::Text);
        assert_eq!(frame.payload.as_ref(), b"hi");

        // Nothing else was queued ahead of the close reply
        client.send_close(1000, "").await;
        assert_eq!(client.expect_close().await.unwrap().code, 1000);
    }

    a.send_close(1000, "").await;
    assert_eq!(a.expect_close().await.unwrap().code, 1000);
    assert_eq!(hub.messages_published(), 1);
}

#[tokio::test]
async fn test_broadcast_to_compressed_and_plain_peers() {
    let hub = Arc::new(Hub::new());
    let (a, _ha) = spawn_session(&hub, Arc::new(BroadcastOthers), Config::default());
    let (b, _hb) = spawn_session(&hub, Arc::new(BroadcastOthers), Config::default());
    let (c, _hc) = spawn_session(&hub, Arc::new(BroadcastOthers), Config::default());

    let mut a = TestClient::connect(a, None).await;
    let mut b = TestClient::connect(b, Some("permessage-deflate")).await;
    let mut c = TestClient::connect(c, None).await;
    wait_for_sessions(&hub, 3).await;

    let text = "shared news shared news shared news";
    a.send_text(text).await;

    let plain = c.next_frame().await.unwrap();
    assert!(!plain.header.rsv1);
    assert_eq!(plain.payload.as_ref(), text.as_bytes());

    let (opcode, payload) = b.next_payload().await;
    assert_eq!(opcode, OpCode::Text);
    assert_eq!(payload, text.as_bytes());
}

#[tokio::test]
async fn test_disconnect_unregisters() {
    let hub = Arc::new(Hub::new());
    let (stream, handle) = spawn_session(&hub, Arc::new(Echo), Config::default());
    let client = TestClient::connect(stream, None).await;
    wait_for_sessions(&hub, 1).await;

    drop(client);
    assert_eq!(handle.await.unwrap().unwrap(), Termination::Disconnected);
    assert_eq!(hub.session_count(), 0);
}

#[tokio::test]
async fn test_closure_handler() {
    let hub = Arc::new(Hub::new());
    let upper = |hub: &Hub, from: hubsock::SessionId, msg: hubsock::Message| {
        if let Some(text) = msg.as_text() {
            hub.send_to(from, hubsock::Message::text(text.to_uppercase()));
        }
    };
    let (stream, _handle) = spawn_session(&hub, Arc::new(upper), Config::default());
    let mut client = TestClient::connect(stream, None).await;

    client.send_text("shout").await;
    assert_eq!(client.next_frame().await.unwrap().payload.as_ref(), b"SHOUT");
}

#[tokio::test]
async fn test_close_with_stalled_reader() {
    let hub = Arc::new(Hub::new());
    let config = Config::builder()
        .close_timeout(Duration::from_millis(200))
        .build();
    let (stream, handle) = spawn_session_with_capacity(&hub, Arc::new(Echo), config, 4096);
    let mut client = TestClient::connect(stream, None).await;

    // Echoes pile up behind a pipe nobody drains
    for _ in 0..8 {
        client.send_frame(OpCode::Binary, &[7u8; 2048], true).await;
    }
    client.send_raw(&[0x81, 0x00]).await;

    let termination = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("session stuck on an unread close frame")
        .unwrap()
        .unwrap();
    assert_eq!(
        termination,
        Termination::Violation(CloseReason::new(1002, "Client frames MUST be masked"))
    );
    assert_eq!(hub.session_count(), 0);
}

#[tokio::test]
async fn test_slow_consumer_is_dropped() {
    let hub = Arc::new(Hub::new());
    let config = Config::builder().max_backpressure(32 * 1024).build();

    let (fast, _hf) = spawn_session(&hub, Arc::new(BroadcastOthers), config.clone());
    let (slow, slow_handle) =
        spawn_session_with_capacity(&hub, Arc::new(BroadcastOthers), config, 4096);

    let mut fast = TestClient::connect(fast, None).await;
    let _slow = TestClient::connect(slow, None).await;
    wait_for_sessions(&hub, 2).await;

    for _ in 0..16 {
        fast.send_frame(OpCode::Binary, &[1u8; 8 * 1024], true).await;
    }

    let termination = tokio::time::timeout(Duration::from_secs(5), slow_handle)
        .await
        .expect("slow session never dropped")
        .unwrap()
        .unwrap();
    assert_eq!(termination, Termination::Overloaded);
    wait_for_sessions(&hub, 1).await;

    // The fast session is unaffected
    fast.send_close(1000, "").await;
    assert_eq!(fast.expect_close().await.unwrap().code, 1000);
}
