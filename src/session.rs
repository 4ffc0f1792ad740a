//! Connection session
//!
//! Drives one accepted stream through its whole life:
//! handshake, frame loop, close. The stream is split; the read half stays
//! with the frame loop and the write half moves into a writer task fed by
//! the session's [`Outbox`]. That queue is the only path to the socket,
//! so pongs, broadcasts and close frames never interleave on the wire.
//!
//! A close frame gets `close_timeout` to reach the peer; after that the
//! writer is cancelled and the socket dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::Instrument;

use crate::Config;
use crate::error::{CloseReason, Error, Result};
use crate::handshake::server_handshake;
use crate::hub::{Hub, MessageHandler, SessionId};
use crate::outbox::{self, Outbox, OutboxReceiver};
use crate::protocol::{Message, MessageEncoder, Protocol};

/// Smallest free space kept in the read buffer before each read
const MIN_READ_SPACE: usize = 4096;

/// How a session ended after a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The peer sent a close frame; holds the status echoed back
    PeerClosed(CloseReason),
    /// The engine closed the connection with this status
    Violation(CloseReason),
    /// The transport went away without a close handshake
    Disconnected,
    /// The peer stopped reading and its backlog went over budget
    Overloaded,
}

/// Run a connection session to completion
///
/// Performs the handshake, registers the session with the hub, feeds every
/// complete data message to `handler` and answers control frames. Returns
/// `Err` only for handshake failures and unexpected internal errors; the
/// ordinary ways a connection ends are reported as a [`Termination`].
pub async fn serve_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    hub: Arc<Hub>,
    handler: Arc<dyn MessageHandler>,
    config: Arc<Config>,
) -> Result<Termination>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handshake = match server_handshake(&mut stream, &config).await {
        Ok(handshake) => handshake,
        Err(e) => {
            tracing::debug!(%peer, error = %e, "handshake failed");
            return Err(e);
        }
    };

    let (outbox, rx) = outbox::outbox(config.max_backpressure);
    let id = hub.register(outbox.clone());

    let span = tracing::debug_span!("session", session = %id, %peer);
    async move {
        tracing::debug!(
            path = %handshake.path,
            compression = handshake.compression,
            "session open"
        );

        let (mut reader, writer) = tokio::io::split(stream);
        let encoder = MessageEncoder::new(handshake.compression, config.compression_level);
        let mut writer_task = tokio::spawn(write_loop(writer, rx, encoder).in_current_span());

        let mut buf = BytesMut::with_capacity(config.read_buffer_size);
        if let Some(leftover) = handshake.leftover {
            buf.extend_from_slice(&leftover);
        }
        let mut protocol = Protocol::new(config.max_message_size, handshake.compression);

        handler.on_open(&hub, id);
        let result = read_loop(
            &mut reader,
            &mut buf,
            &mut protocol,
            &outbox,
            id,
            &hub,
            handler.as_ref(),
        )
        .await;

        hub.unregister(id);
        handler.on_close(&hub, id);

        let termination = match result {
            Ok(reason) => Termination::PeerClosed(reason),
            Err(e) => match e.close_reason() {
                Some(reason) => {
                    tracing::debug!(code = reason.code, error = %e, "closing connection");
                    let _ = outbox.push(Message::Close(Some(reason.clone())));
                    Termination::Violation(reason)
                }
                None if matches!(e, Error::Capacity(_)) => {
                    writer_task.abort();
                    tracing::debug!(limit = config.max_backpressure, "peer not reading, dropping");
                    return Ok(Termination::Overloaded);
                }
                None if e.is_disconnect() => {
                    writer_task.abort();
                    tracing::debug!(error = %e, "disconnected");
                    return Ok(Termination::Disconnected);
                }
                None => {
                    writer_task.abort();
                    return Err(e);
                }
            },
        };

        // The writer exits after the close frame; dropping our sender also
        // ends it if the frame could not be queued.
        drop(outbox);
        match tokio::time::timeout(config.close_timeout, &mut writer_task).await {
            Ok(Ok(Err(e))) if !e.is_disconnect() => {
                tracing::debug!(error = %e, "writer failed");
            }
            Ok(_) => {}
            Err(_) => {
                writer_task.abort();
                tracing::debug!("close frame not written in time, dropping");
            }
        }

        tracing::debug!(?termination, "session closed");
        Ok(termination)
    }
    .instrument(span)
    .await
}

/// Read frames until the peer closes or something fails
///
/// Returns the close status to echo when the peer closes cleanly.
async fn read_loop<S>(
    reader: &mut ReadHalf<S>,
    buf: &mut BytesMut,
    protocol: &mut Protocol,
    outbox: &Outbox,
    id: SessionId,
    hub: &Hub,
    handler: &dyn MessageHandler,
) -> Result<CloseReason>
where
    S: AsyncRead,
{
    loop {
        // Deliver everything already buffered before reading again, so
        // messages ahead of a bad frame still reach the handler
        while let Some(msg) = protocol.next_message(buf)? {
            match msg {
                Message::Text(_) | Message::Binary(_) => handler.on_message(hub, id, msg),
                Message::Ping(payload) => {
                    let _ = outbox.push(Message::Pong(payload));
                }
                Message::Pong(_) => {
                    tracing::trace!("pong");
                }
                Message::Close(reason) => {
                    let reply = reason.unwrap_or_else(CloseReason::normal);
                    let _ = outbox.push(Message::Close(Some(reply.clone())));
                    return Ok(reply);
                }
            }
        }

        if buf.capacity() - buf.len() < MIN_READ_SPACE {
            buf.reserve(MIN_READ_SPACE);
        }

        let n = tokio::select! {
            read = reader.read_buf(buf) => read?,
            _ = outbox.overloaded() => {
                return Err(Error::Capacity("outbound backlog over budget"));
            }
        };
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

/// Single writer for a session's socket
///
/// Encodes queued messages, batching whatever is already waiting into one
/// write. Budget is released only once a batch is on the socket. Stops
/// after writing a close frame or once every sender is gone.
async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut rx: OutboxReceiver,
    mut encoder: MessageEncoder,
) -> Result<()>
where
    S: AsyncWrite,
{
    let mut buf = BytesMut::with_capacity(8192);

    while let Some(msg) = rx.recv().await {
        let mut closing = msg.is_close();
        let mut batched = outbox::cost(&msg);
        encoder.encode(&msg, &mut buf);

        while !closing {
            let Some(next) = rx.try_recv() else {
                break;
            };
            closing = next.is_close();
            batched += outbox::cost(&next);
            encoder.encode(&next, &mut buf);
        }

        writer.write_all(&buf).await?;
        buf.clear();
        rx.release(batched);

        if closing {
            break;
        }
    }

    writer.shutdown().await?;
    Ok(())
}
