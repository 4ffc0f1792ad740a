//! WebSocket protocol state machine
//!
//! The sans-I/O half of a connection session:
//! - Message fragmentation and reassembly
//! - permessage-deflate inflate on receive and deflate on send
//! - Control frame decoding (ping/pong/close)
//!
//! Bytes go in through [`Protocol::next_message`] and complete messages come
//! out; the caller owns the socket and decides what to send back.

use bytes::{Bytes, BytesMut};

use crate::deflate::{DeflateDecoder, DeflateEncoder};
use crate::error::{CloseReason, Error, Result};
use crate::frame::{Frame, FrameParser, OpCode, encode_frame, encode_frame_with_rsv};
use crate::utf8::validate_utf8;

/// WebSocket message (complete, possibly assembled from fragments)
///
/// Inbound text messages are UTF-8 validated before they are produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message
    Text(Bytes),
    /// Binary message
    Binary(Bytes),
    /// Ping message
    Ping(Bytes),
    /// Pong message
    Pong(Bytes),
    /// Close message, `None` when the payload carried no status code
    Close(Option<CloseReason>),
}

impl Message {
    /// Create a text message from a string
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(Bytes::from(s.into()))
    }

    /// Create a binary message
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    /// Check if this is a close message
    #[inline]
    pub fn is_close(&self) -> bool {
        matches!(self, Message::Close(_))
    }

    /// Check if this is a control message
    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Message::Ping(_) | Message::Pong(_) | Message::Close(_)
        )
    }

    /// Get message as text (returns None for non-text or non-UTF-8 payloads)
    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(b) => simdutf8::basic::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get message payload
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(b) | Message::Binary(b) | Message::Ping(b) | Message::Pong(b) => b,
            Message::Close(_) => &[],
        }
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(Bytes::from(s))
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(v))
    }
}

/// Fragment assembly state
#[derive(Debug)]
enum Assembly {
    /// No message in progress
    Idle,
    /// A fragmented data message is being collected
    Assembling {
        opcode: OpCode,
        compressed: bool,
        buf: BytesMut,
    },
}

/// Server-side protocol handler
///
/// Handles frame parsing, message assembly, decompression and close payload
/// decoding. Control frames may interleave with a fragmented message without
/// disturbing it.
pub struct Protocol {
    parser: FrameParser,
    assembly: Assembly,
    /// Present iff permessage-deflate was negotiated
    decoder: Option<DeflateDecoder>,
}

impl Protocol {
    /// Create a server-side protocol handler
    pub fn new(max_message_size: usize, compression: bool) -> Self {
        let mut parser = FrameParser::new(max_message_size, true);
        parser.set_compression(compression);

        Self {
            parser,
            assembly: Assembly::Idle,
            decoder: compression.then(|| DeflateDecoder::new(max_message_size)),
        }
    }

    /// Bytes buffered for the fragmented message in progress
    #[inline]
    pub fn assembled_len(&self) -> usize {
        match &self.assembly {
            Assembly::Idle => 0,
            Assembly::Assembling { buf, .. } => buf.len(),
        }
    }

    /// Check if a fragmented message is in progress
    #[inline]
    pub fn is_assembling(&self) -> bool {
        matches!(self.assembly, Assembly::Assembling { .. })
    }

    /// Decode the next complete message from the buffer
    ///
    /// Frames are consumed strictly in order. Returns `Ok(None)` when the
    /// buffer holds no further complete message; any partial frame stays in
    /// the buffer for the next call.
    pub fn next_message(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            let Some(frame) = self.parser.parse(buf, self.assembled_len())? else {
                return Ok(None);
            };

            if let Some(msg) = self.handle_frame(frame)? {
                return Ok(Some(msg));
            }
        }
    }

    /// Handle a single parsed frame
    fn handle_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.header.opcode {
            OpCode::Text | OpCode::Binary => self.handle_data(frame),
            OpCode::Continuation => self.handle_continuation(frame),
            OpCode::Ping => Ok(Some(Message::Ping(frame.payload))),
            OpCode::Pong => Ok(Some(Message::Pong(frame.payload))),
            OpCode::Close => {
                // Close ends the connection, any partial message is dropped
                self.assembly = Assembly::Idle;
                Ok(Some(Message::Close(parse_close(&frame.payload)?)))
            }
        }
    }

    /// Handle the first (or only) frame of a data message
    fn handle_data(&mut self, frame: Frame) -> Result<Option<Message>> {
        if self.is_assembling() {
            return Err(Error::Protocol(
                "Received new data frame while continuation expected",
            ));
        }

        let opcode = frame.header.opcode;
        let compressed = frame.header.rsv1;

        if frame.is_final() {
            return self.complete(opcode, compressed, frame.payload, false).map(Some);
        }

        let mut buf = BytesMut::with_capacity(frame.payload.len() * 2);
        buf.extend_from_slice(&frame.payload);
        self.assembly = Assembly::Assembling {
            opcode,
            compressed,
            buf,
        };
        Ok(None)
    }

    /// Handle a continuation frame
    fn handle_continuation(&mut self, frame: Frame) -> Result<Option<Message>> {
        let Assembly::Assembling { buf, .. } = &mut self.assembly else {
            return Err(Error::Protocol("Unexpected continuation"));
        };

        // The parser already bounded buf.len() + payload by the message limit
        buf.extend_from_slice(&frame.payload);

        if !frame.is_final() {
            return Ok(None);
        }

        let Assembly::Assembling {
            opcode,
            compressed,
            buf,
        } = std::mem::replace(&mut self.assembly, Assembly::Idle)
        else {
            return Err(Error::Protocol("Unexpected continuation"));
        };

        self.complete(opcode, compressed, buf.freeze(), true).map(Some)
    }

    /// Inflate and validate a complete message payload
    fn complete(
        &mut self,
        opcode: OpCode,
        compressed: bool,
        payload: Bytes,
        fragmented: bool,
    ) -> Result<Message> {
        let data = if compressed {
            let decoder = self.decoder.as_mut().ok_or(Error::Protocol(
                "RSV1 set but permessage-deflate not negotiated",
            ))?;
            decoder.decompress(&payload)?
        } else {
            payload
        };

        if opcode == OpCode::Text {
            if !validate_utf8(&data) {
                return Err(Error::InvalidUtf8(if fragmented {
                    "Invalid UTF-8 in reassembled text"
                } else {
                    "Invalid UTF-8"
                }));
            }
            Ok(Message::Text(data))
        } else {
            Ok(Message::Binary(data))
        }
    }
}

/// Decode a close frame payload
///
/// Fewer than two bytes carry no status code. The reason, if any, must be
/// UTF-8.
pub fn parse_close(payload: &[u8]) -> Result<Option<CloseReason>> {
    if payload.len() < 2 {
        return Ok(None);
    }

    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = simdutf8::basic::from_utf8(&payload[2..])
        .map_err(|_| Error::InvalidUtf8("Invalid UTF-8 in close reason"))?;

    Ok(Some(CloseReason::new(code, reason)))
}

/// Serializes outbound messages into server frames
///
/// Data messages are compressed whole when permessage-deflate is active and
/// the payload is non-empty. A compression failure degrades to an
/// uncompressed frame rather than dropping the message.
pub struct MessageEncoder {
    deflate: Option<DeflateEncoder>,
}

impl MessageEncoder {
    /// Create an encoder; `compression` reflects the negotiated extension
    pub fn new(compression: bool, level: u32) -> Self {
        Self {
            deflate: compression.then(|| DeflateEncoder::new(level)),
        }
    }

    /// Encode a message as a single unmasked frame
    pub fn encode(&mut self, msg: &Message, buf: &mut BytesMut) {
        match msg {
            Message::Text(b) => self.encode_data(OpCode::Text, b, buf),
            Message::Binary(b) => self.encode_data(OpCode::Binary, b, buf),
            Message::Ping(b) => encode_frame(buf, OpCode::Ping, b, true, None),
            Message::Pong(b) => encode_frame(buf, OpCode::Pong, b, true, None),
            Message::Close(reason) => {
                let payload = reason.as_ref().map(CloseReason::to_payload).unwrap_or_default();
                encode_frame(buf, OpCode::Close, &payload, true, None);
            }
        }
    }

    fn encode_data(&mut self, opcode: OpCode, payload: &[u8], buf: &mut BytesMut) {
        if let Some(deflate) = self.deflate.as_mut().filter(|_| !payload.is_empty()) {
            match deflate.compress(payload) {
                Ok(compressed) => {
                    encode_frame_with_rsv(buf, opcode, &compressed, true, None, true);
                    return;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "compression failed, sending uncompressed");
                }
            }
        }

        encode_frame(buf, opcode, payload, true, None);
    }
}
