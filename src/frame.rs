//! WebSocket frame parsing and serialization
//!
//! RFC 6455 section 5 framing:
//! - Incremental parsing straight out of the read buffer
//! - 7/16/64-bit payload length encoding
//! - Masking of client frames
//! - Header validation in a fixed order, each failure mapping to a close code

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::mask::apply_mask;
use crate::{
    MAX_CONTROL_PAYLOAD, MAX_FRAME_HEADER_SIZE, MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD,
};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1 (permessage-deflate)
    pub rsv1: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Payload length
    pub payload_len: u64,
    /// Masking key (if masked)
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Get the total header size in bytes
    #[inline]
    pub fn header_size(&self) -> usize {
        let len_size = if self.payload_len > MEDIUM_MESSAGE_THRESHOLD as u64 {
            8
        } else if self.payload_len > SMALL_MESSAGE_THRESHOLD as u64 {
            2
        } else {
            0
        };

        2 + len_size + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Encode the frame header into a buffer
    #[inline]
    pub fn encode(&self, buf: &mut BytesMut) {
        // First byte: FIN, RSV1, opcode. RSV2/RSV3 are never set.
        let mut b0 = self.opcode as u8;
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        buf.put_u8(b0);

        // Second byte: mask flag, payload length
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };

        if self.payload_len <= SMALL_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(self.payload_len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(self.payload_len);
        }

        if let Some(mask) = self.mask {
            buf.put_slice(&mask);
        }
    }
}

/// A complete WebSocket frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Frame payload (already unmasked)
    pub payload: Bytes,
}

impl Frame {
    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.header.opcode.is_control()
    }

    /// Check if this is the final fragment
    #[inline]
    pub fn is_final(&self) -> bool {
        self.header.fin
    }
}

/// Frame parser state machine
#[derive(Debug)]
enum ParseState {
    /// Waiting for a complete header (base, extended length and mask key)
    Header,
    /// Header consumed, waiting for the payload
    Payload(FrameHeader),
}

/// Incremental frame parser
///
/// Header bytes stay in the buffer until the whole header (at most 14
/// bytes) has arrived, so short reads never lose state. The payload is
/// split off the buffer without copying once it is complete.
#[derive(Debug)]
pub struct FrameParser {
    state: ParseState,
    /// Maximum message size, checked against payload + already assembled bytes
    max_message_size: usize,
    /// Whether to expect masked frames (server mode)
    expect_masked: bool,
    /// Whether RSV1 is allowed (compression negotiated)
    allow_rsv1: bool,
}

impl FrameParser {
    /// Create a new frame parser
    pub fn new(max_message_size: usize, expect_masked: bool) -> Self {
        Self {
            state: ParseState::Header,
            max_message_size,
            expect_masked,
            allow_rsv1: false,
        }
    }

    /// Enable or disable RSV1 (compression) support
    pub fn set_compression(&mut self, enabled: bool) {
        self.allow_rsv1 = enabled;
    }

    /// Parse a frame from the buffer
    ///
    /// `assembled` is the number of bytes already buffered for the message
    /// in progress; data frames that would push the total past the maximum
    /// message size are rejected before their payload is read.
    ///
    /// Returns:
    /// - Ok(Some(frame)) if a complete frame was parsed
    /// - Ok(None) if more data is needed
    /// - Err(e) on the first violated rule
    pub fn parse(&mut self, buf: &mut BytesMut, assembled: usize) -> Result<Option<Frame>> {
        let header = match std::mem::replace(&mut self.state, ParseState::Header) {
            ParseState::Payload(header) => header,
            ParseState::Header => match self.parse_header(buf, assembled)? {
                Some(header) => header,
                None => return Ok(None),
            },
        };

        // Bounded by max_message_size or MAX_CONTROL_PAYLOAD at this point
        let payload_len = header.payload_len as usize;
        if buf.len() < payload_len {
            buf.reserve(payload_len - buf.len());
            self.state = ParseState::Payload(header);
            return Ok(None);
        }

        let mut payload = buf.split_to(payload_len);
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some(Frame {
            header,
            payload: payload.freeze(),
        }))
    }

    /// Decode and validate a header, consuming it only once complete
    fn parse_header(&self, buf: &mut BytesMut, assembled: usize) -> Result<Option<FrameHeader>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];

        let fin = b0 & 0x80 != 0;
        let rsv1 = b0 & 0x40 != 0;
        let rsv2 = b0 & 0x20 != 0;
        let rsv3 = b0 & 0x10 != 0;
        let raw_opcode = b0 & 0x0F;
        let masked = b1 & 0x80 != 0;
        let len_byte = b1 & 0x7F;

        // Extended payload length
        let (payload_len, len_end) = match len_byte {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(len);
                if len >> 63 != 0 {
                    return Err(Error::Protocol("Invalid length: 64-bit MSB set"));
                }
                (len, 10)
            }
            n => (n as u64, 2),
        };

        if rsv2 || rsv3 {
            return Err(Error::Protocol("RSV2/RSV3 not supported"));
        }
        if rsv1 && !self.allow_rsv1 {
            return Err(Error::Protocol(
                "RSV1 set but permessage-deflate not negotiated",
            ));
        }
        if self.expect_masked && !masked {
            return Err(Error::Protocol("Client frames MUST be masked"));
        }
        if !self.expect_masked && masked {
            return Err(Error::Protocol("Server frames must not be masked"));
        }

        // High bit of the opcode nibble marks a control frame, known or not
        let is_control = raw_opcode & 0x08 != 0;
        if is_control && !fin {
            return Err(Error::Protocol("Control frames must not be fragmented"));
        }
        if is_control && payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(Error::Protocol("Control frame too large"));
        }
        if !is_control
            && payload_len.saturating_add(assembled as u64) > self.max_message_size as u64
        {
            return Err(Error::MessageTooLarge);
        }

        let opcode = OpCode::from_u8(raw_opcode).ok_or(Error::UnsupportedOpcode(raw_opcode))?;

        // Compression is signalled on the first frame of a data message only
        if rsv1 && !matches!(opcode, OpCode::Text | OpCode::Binary) {
            return Err(Error::Protocol(
                "RSV1 set on a control or continuation frame",
            ));
        }

        let header_end = len_end + if masked { 4 } else { 0 };
        debug_assert!(header_end <= MAX_FRAME_HEADER_SIZE);
        if buf.len() < header_end {
            return Ok(None);
        }

        let mask = if masked {
            Some([buf[len_end], buf[len_end + 1], buf[len_end + 2], buf[len_end + 3]])
        } else {
            None
        };

        buf.advance(header_end);

        Ok(Some(FrameHeader {
            fin,
            rsv1,
            opcode,
            payload_len,
            mask,
        }))
    }
}

/// Encode a frame into a buffer
///
/// Server frames pass `None` for the mask. With a mask (client mode) the
/// payload is copied and masked in place.
#[inline]
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    encode_frame_with_rsv(buf, opcode, payload, fin, mask, false)
}

/// Encode a frame with RSV1 bit control (for compression)
///
/// When `rsv1` is true, sets the RSV1 bit indicating compressed data.
pub fn encode_frame_with_rsv(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
    rsv1: bool,
) {
    let header = FrameHeader {
        fin,
        rsv1,
        opcode,
        payload_len: payload.len() as u64,
        mask,
    };

    buf.reserve(header.header_size() + payload.len());
    header.encode(buf);

    let start = buf.len();
    buf.put_slice(payload);
    if let Some(m) = mask {
        apply_mask(&mut buf[start..], m);
    }
}
