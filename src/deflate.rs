//! Per-Message Deflate Extension (RFC 7692)
//!
//! Only the no-context-takeover variant is implemented: every message is
//! compressed and inflated with a freshly reset raw-DEFLATE stream, so no
//! window survives between messages and memory per message stays bounded.

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};

/// Trailer bytes removed after compression and re-added before decompression
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Extension token searched for in `Sec-WebSocket-Extensions`
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Extension response sent whenever a client offers permessage-deflate
pub const PERMESSAGE_DEFLATE_RESPONSE: &str =
    "permessage-deflate; client_no_context_takeover; server_no_context_takeover";

/// Check whether an extensions header offers permessage-deflate
///
/// A case-insensitive substring match; offer parameters are ignored since
/// the response always pins both sides to no_context_takeover.
pub fn is_offered(extensions: &str) -> bool {
    extensions.to_ascii_lowercase().contains(EXTENSION_NAME)
}

/// Deflate compressor for outgoing messages
pub struct DeflateEncoder {
    compress: Compress,
}

impl DeflateEncoder {
    /// Create a new encoder at the given level (0-9)
    pub fn new(level: u32) -> Self {
        Self {
            compress: Compress::new(Compression::new(level.min(9)), false),
        }
    }

    /// Compress a whole message payload
    ///
    /// The stream is sync-flushed and the trailing `00 00 ff ff` is stripped
    /// as RFC 7692 requires. Callers fall back to an uncompressed frame on
    /// error.
    pub fn compress(&mut self, data: &[u8]) -> Result<Bytes> {
        self.compress.reset();

        let base_in = self.compress.total_in();
        let mut output = Vec::with_capacity(data.len() / 2 + 64);

        loop {
            if output.len() == output.capacity() {
                output.reserve(output.capacity().max(4096));
            }

            let consumed = (self.compress.total_in() - base_in) as usize;
            let before_out = output.len();

            self.compress
                .compress_vec(&data[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|e| Error::Compression(format!("deflate error: {e}")))?;

            let now_consumed = (self.compress.total_in() - base_in) as usize;
            let has_room = output.len() < output.capacity();

            // Flush is complete once all input is in and output space was left over
            if now_consumed == data.len() && has_room {
                break;
            }
            if now_consumed == consumed && output.len() == before_out && has_room {
                return Err(Error::Compression("deflate made no progress".into()));
            }
        }

        if output.ends_with(&DEFLATE_TRAILER) {
            output.truncate(output.len() - DEFLATE_TRAILER.len());
        }

        Ok(Bytes::from(output))
    }
}

/// Deflate decompressor for incoming messages
pub struct DeflateDecoder {
    decompress: Decompress,
    max_size: usize,
}

impl DeflateDecoder {
    /// Create a new decoder; inflated output above `max_size` is rejected
    pub fn new(max_size: usize) -> Self {
        Self {
            decompress: Decompress::new(false),
            max_size,
        }
    }

    /// Inflate a whole message payload
    ///
    /// The bytes are first inflated as received. If that does not reach the
    /// end of a final block, the message is inflated once more with the
    /// RFC 7692 tail appended.
    pub fn decompress(&mut self, data: &[u8]) -> Result<Bytes> {
        let initial_cap = (data.len() * 4).max(1024).min(self.max_size + 1);
        let mut output = Vec::with_capacity(initial_cap);

        if self.inflate(data, &mut output)? {
            return Ok(Bytes::from(output));
        }

        let mut with_tail = Vec::with_capacity(data.len() + DEFLATE_TRAILER.len());
        with_tail.extend_from_slice(data);
        with_tail.extend_from_slice(&DEFLATE_TRAILER);

        output.clear();
        self.inflate(&with_tail, &mut output)?;
        Ok(Bytes::from(output))
    }

    /// Run one inflate pass from a reset state
    ///
    /// Returns true when the stream ended with a final block.
    fn inflate(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<bool> {
        self.decompress.reset(false);
        let base_in = self.decompress.total_in();

        loop {
            if output.len() == output.capacity() {
                let room = (self.max_size + 1).saturating_sub(output.len());
                if room == 0 {
                    return Err(Error::MessageTooLarge);
                }
                output.reserve_exact(room.min(output.capacity().max(4096)));
            }

            let consumed = (self.decompress.total_in() - base_in) as usize;
            let before_out = output.len();

            let status = self
                .decompress
                .decompress_vec(&input[consumed..], output, FlushDecompress::Sync)
                .map_err(|e| Error::InvalidCompressedData(e.to_string()))?;

            if output.len() > self.max_size {
                return Err(Error::MessageTooLarge);
            }

            let now_consumed = (self.decompress.total_in() - base_in) as usize;
            let has_room = output.len() < output.capacity();

            match status {
                Status::StreamEnd => return Ok(true),
                Status::Ok | Status::BufError => {
                    if now_consumed == input.len() && has_room {
                        return Ok(false);
                    }
                    if now_consumed == consumed && output.len() == before_out && has_room {
                        return Err(Error::Compression("inflate stalled".into()));
                    }
                }
            }
        }
    }
}
