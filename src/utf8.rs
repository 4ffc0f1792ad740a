//! UTF-8 validation for text payloads and close reasons
//!
//! Backed by `simdutf8`, which picks the widest instruction set available
//! at runtime and falls back to std elsewhere.

/// Validate that the input is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}
