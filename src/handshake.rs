//! WebSocket opening handshake
//!
//! Parses the HTTP/1.1 Upgrade request, computes `Sec-WebSocket-Accept`,
//! negotiates permessage-deflate and writes the 101 response. Nothing here
//! sends a close frame: a failed handshake just drops the connection.

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::deflate::{self, PERMESSAGE_DEFLATE_RESPONSE};
use crate::error::{Error, Result};
use crate::{Config, WS_GUID};

/// Most headers accepted in an upgrade request
const MAX_HEADERS: usize = 64;

/// WebSocket handshake request (server-side)
#[derive(Debug)]
pub struct HandshakeRequest<'a> {
    /// The request path
    pub path: &'a str,
    /// The Host header
    pub host: Option<&'a str>,
    /// The Sec-WebSocket-Key header
    pub key: &'a str,
    /// Every Sec-WebSocket-Extensions header, in request order
    pub extensions: Vec<&'a str>,
}

impl HandshakeRequest<'_> {
    /// Whether any extensions header offers permessage-deflate
    pub fn offers_deflate(&self) -> bool {
        self.extensions.iter().any(|ext| deflate::is_offered(ext))
    }
}

/// Parse a WebSocket upgrade request
///
/// Returns the parsed request and the number of bytes consumed, or `None`
/// while the blank line ending the header block has not arrived yet.
/// Only the method and `Sec-WebSocket-Key` are enforced.
pub fn parse_request(buf: &[u8]) -> Result<Option<(HandshakeRequest<'_>, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(Error::InvalidHttp("malformed request")),
    };

    if req.method != Some("GET") {
        return Err(Error::InvalidHttp("malformed request: method must be GET"));
    }

    let mut key = None;
    let mut host = None;
    let mut extensions = Vec::new();

    for header in req.headers.iter() {
        let Ok(value) = std::str::from_utf8(header.value) else {
            continue;
        };

        if header.name.eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value.trim());
        } else if header.name.eq_ignore_ascii_case("sec-websocket-extensions") {
            extensions.push(value);
        } else if header.name.eq_ignore_ascii_case("host") {
            host = Some(value);
        }
    }

    let key = key
        .filter(|k| !k.is_empty())
        .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Key"))?;

    Ok(Some((
        HandshakeRequest {
            path: req.path.unwrap_or("/"),
            host,
            key,
            extensions,
        },
        len,
    )))
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Build a WebSocket upgrade response
pub fn build_response(accept_key: &str, extensions: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept_key.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(ext) = extensions {
        buf.put_slice(b"Sec-WebSocket-Extensions: ");
        buf.put_slice(ext.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Build a WebSocket upgrade request, as a client would send it
pub fn build_request(host: &str, path: &str, key: &str, extensions: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"GET ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    buf.put_slice(b"Host: ");
    buf.put_slice(host.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");

    if let Some(ext) = extensions {
        buf.put_slice(b"Sec-WebSocket-Extensions: ");
        buf.put_slice(ext.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Result of a successful handshake
#[derive(Debug)]
pub struct HandshakeResult {
    /// The request path
    pub path: String,
    /// Whether permessage-deflate was negotiated
    pub compression: bool,
    /// Bytes the client sent after the header block (if any)
    pub leftover: Option<Bytes>,
}

/// Perform server-side handshake
///
/// Reads until the end of the header block, then answers with 101.
/// permessage-deflate is accepted only when the client offers it and
/// `config.compression` is set.
pub async fn server_handshake<S>(stream: &mut S, config: &Config) -> Result<HandshakeResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }

        if let Some((req, consumed)) = parse_request(&buf)? {
            let compression = config.compression && req.offers_deflate();

            let accept_key = generate_accept_key(req.key);
            let extensions = compression.then_some(PERMESSAGE_DEFLATE_RESPONSE);
            let response = build_response(&accept_key, extensions);

            tracing::trace!(path = req.path, host = ?req.host, compression, "upgrade request");
            let path = req.path.to_string();

            stream.write_all(&response).await?;
            stream.flush().await?;

            let leftover = (consumed < buf.len()).then(|| buf.split_off(consumed).freeze());

            return Ok(HandshakeResult {
                path,
                compression,
                leftover,
            });
        }

        if buf.len() > config.max_handshake_size {
            return Err(Error::InvalidHttp("request too large"));
        }
    }
}
