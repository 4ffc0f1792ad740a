//! # hubsock: a single-room WebSocket broadcast engine
//!
//! A from-scratch RFC 6455 server engine over raw stream sockets:
//!
//! - **Handshake**: HTTP/1.1 Upgrade parsing and `Sec-WebSocket-Accept` computation
//! - **Frame codec**: header bits, 7/16/64-bit lengths, masking
//! - **Fragmentation**: reassembly of continuation frames with a bounded buffer
//! - **Control frames**: ping/pong and the echoing close handshake
//! - **permessage-deflate**: RFC 7692, no-context-takeover variant
//! - **Hub**: process-wide session registry with best-effort fan-out
//! - **Backpressure**: per-session outbound byte budget; peers that stop
//!   reading are dropped
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hubsock::{BroadcastOthers, Config, Hub, Server};
//!
//! let config = Config::builder().max_workers(64).build();
//! let server = Server::new(config, Arc::new(Hub::new()), Arc::new(BroadcastOthers));
//! let listener = server.bind("0.0.0.0:8080".parse()?)?;
//! server.serve(listener).await?;
//! ```

use std::time::Duration;

pub mod deflate;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod hub;
pub mod mask;
pub mod outbox;
pub mod protocol;
pub mod server;
pub mod session;
pub mod utf8;

pub use error::{CloseReason, Error, Result};
pub use frame::{Frame, OpCode};
pub use hub::{BroadcastOthers, BroadcastResult, Echo, Hub, MessageHandler, SessionId};
pub use outbox::{Outbox, PushError};
pub use protocol::Message;
pub use server::Server;
pub use session::{Termination, serve_connection};

/// Default receive buffer size (64KB)
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload encodable in the 7-bit length field
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Largest payload encodable in the 16-bit extended length field
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Control frames never carry more than this many payload bytes
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Default assembled message limit (16MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default maximum size of the HTTP upgrade request
pub const DEFAULT_MAX_HANDSHAKE_SIZE: usize = 8192;

/// Default outbound backlog allowed per session (1MB)
pub const DEFAULT_MAX_BACKPRESSURE: usize = 1024 * 1024;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Configuration for the engine
///
/// Compression support, message limits and worker pool sizing are all
/// options here rather than separate server variants.
///
/// # Example
///
/// ```
/// use hubsock::Config;
///
/// let config = Config::builder()
///     .compression(false)
///     .max_message_size(1024 * 1024)
///     .max_workers(8)
///     .backlog(16)
///     .build();
///
/// assert_eq!(config.max_workers, 8);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum assembled (and inflated) message size (default: 16MB)
    pub max_message_size: usize,
    /// Accept permessage-deflate when a client offers it (default: true)
    pub compression: bool,
    /// Deflate level for outbound messages, 0-9 (default: 9)
    pub compression_level: u32,
    /// Sessions running concurrently (default: 32)
    pub max_workers: usize,
    /// Accepted connections allowed to wait for a worker (default: 200)
    pub backlog: usize,
    /// Runtime worker threads, the pool's core size (default: 4)
    pub worker_threads: usize,
    /// Maximum size of the HTTP upgrade request (default: 8KB)
    pub max_handshake_size: usize,
    /// Initial read buffer capacity per session (default: 64KB)
    pub read_buffer_size: usize,
    /// Set TCP_NODELAY on accepted sockets (default: true)
    pub nodelay: bool,
    /// Maximum backpressure in bytes before dropping connection (default: 1MB)
    pub max_backpressure: usize,
    /// How long a closing session waits for its close frame to be written
    /// (default: 5s)
    pub close_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            compression: true,
            compression_level: 9,
            max_workers: 32,
            backlog: 200,
            worker_threads: 4,
            max_handshake_size: DEFAULT_MAX_HANDSHAKE_SIZE,
            read_buffer_size: RECV_BUFFER_SIZE,
            nodelay: true,
            max_backpressure: DEFAULT_MAX_BACKPRESSURE,
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for engine configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Enable or disable permessage-deflate negotiation
    pub fn compression(mut self, enabled: bool) -> Self {
        self.config.compression = enabled;
        self
    }

    /// Set the deflate level used for outbound messages (clamped to 0-9)
    pub fn compression_level(mut self, level: u32) -> Self {
        self.config.compression_level = level.min(9);
        self
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set the number of sessions served concurrently
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.config.max_workers = workers.max(1);
        self
    }

    /// Set how many accepted connections may queue for a worker
    pub fn backlog(mut self, backlog: usize) -> Self {
        self.config.backlog = backlog;
        self
    }

    /// Set the number of runtime worker threads
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads.max(1);
        self
    }

    /// Set the maximum HTTP upgrade request size
    pub fn max_handshake_size(mut self, size: usize) -> Self {
        self.config.max_handshake_size = size;
        self
    }

    /// Set the initial read buffer capacity
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Enable or disable TCP_NODELAY on accepted sockets
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.config.nodelay = enabled;
        self
    }

    /// Set the outbound backlog, in bytes, at which a session is dropped
    pub fn max_backpressure(mut self, bytes: usize) -> Self {
        self.config.max_backpressure = bytes;
        self
    }

    /// Set how long closing waits for a peer that is not reading
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::hub::{BroadcastOthers, Echo, Hub, MessageHandler, SessionId};
    pub use crate::protocol::Message;
    pub use crate::server::Server;
}
