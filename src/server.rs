//! Connection acceptor
//!
//! `Server` owns the listening socket's accept loop and the admission
//! control in front of the sessions. Two semaphores bound the work:
//!
//! - the *admission* semaphore has `max_workers + backlog` permits and is
//!   taken without waiting; a connection that finds it empty is dropped
//!   on the spot
//! - the *worker* semaphore has `max_workers` permits; an admitted
//!   connection waits on it before its handshake starts
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hubsock::{Config, Echo, Hub, Server};
//!
//! let server = Server::new(Config::default(), Arc::new(Hub::new()), Arc::new(Echo));
//! let listener = server.bind("127.0.0.1:9001".parse()?)?;
//! server
//!     .serve_with_shutdown(listener, async {
//!         tokio::signal::ctrl_c().await.ok();
//!     })
//!     .await?;
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::Config;
use crate::error::{Error, Result};
use crate::hub::{Hub, MessageHandler};
use crate::session::serve_connection;

/// WebSocket acceptor with bounded admission
#[derive(Clone)]
pub struct Server {
    config: Arc<Config>,
    hub: Arc<Hub>,
    handler: Arc<dyn MessageHandler>,
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
}

impl Server {
    /// Create a server routing every session's messages through `handler`
    pub fn new(config: Config, hub: Arc<Hub>, handler: Arc<dyn MessageHandler>) -> Self {
        let admission = Arc::new(Semaphore::new(config.max_workers + config.backlog));
        let workers = Arc::new(Semaphore::new(config.max_workers));

        Self {
            config: Arc::new(config),
            hub,
            handler,
            admission,
            workers,
        }
    }

    /// Get the server configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the hub sessions are registered with
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Connections that can still be admitted right now
    pub fn available_slots(&self) -> usize {
        self.admission.available_permits()
    }

    /// Bind a listening socket with SO_REUSEADDR
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(&self, addr: SocketAddr) -> Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let backlog = i32::try_from(self.config.backlog.max(1)).unwrap_or(i32::MAX);
        socket.listen(backlog)?;

        let listener = TcpListener::from_std(socket.into())?;
        tracing::info!(addr = %listener.local_addr()?, "listening");
        Ok(listener)
    }

    /// Accept connections until the listener fails
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Accept connections until `signal` resolves
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    tracing::info!("shutdown requested, no longer accepting");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            // Per-connection failures (e.g. aborted before accept)
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };

                    if self.config.nodelay {
                        let _ = stream.set_nodelay(true);
                    }

                    if let Err(e) = self.spawn_session(stream, peer) {
                        tracing::warn!(%peer, error = %e, "connection rejected");
                    }
                }
            }
        }
    }

    /// Admit a connection and run its session on a new task
    ///
    /// Fails with [`Error::Capacity`] when every worker is busy and the
    /// backlog is full; the stream is dropped, closing the connection.
    pub fn spawn_session<S>(&self, stream: S, peer: SocketAddr) -> Result<JoinHandle<()>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let admitted = Arc::clone(&self.admission)
            .try_acquire_owned()
            .map_err(|_| Error::Capacity("connection backlog full"))?;

        let workers = Arc::clone(&self.workers);
        let hub = Arc::clone(&self.hub);
        let handler = Arc::clone(&self.handler);
        let config = Arc::clone(&self.config);

        Ok(tokio::spawn(async move {
            let _admitted = admitted;
            let Ok(_worker) = workers.acquire_owned().await else {
                return;
            };

            match serve_connection(stream, peer, hub, handler, config).await {
                Ok(termination) => tracing::trace!(%peer, ?termination, "session finished"),
                Err(e) => tracing::debug!(%peer, error = %e, "session failed"),
            }
        }))
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("sessions", &self.hub.session_count())
            .field("available_slots", &self.available_slots())
            .finish()
    }
}
