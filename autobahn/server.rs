//! Standalone echo server for the Autobahn fuzzing client
//!
//! Listens on 127.0.0.1:9001 with permessage-deflate enabled and echoes
//! every message back to its sender.
//!
//! Run with: cargo run --release --example autobahn-server

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use hubsock::error::Result;
use hubsock::{Config, Echo, Hub, Server};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let addr = SocketAddr::from(([127, 0, 0, 1], 9001));

    // The fuzzer opens one connection per case but may overlap them
    let config = Config::builder()
        .max_workers(256)
        .backlog(1024)
        .build();

    let server = Server::new(config, Arc::new(Hub::new()), Arc::new(Echo));
    let listener = server.bind(addr)?;

    println!("WebSocket server listening on ws://{addr}");
    println!("Ready for Autobahn test suite");

    server
        .serve_with_shutdown(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
