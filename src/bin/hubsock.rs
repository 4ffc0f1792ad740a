//! hubsock - WebSocket broadcast server
//!
//! Every text or binary message a client sends is relayed to all other
//! connected clients (or back to the sender with `--echo`).

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use hubsock::{
    BroadcastOthers, Config, DEFAULT_MAX_BACKPRESSURE, DEFAULT_MAX_MESSAGE_SIZE, Echo, Hub,
    MessageHandler, Server,
};

/// hubsock - single-room WebSocket broadcast server
#[derive(Parser, Debug)]
#[command(name = "hubsock")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "HUBSOCK_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Refuse permessage-deflate even when clients offer it
    #[arg(long, env = "HUBSOCK_NO_COMPRESSION")]
    no_compression: bool,

    /// Largest assembled message accepted, in bytes
    #[arg(long, env = "HUBSOCK_MAX_MESSAGE_SIZE", default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,

    /// Outbound backlog per client, in bytes, before it is disconnected
    #[arg(long, env = "HUBSOCK_MAX_BACKPRESSURE", default_value_t = DEFAULT_MAX_BACKPRESSURE)]
    max_backpressure: usize,

    /// Sessions served concurrently
    #[arg(long, env = "HUBSOCK_MAX_WORKERS", default_value_t = 32)]
    max_workers: usize,

    /// Accepted connections allowed to wait for a worker
    #[arg(long, env = "HUBSOCK_BACKLOG", default_value_t = 200)]
    backlog: usize,

    /// Runtime worker threads
    #[arg(long, env = "HUBSOCK_WORKER_THREADS", default_value_t = 4)]
    worker_threads: usize,

    /// Send messages back to their sender instead of broadcasting
    #[arg(long, env = "HUBSOCK_ECHO")]
    echo: bool,
}

impl Cli {
    fn config(&self) -> Config {
        Config::builder()
            .compression(!self.no_compression)
            .max_message_size(self.max_message_size)
            .max_backpressure(self.max_backpressure)
            .max_workers(self.max_workers)
            .backlog(self.backlog)
            .worker_threads(self.worker_threads)
            .build()
    }
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = cli.config();
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let handler: Arc<dyn MessageHandler> = if cli.echo {
        Arc::new(Echo)
    } else {
        Arc::new(BroadcastOthers)
    };

    let result = runtime.block_on(async move {
        let server = Server::new(config, Arc::new(Hub::new()), handler);
        let listener = server.bind(cli.bind)?;
        tracing::info!(
            echo = cli.echo,
            compression = server.config().compression,
            max_workers = server.config().max_workers,
            backlog = server.config().backlog,
            "hubsock ready"
        );

        server
            .serve_with_shutdown(listener, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;

        let hub = server.hub();
        tracing::info!(
            open_sessions = hub.session_count(),
            messages_published = hub.messages_published(),
            "hubsock stopped"
        );
        Ok::<_, hubsock::Error>(())
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
