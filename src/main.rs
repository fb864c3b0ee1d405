//! emberkv - A Byte-Bounded LRU Cache Server
//!
//! This is the main entry point for the emberkv server.
//! It reads the configuration, builds the runtime, cache and (optionally)
//! worker pool, and serves connections until Ctrl+C.

use anyhow::Context;
use emberkv::config::{CliAction, DispatchMode, ServerConfig};
use emberkv::connection::Dispatch;
use emberkv::executor::WorkerPool;
use emberkv::server::Server;
use emberkv::storage::SharedCache;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn print_help() {
    println!(
        r#"
emberkv - A Byte-Bounded LRU Cache Server

USAGE:
    emberkv [OPTIONS]

OPTIONS:
    -h, --host <HOST>            Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>            Port to listen on (default: 11211)
        --capacity <BYTES>       Cache capacity in bytes (default: 67108864)
        --threads <N>            Reactor threads (default: 1)
        --dispatch <MODE>        inline | pool (default: inline)
        --low-watermark <N>      Minimum pool workers (default: 1)
        --high-watermark <N>     Maximum pool workers (default: 4)
        --max-queue <N>          Pool queue capacity (default: 64)
        --idle-ms <MS>           Idle time before a worker retires (default: 1000)
        --max-output <N>         Reply slots per connection (default: 64)
        --max-input <BYTES>      Input buffer per connection (default: 65536)
    -v, --version                Print version information
        --help                   Print this help message

ENVIRONMENT:
    RUST_LOG                     Log filter (default: info)

CONNECTING:
    $ printf 'set name 0 0 4\r\nAriz\r\nget name\r\n' | nc 127.0.0.1 11211
    STORED
    VALUE name 0 4
    Ariz
    END
"#
    );
}

fn main() -> anyhow::Result<()> {
    let config = match ServerConfig::from_args(std::env::args().skip(1)) {
        Ok(CliAction::Run(config)) => config,
        Ok(CliAction::Help) => {
            print_help();
            return Ok(());
        }
        Ok(CliAction::Version) => {
            println!("emberkv version {}", emberkv::VERSION);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.reactor_threads)
        .thread_name("reactor")
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let cache = SharedCache::new(config.cache_capacity);
    info!(capacity = config.cache_capacity, "Cache initialized");

    let pool = match config.dispatch {
        DispatchMode::Inline => None,
        DispatchMode::Pool => {
            let pool = WorkerPool::new(config.pool_config()).context("invalid pool configuration")?;
            pool.start().context("failed to start worker pool")?;
            Some(Arc::new(pool))
        }
    };
    let dispatch = match &pool {
        Some(pool) => Dispatch::Pool(Arc::clone(pool)),
        None => Dispatch::Inline,
    };

    let server = Server::bind(
        config.bind_address(),
        cache,
        dispatch,
        config.connection_limits(),
    )
    .await
    .with_context(|| format!("failed to bind {}", config.bind_address()))?;

    info!(
        version = emberkv::VERSION,
        addr = %config.bind_address(),
        dispatch = %config.dispatch,
        threads = config.reactor_threads,
        "emberkv started, use Ctrl+C to shut down"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.run(shutdown_rx));

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C, shutting down");
    }
    info!("Shutdown signal received, stopping server...");

    // Receivers may all be gone already if the server exited on its own
    let _ = shutdown_tx.send(true);
    server_task.await.context("server task failed")?;

    if let Some(pool) = pool {
        tokio::task::spawn_blocking(move || pool.stop(true))
            .await
            .context("worker pool shutdown failed")?;
    }

    info!("Server shutdown complete");
    Ok(())
}
