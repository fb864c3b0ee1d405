//! # emberkv - A Byte-Bounded LRU Cache Server
//!
//! emberkv is an in-memory cache that speaks a memcached-style text
//! protocol. Every entry is charged `len(key) + len(value)` bytes against a
//! fixed capacity, and the least recently used entries are evicted to make
//! room for new writes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              emberkv                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────────────┐    ┌─────────────┐          │
//! │  │  Reactor    │───>│ ConnectionHandler   │───>│  Command    │          │
//! │  │ (server.rs) │    │ (state machine)     │    │  execute()  │          │
//! │  └─────────────┘    └──────────┬──────────┘    └──────┬──────┘          │
//! │                                │ dispatch=pool        │                 │
//! │                                ▼                      ▼                 │
//! │                     ┌─────────────────────┐    ┌─────────────────────┐  │
//! │                     │    WorkerPool       │───>│    SharedCache      │  │
//! │                     │ low..high watermark │    │ Mutex<CacheEngine>  │  │
//! │                     └─────────────────────┘    └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use emberkv::connection::{ConnectionLimits, Dispatch};
//! use emberkv::server::Server;
//! use emberkv::storage::SharedCache;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let cache = SharedCache::new(64 * 1024 * 1024);
//!     let server = Server::bind(
//!         "127.0.0.1:11211",
//!         cache,
//!         Dispatch::Inline,
//!         ConnectionLimits::default(),
//!     )
//!     .await?;
//!
//!     let (_shutdown, rx) = watch::channel(false);
//!     server.run(rx).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: the LRU cache engine and its shared handle
//! - [`executor`]: the adaptive worker pool
//! - [`protocol`]: request header parser and protocol constants
//! - [`commands`]: command execution against the engine
//! - [`connection`]: per-connection state machine
//! - [`server`]: the tokio reactor driving connections
//! - [`config`]: command-line configuration

pub mod commands;
pub mod config;
pub mod connection;
pub mod executor;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::{Command, CommandError};
pub use config::{CliAction, ConfigError, DispatchMode, ServerConfig};
pub use connection::{ConnectionHandler, ConnectionStats};
pub use executor::{PoolConfig, PoolError, WorkerPool};
pub use protocol::{ParseError, Parser};
pub use server::Server;
pub use storage::{CacheEngine, SharedCache};

/// The default port emberkv listens on (same as memcached)
pub const DEFAULT_PORT: u16 = 11211;

/// The default host emberkv binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of emberkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
