//! Command Module
//!
//! This module implements the command layer for emberkv. The protocol
//! parser produces [`Command`] values; the connection handler (or a pool
//! worker) executes them against the cache and frames the reply.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  Parser         │  (protocol module)
//! └────────┬────────┘
//!          │ Command + data block
//!          ▼
//! ┌─────────────────┐
//! │ Command         │  (this module)
//! │  - execute()    │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CacheEngine     │  (storage module)
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! - `set`, `add`, `replace`, `append`, `prepend`
//! - `get` / `gets`, `delete`
//! - `incr`, `decr`
//! - `flush_all`, `stats`, `version`

pub mod command;

pub use command::{Command, CommandError, StoreMode};
