//! Connection Handler Module
//!
//! This module manages individual client connections to emberkv. A
//! [`ConnectionHandler`] owns one nonblocking socket and drives it through
//! an explicit state machine; the reactor in [`crate::server`] only tells it
//! when the socket is ready.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Reactor (server.rs)                        │
//! │        waits for the readiness the handler asks for         │
//! └──────────┬──────────────────┬──────────────────┬────────────┘
//!            │ readable         │ writable         │ notified
//!            ▼                  ▼                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │  do_read    │───>│ Parse header│───>│  Dispatch   │      │
//! │  └─────────────┘    │ + data block│    │ inline/pool │      │
//! │                     └─────────────┘    └──────┬──────┘      │
//! │                                               ▼             │
//! │  ┌─────────────┐                      ┌──────────────┐      │
//! │  │  do_write   │<─────────────────────│ Reply slots  │      │
//! │  └─────────────┘                      └──────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Pipelining**: Any number of requests per read, replies in order
//! - **Partial I/O**: Headers and data blocks may arrive in pieces; writes
//!   resume at the byte where the socket stopped accepting
//! - **Backpressure**: Bounded reply queue and input buffer per connection
//! - **Statistics**: Tracks connection and command metrics

pub mod handler;

// Re-export commonly used types
pub use handler::{
    ConnectionHandler, ConnectionLimits, ConnectionStats, Dispatch, Interest,
    DEFAULT_MAX_INPUT_BUFFER, DEFAULT_MAX_OUTPUT_QUEUE,
};
