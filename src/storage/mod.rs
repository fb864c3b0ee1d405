//! Storage Engine Module
//!
//! This module provides the cache storage for emberkv: a byte-bounded LRU
//! engine and a shareable, lock-protected handle to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Connection 1 │   │ Connection 2 │   │ Pool worker  │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        │                  │                  │
//!        └──────────────────┼──────────────────┘
//!                           ▼
//!               ┌────────────────────────┐
//!               │ SharedCache (Mutex)    │
//!               │  ┌──────────────────┐  │
//!               │  │   CacheEngine    │  │
//!               │  │ index + LRU list │  │
//!               │  └──────────────────┘  │
//!               └────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use emberkv::storage::SharedCache;
//! use bytes::Bytes;
//!
//! let cache = SharedCache::new(1024);
//!
//! cache.with(|engine| engine.put(Bytes::from("name"), Bytes::from("Ariz")));
//! let value = cache.with(|engine| engine.get(b"name"));
//! assert_eq!(value, Some(Bytes::from("Ariz")));
//! ```

pub mod engine;
pub mod shared;

// Re-export commonly used types
pub use engine::{CacheEngine, CacheStats};
pub use shared::SharedCache;
