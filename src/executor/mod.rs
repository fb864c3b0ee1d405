//! Executor Module
//!
//! Runs cache commands on a pool of OS threads so a slow command never
//! stalls the connection reactor that parsed it.
//!
//! ```text
//!   reactor threads                 WorkerPool
//!  ┌──────────────┐  execute()  ┌──────────────────────────────┐
//!  │ Connection A │────────────>│ queue: [task][task][task]    │
//!  │ Connection B │────────────>│                              │
//!  └──────────────┘             │ workers: low..=high threads  │
//!         ▲                     └──────────────┬───────────────┘
//!         │        completion + notify         │
//!         └────────────────────────────────────┘
//! ```

pub mod pool;

pub use pool::{Lifecycle, PoolConfig, PoolError, PoolStats, Task, WorkerPool};
