//! Command Execution
//!
//! A [`Command`] is one parsed request. Executing it against a
//! [`CacheEngine`] produces the reply body; the connection handler adds the
//! final CRLF and queues it.
//!
//! | Request   | Engine call                         |
//! |-----------|-------------------------------------|
//! | `set`     | `put`                               |
//! | `add`     | `put_if_absent`                     |
//! | `replace` | `set`                               |
//! | `append`  | `get` + `set` of the joined value   |
//! | `prepend` | `get` + `set` of the joined value   |
//! | `get`     | `get` per key                       |
//! | `delete`  | `delete`                            |
//! | `incr`    | `get` + `set` of the new number     |

use crate::protocol::types::{reply, CRLF};
use crate::storage::CacheEngine;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// How a storage command treats an existing (or missing) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
}

impl StoreMode {
    pub fn name(self) -> &'static str {
        match self {
            StoreMode::Set => "set",
            StoreMode::Add => "add",
            StoreMode::Replace => "replace",
            StoreMode::Append => "append",
            StoreMode::Prepend => "prepend",
        }
    }
}

/// A parsed request, ready to run against the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Storage command followed by a `bytes`-long data block.
    /// `flags` and `exptime` are validated but not stored.
    Store {
        mode: StoreMode,
        key: Bytes,
        flags: u32,
        exptime: i64,
        bytes: usize,
    },
    Get {
        keys: Vec<Bytes>,
    },
    Delete {
        key: Bytes,
    },
    Incr {
        key: Bytes,
        delta: u64,
    },
    Decr {
        key: Bytes,
        delta: u64,
    },
    FlushAll,
    Stats,
    Version,
}

/// Recoverable command failures. Each becomes an error reply; the
/// connection stays open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The entry can never fit in the cache
    #[error("object too large for cache")]
    TooLarge,

    #[error("cannot increment or decrement non-numeric value")]
    NonNumeric,

    /// The data block was not terminated by CRLF
    #[error("bad data chunk")]
    BadDataChunk,
}

impl CommandError {
    /// The reply line sent to the client, without CRLF.
    pub fn reply(&self) -> Bytes {
        let class = match self {
            CommandError::TooLarge => "SERVER_ERROR",
            CommandError::NonNumeric | CommandError::BadDataChunk => "CLIENT_ERROR",
        };
        Bytes::from(format!("{} {}", class, self))
    }
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Store { mode, .. } => mode.name(),
            Command::Get { .. } => "get",
            Command::Delete { .. } => "delete",
            Command::Incr { .. } => "incr",
            Command::Decr { .. } => "decr",
            Command::FlushAll => "flush_all",
            Command::Stats => "stats",
            Command::Version => "version",
        }
    }

    /// Length of the data block this command expects, if any.
    pub fn argument_len(&self) -> Option<usize> {
        match self {
            Command::Store { bytes, .. } => Some(*bytes),
            _ => None,
        }
    }

    /// Runs the command and returns the reply body.
    ///
    /// `argument` is the data block of a storage command with its trailing
    /// CRLF already removed; it is empty for every other command.
    pub fn execute(&self, engine: &mut CacheEngine, argument: Bytes) -> Result<Bytes, CommandError> {
        match self {
            Command::Store { mode, key, .. } => store(engine, *mode, key, argument),
            Command::Get { keys } => Ok(get(engine, keys)),
            Command::Delete { key } => Ok(Bytes::from_static(if engine.delete(key) {
                reply::DELETED
            } else {
                reply::NOT_FOUND
            })),
            Command::Incr { key, delta } => {
                arithmetic(engine, key, |value| value.wrapping_add(*delta))
            }
            Command::Decr { key, delta } => {
                arithmetic(engine, key, |value| value.saturating_sub(*delta))
            }
            Command::FlushAll => {
                engine.clear();
                Ok(Bytes::from_static(reply::OK))
            }
            Command::Stats => Ok(stats(engine)),
            Command::Version => Ok(Bytes::from(format!("VERSION {}", crate::VERSION))),
        }
    }
}

fn store(
    engine: &mut CacheEngine,
    mode: StoreMode,
    key: &Bytes,
    value: Bytes,
) -> Result<Bytes, CommandError> {
    if key.len() + value.len() > engine.capacity() {
        return Err(CommandError::TooLarge);
    }

    let stored = match mode {
        StoreMode::Set => engine.put(key.clone(), value),
        StoreMode::Add => engine.put_if_absent(key.clone(), value),
        StoreMode::Replace => engine.set(key.clone(), value),
        StoreMode::Append | StoreMode::Prepend => match engine.get(key) {
            Some(existing) => {
                if key.len() + existing.len() + value.len() > engine.capacity() {
                    return Err(CommandError::TooLarge);
                }
                let mut joined = BytesMut::with_capacity(existing.len() + value.len());
                if mode == StoreMode::Append {
                    joined.put_slice(&existing);
                    joined.put_slice(&value);
                } else {
                    joined.put_slice(&value);
                    joined.put_slice(&existing);
                }
                engine.set(key.clone(), joined.freeze())
            }
            None => false,
        },
    };

    Ok(Bytes::from_static(if stored {
        reply::STORED
    } else {
        reply::NOT_STORED
    }))
}

fn get(engine: &mut CacheEngine, keys: &[Bytes]) -> Bytes {
    let mut out = BytesMut::new();
    for key in keys {
        if let Some(value) = engine.get(key) {
            out.put_slice(b"VALUE ");
            out.put_slice(key);
            out.put_slice(format!(" 0 {}", value.len()).as_bytes());
            out.put_slice(CRLF);
            out.put_slice(&value);
            out.put_slice(CRLF);
        }
    }
    out.put_slice(reply::END);
    out.freeze()
}

fn arithmetic(
    engine: &mut CacheEngine,
    key: &Bytes,
    apply: impl FnOnce(u64) -> u64,
) -> Result<Bytes, CommandError> {
    let Some(current) = engine.get(key) else {
        return Ok(Bytes::from_static(reply::NOT_FOUND));
    };

    let current: u64 = std::str::from_utf8(&current)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CommandError::NonNumeric)?;

    let updated = Bytes::from(apply(current).to_string());
    if !engine.set(key.clone(), updated.clone()) {
        return Err(CommandError::TooLarge);
    }
    Ok(updated)
}

fn stats(engine: &CacheEngine) -> Bytes {
    let stats = engine.stats();
    let lines = [
        ("curr_items", engine.len() as u64),
        ("bytes", engine.current_size() as u64),
        ("limit_maxbytes", engine.capacity() as u64),
        ("get_hits", stats.hits),
        ("get_misses", stats.misses),
        ("evictions", stats.evictions),
        ("total_items", stats.insertions),
    ];

    let mut out = BytesMut::new();
    for (name, value) in lines {
        out.put_slice(format!("STAT {} {}", name, value).as_bytes());
        out.put_slice(CRLF);
    }
    out.put_slice(reply::END);
    out.freeze()
}
