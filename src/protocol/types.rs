//! Text Protocol Constants
//!
//! emberkv speaks a line-oriented protocol in the style of memcached. Every
//! request starts with a header line; storage requests are followed by a
//! data block of the announced length. Every request yields exactly one
//! reply, terminated by CRLF.
//!
//! ## Examples
//!
//! ```text
//! set name 0 0 4\r\n      ->  STORED\r\n
//! Ariz\r\n
//!
//! get name\r\n            ->  VALUE name 0 4\r\n
//!                             Ariz\r\n
//!                             END\r\n
//!
//! delete name\r\n         ->  DELETED\r\n
//! ```

/// Line terminator used for headers, data blocks and replies.
pub const CRLF: &[u8] = b"\r\n";

/// Longest accepted header line, excluding the terminator.
pub const MAX_LINE_LENGTH: usize = 2048;

/// Longest accepted key.
pub const MAX_KEY_LENGTH: usize = 250;

/// Largest data block a storage command may announce (1 MiB).
pub const MAX_DATA_LENGTH: usize = 1024 * 1024;

/// Fixed reply lines (without the trailing CRLF).
pub mod reply {
    pub const STORED: &[u8] = b"STORED";
    pub const NOT_STORED: &[u8] = b"NOT_STORED";
    pub const DELETED: &[u8] = b"DELETED";
    pub const NOT_FOUND: &[u8] = b"NOT_FOUND";
    pub const END: &[u8] = b"END";
    pub const OK: &[u8] = b"OK";
    pub const BUSY: &[u8] = b"SERVER_ERROR busy";
    pub const ABORTED: &[u8] = b"SERVER_ERROR command aborted";
}
