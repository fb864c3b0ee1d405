//! Text Protocol Implementation
//!
//! This module recognizes request headers of the memcached-style text
//! protocol emberkv speaks.
//!
//! ## Modules
//!
//! - `types`: protocol limits and fixed reply lines
//! - `parser`: incremental header parser
//!
//! ## Example
//!
//! ```
//! use emberkv::protocol::Parser;
//!
//! let mut parser = Parser::new();
//! let data = b"set name 0 0 4\r\nAriz\r\n";
//!
//! let (consumed, recognized) = parser.parse(data).unwrap();
//! assert!(recognized);
//! assert_eq!(consumed, 16);
//!
//! let (_command, argument_len) = parser.build().unwrap();
//! assert_eq!(argument_len, Some(4));
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{ParseError, ParseResult, Parser};
pub use types::CRLF;
