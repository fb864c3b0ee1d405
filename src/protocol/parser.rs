//! Incremental Header Parser
//!
//! The parser recognizes one request header at a time from the front of a
//! byte buffer. It never looks past the first newline and never copies the
//! data block that may follow a storage header; the connection handler
//! collects that itself using the length returned by [`Parser::build`].
//!
//! ## How the Parser Works
//!
//! `parse()` returns `(consumed, recognized)`:
//! - `(0, false)` - no complete line yet, wait for more data
//! - `(n, false)` - a blank line was skipped, `n` bytes should be dropped
//! - `(n, true)`  - a header was recognized; call `build()` to take it
//!
//! Malformed headers are reported as [`ParseError`] and are fatal for the
//! connection that sent them.

use crate::commands::{Command, StoreMode};
use crate::protocol::types::{MAX_DATA_LENGTH, MAX_KEY_LENGTH, MAX_LINE_LENGTH};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur while parsing a request header.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The command name is not one we serve
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Wrong number of arguments for the command
    #[error("wrong number of arguments for '{0}'")]
    WrongArity(&'static str),

    /// Key is empty, too long or contains control characters
    #[error("invalid key")]
    InvalidKey,

    /// A numeric field could not be parsed
    #[error("invalid number: {0}")]
    InvalidNumber(String),

    /// No newline within the maximum header length
    #[error("header line too long (max: {max} bytes)")]
    LineTooLong { max: usize },

    /// The announced data block exceeds the protocol limit
    #[error("data block too large: {size} bytes (max: {max})")]
    DataTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Recognizes request headers and holds the most recent one until built.
#[derive(Debug, Default)]
pub struct Parser {
    recognized: Option<Command>,
}

impl Parser {
    pub fn new() -> Self {
        Self { recognized: None }
    }

    /// Attempts to recognize a header at the front of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<(usize, bool)> {
        let newline = match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None if buf.len() > MAX_LINE_LENGTH + 1 => {
                return Err(ParseError::LineTooLong {
                    max: MAX_LINE_LENGTH,
                })
            }
            None => return Ok((0, false)),
        };

        let consumed = newline + 1;
        let line = match buf[..newline].strip_suffix(b"\r") {
            Some(line) => line,
            None => &buf[..newline],
        };
        if line.len() > MAX_LINE_LENGTH {
            return Err(ParseError::LineTooLong {
                max: MAX_LINE_LENGTH,
            });
        }

        let tokens: Vec<&[u8]> = line
            .split(|&b| b == b' ')
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            return Ok((consumed, false));
        }

        self.recognized = Some(parse_command(&tokens)?);
        Ok((consumed, true))
    }

    /// Takes the recognized command and the length of the data block it
    /// expects, if any. The length excludes the block's trailing CRLF.
    pub fn build(&mut self) -> Option<(Command, Option<usize>)> {
        self.recognized.take().map(|command| {
            let argument_len = command.argument_len();
            (command, argument_len)
        })
    }

    /// Forgets any recognized but unbuilt command.
    pub fn reset(&mut self) {
        self.recognized = None;
    }
}

fn parse_command(tokens: &[&[u8]]) -> ParseResult<Command> {
    let name = tokens[0];
    let args = &tokens[1..];

    let store_mode = match name {
        b"set" => Some(StoreMode::Set),
        b"add" => Some(StoreMode::Add),
        b"replace" => Some(StoreMode::Replace),
        b"append" => Some(StoreMode::Append),
        b"prepend" => Some(StoreMode::Prepend),
        _ => None,
    };
    if let Some(mode) = store_mode {
        return parse_store(mode, args);
    }

    match name {
        b"get" | b"gets" => {
            if args.is_empty() {
                return Err(ParseError::WrongArity("get"));
            }
            let keys = args
                .iter()
                .map(|k| parse_key(k))
                .collect::<ParseResult<Vec<_>>>()?;
            Ok(Command::Get { keys })
        }
        b"delete" => match args {
            [key] => Ok(Command::Delete { key: parse_key(key)? }),
            _ => Err(ParseError::WrongArity("delete")),
        },
        b"incr" | b"decr" => match args {
            [key, delta] => {
                let key = parse_key(key)?;
                let delta = parse_number(delta)?;
                Ok(if name == b"incr" {
                    Command::Incr { key, delta }
                } else {
                    Command::Decr { key, delta }
                })
            }
            _ => Err(ParseError::WrongArity("incr/decr")),
        },
        b"flush_all" => no_args(args, "flush_all", Command::FlushAll),
        b"stats" => no_args(args, "stats", Command::Stats),
        b"version" => no_args(args, "version", Command::Version),
        _ => Err(ParseError::UnknownCommand(
            String::from_utf8_lossy(name).into_owned(),
        )),
    }
}

/// `<cmd> <key> <flags> <exptime> <bytes>`
fn parse_store(mode: StoreMode, args: &[&[u8]]) -> ParseResult<Command> {
    let [key, flags, exptime, bytes] = args else {
        return Err(ParseError::WrongArity(mode.name()));
    };

    let key = parse_key(key)?;
    let flags: u32 = parse_number(flags)?;
    let exptime: i64 = parse_number(exptime)?;
    let bytes: usize = parse_number(bytes)?;

    if bytes > MAX_DATA_LENGTH {
        return Err(ParseError::DataTooLarge {
            size: bytes,
            max: MAX_DATA_LENGTH,
        });
    }

    Ok(Command::Store {
        mode,
        key,
        flags,
        exptime,
        bytes,
    })
}

fn no_args(args: &[&[u8]], name: &'static str, command: Command) -> ParseResult<Command> {
    if args.is_empty() {
        Ok(command)
    } else {
        Err(ParseError::WrongArity(name))
    }
}

fn parse_key(token: &[u8]) -> ParseResult<Bytes> {
    if token.is_empty()
        || token.len() > MAX_KEY_LENGTH
        || token.iter().any(|&b| b <= b' ' || b == 0x7f)
    {
        return Err(ParseError::InvalidKey);
    }
    Ok(Bytes::copy_from_slice(token))
}

fn parse_number<T: std::str::FromStr>(token: &[u8]) -> ParseResult<T> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ParseError::InvalidNumber(String::from_utf8_lossy(token).into_owned()))
}
