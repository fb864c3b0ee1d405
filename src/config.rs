//! Server Configuration
//!
//! Settings are read from `--flag value` command-line arguments. Anything
//! not given keeps its default:
//!
//! | Flag               | Default     |
//! |--------------------|-------------|
//! | `--host`           | `127.0.0.1` |
//! | `--port`           | `11211`     |
//! | `--capacity`       | 64 MiB      |
//! | `--threads`        | 1           |
//! | `--dispatch`       | `inline`    |
//! | `--low-watermark`  | 1           |
//! | `--high-watermark` | 4           |
//! | `--max-queue`      | 64          |
//! | `--idle-ms`        | 1000        |
//! | `--max-output`     | 64          |
//! | `--max-input`      | 65536       |

use crate::connection::{ConnectionLimits, DEFAULT_MAX_INPUT_BUFFER, DEFAULT_MAX_OUTPUT_QUEUE};
use crate::executor::PoolConfig;
use crate::protocol::types::MAX_LINE_LENGTH;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default cache capacity in bytes (64 MiB)
pub const DEFAULT_CACHE_CAPACITY: usize = 64 * 1024 * 1024;

/// Errors produced while reading the configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} requires a value")]
    MissingValue(String),

    #[error("invalid value for {flag}: {value}")]
    InvalidValue { flag: String, value: String },

    #[error("unknown argument: {0}")]
    UnknownArgument(String),

    #[error("{0}")]
    Invalid(String),
}

/// Where commands are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// On the reactor thread that read them
    #[default]
    Inline,
    /// On the worker pool
    Pool,
}

impl FromStr for DispatchMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(DispatchMode::Inline),
            "pool" => Ok(DispatchMode::Pool),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Inline => write!(f, "inline"),
            DispatchMode::Pool => write!(f, "pool"),
        }
    }
}

/// What the binary should do after reading its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliAction {
    Run(ServerConfig),
    Help,
    Version,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Cache capacity in bytes (keys + values)
    pub cache_capacity: usize,
    /// Runtime worker threads driving connections
    pub reactor_threads: usize,
    pub dispatch: DispatchMode,
    pub low_watermark: usize,
    pub high_watermark: usize,
    pub max_queue_size: usize,
    pub idle_time: Duration,
    /// Reply slots per connection before backpressure
    pub max_output_queue: usize,
    /// Unparsed input bytes per connection before reads pause
    pub max_input_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            reactor_threads: 1,
            dispatch: DispatchMode::Inline,
            low_watermark: pool.low_watermark,
            high_watermark: pool.high_watermark,
            max_queue_size: pool.max_queue_size,
            idle_time: pool.idle_time,
            max_output_queue: DEFAULT_MAX_OUTPUT_QUEUE,
            max_input_buffer: DEFAULT_MAX_INPUT_BUFFER,
        }
    }
}

impl ServerConfig {
    /// Parses command-line arguments (without the program name).
    pub fn from_args<I, A>(args: I) -> Result<CliAction, ConfigError>
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        let mut config = ServerConfig::default();
        let mut args = args.into_iter().map(Into::into);

        while let Some(flag) = args.next() {
            match flag.as_str() {
                "--help" => return Ok(CliAction::Help),
                "--version" | "-v" => return Ok(CliAction::Version),
                "--host" | "-h" => config.host = value(&flag, args.next())?,
                "--port" | "-p" => config.port = parsed(&flag, args.next())?,
                "--capacity" => config.cache_capacity = parsed(&flag, args.next())?,
                "--threads" => config.reactor_threads = parsed(&flag, args.next())?,
                "--dispatch" => config.dispatch = parsed(&flag, args.next())?,
                "--low-watermark" => config.low_watermark = parsed(&flag, args.next())?,
                "--high-watermark" => config.high_watermark = parsed(&flag, args.next())?,
                "--max-queue" => config.max_queue_size = parsed(&flag, args.next())?,
                "--idle-ms" => {
                    config.idle_time = Duration::from_millis(parsed(&flag, args.next())?)
                }
                "--max-output" => config.max_output_queue = parsed(&flag, args.next())?,
                "--max-input" => config.max_input_buffer = parsed(&flag, args.next())?,
                _ => return Err(ConfigError::UnknownArgument(flag)),
            }
        }

        config.validate()?;
        Ok(CliAction::Run(config))
    }

    /// Checks the cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_capacity == 0 {
            return Err(ConfigError::Invalid("cache capacity must be positive".into()));
        }
        if self.reactor_threads == 0 {
            return Err(ConfigError::Invalid("thread count must be positive".into()));
        }
        if self.high_watermark == 0 {
            return Err(ConfigError::Invalid("high watermark must be positive".into()));
        }
        if self.low_watermark > self.high_watermark {
            return Err(ConfigError::Invalid(format!(
                "low watermark {} exceeds high watermark {}",
                self.low_watermark, self.high_watermark
            )));
        }
        if self.max_output_queue == 0 {
            return Err(ConfigError::Invalid("max output queue must be positive".into()));
        }
        // Must hold the longest header plus its CRLF
        if self.max_input_buffer <= MAX_LINE_LENGTH + 2 {
            return Err(ConfigError::Invalid(format!(
                "max input buffer must exceed {} bytes",
                MAX_LINE_LENGTH + 2
            )));
        }
        Ok(())
    }

    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            name: "worker".to_string(),
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
            max_queue_size: self.max_queue_size,
            idle_time: self.idle_time,
        }
    }

    pub fn connection_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            max_output_queue: self.max_output_queue,
            max_input_buffer: self.max_input_buffer,
        }
    }
}

fn value(flag: &str, next: Option<String>) -> Result<String, ConfigError> {
    next.ok_or_else(|| ConfigError::MissingValue(flag.to_string()))
}

fn parsed<T: FromStr>(flag: &str, next: Option<String>) -> Result<T, ConfigError> {
    let raw = value(flag, next)?;
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        flag: flag.to_string(),
        value: raw,
    })
}
