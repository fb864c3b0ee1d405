//! Connection Handler Module
//!
//! This module turns one client's nonblocking byte stream into commands and
//! their replies into an ordered outbound queue. It never blocks and never
//! waits for readiness itself: a reactor calls [`ConnectionHandler::do_read`]
//! and [`ConnectionHandler::do_write`] when the socket is ready, and
//! consults [`ConnectionHandler::interest`] to learn what to wait for next.
//!
//! ## Read State Machine
//!
//! ```text
//!             header with data block
//!   ┌──────┐ ───────────────────────> ┌───────────────────┐
//!   │ Idle │                          │ AwaitingArgument  │
//!   └──────┘ <──┐                     └─────────┬─────────┘
//!      │        │ reply queued                  │ remaining == 0
//!      │        │                               ▼
//!      │     ┌──┴──────────────┐  <─────────────┘
//!      └───> │ ReadyToExecute  │
//!  header    └─────────────────┘
//!  without data
//!
//!   EOF / I/O error / malformed header ──> Closed
//! ```
//!
//! ## Outbound Queue and Backpressure
//!
//! Every dispatched command reserves a slot at the back of the outbound
//! queue. Inline commands fill their slot immediately; pooled commands fill
//! it when the worker reports back. Slots are written strictly front to
//! back, so replies keep request order.
//!
//! While the queue holds `max_output_queue` slots the handler stops parsing
//! and dispatching. It keeps reading socket bytes into the input buffer until
//! `max_input_buffer` is reached, then drops read interest. `do_write`
//! resumes dispatching once the queue drains below the limit.

use crate::commands::{Command, CommandError};
use crate::executor::WorkerPool;
use crate::protocol::types::{reply, CRLF};
use crate::protocol::{ParseError, Parser};
use crate::storage::SharedCache;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Default number of reply slots before backpressure kicks in
pub const DEFAULT_MAX_OUTPUT_QUEUE: usize = 64;

/// Default limit for buffered, not yet parsed input (64 KB)
pub const DEFAULT_MAX_INPUT_BUFFER: usize = 64 * 1024;

/// Bytes requested from the socket per read call
const READ_CHUNK_SIZE: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Commands the worker pool refused
    pub commands_rejected: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// The readiness a handler wants to be woken for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };

    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

/// Per-connection buffer limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Reply slots (ready or pending) allowed before dispatch pauses
    pub max_output_queue: usize,
    /// Unparsed input bytes allowed before reading pauses
    pub max_input_buffer: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_output_queue: DEFAULT_MAX_OUTPUT_QUEUE,
            max_input_buffer: DEFAULT_MAX_INPUT_BUFFER,
        }
    }
}

/// Where parsed commands run.
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// On the reactor thread, inside `do_read`/`do_write`
    Inline,
    /// On a worker pool; replies come back through the handler's notifier
    Pool(Arc<WorkerPool>),
}

enum State {
    Idle,
    AwaitingArgument {
        command: Command,
        /// Data bytes still expected, including the trailing CRLF
        remaining: usize,
        argument: BytesMut,
    },
    ReadyToExecute {
        command: Command,
        argument: Result<Bytes, CommandError>,
    },
    Closed,
}

enum Step {
    Progress,
    Stalled,
}

enum Slot {
    Ready(Bytes),
    Pending(u64),
}

/// Sends a pooled command's framed reply back to its connection.
///
/// If the task is dropped before completing (it panicked, or the pool was
/// torn down with the task still queued) the slot is filled with an error
/// reply so the connection never waits on it forever.
struct Completion {
    seq: u64,
    tx: mpsc::Sender<(u64, Bytes)>,
    notify: Arc<Notify>,
    sent: bool,
}

impl Completion {
    fn complete(mut self, body: Bytes) {
        self.send(body);
    }

    fn send(&mut self, body: Bytes) {
        if self.sent {
            return;
        }
        self.sent = true;
        // The connection may already be gone
        let _ = self.tx.send((self.seq, frame(body)));
        self.notify.notify_one();
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.send(Bytes::from_static(reply::ABORTED));
    }
}

/// Handles a single client connection.
///
/// `S` is any socket whose `read`/`write` report
/// [`io::ErrorKind::WouldBlock`] instead of blocking.
pub struct ConnectionHandler<S> {
    /// Connection id (for logging)
    id: u64,

    socket: S,

    /// The cache shared with every other connection
    cache: SharedCache,

    dispatch: Dispatch,

    parser: Parser,

    /// Bytes read but not yet consumed by the state machine
    input: BytesMut,

    state: State,

    /// Reply slots in request order
    outbound: VecDeque<Slot>,

    /// Bytes of the front slot already written
    head_offset: usize,

    completion_tx: mpsc::Sender<(u64, Bytes)>,
    completion_rx: mpsc::Receiver<(u64, Bytes)>,
    notify: Arc<Notify>,
    next_seq: u64,

    limits: ConnectionLimits,
    interest: Interest,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,
}

impl<S: Read + Write> ConnectionHandler<S> {
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `id` - Identifier used in log fields
    /// * `socket` - The nonblocking socket for this connection
    /// * `cache` - The shared cache
    /// * `dispatch` - Where commands run
    /// * `limits` - Outbound queue and input buffer limits
    /// * `stats` - Shared connection statistics
    pub fn new(
        id: u64,
        socket: S,
        cache: SharedCache,
        dispatch: Dispatch,
        limits: ConnectionLimits,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();
        let (completion_tx, completion_rx) = mpsc::channel();

        Self {
            id,
            socket,
            cache,
            dispatch,
            parser: Parser::new(),
            input: BytesMut::with_capacity(READ_CHUNK_SIZE),
            state: State::Idle,
            outbound: VecDeque::new(),
            head_offset: 0,
            completion_tx,
            completion_rx,
            notify: Arc::new(Notify::new()),
            next_seq: 0,
            limits,
            interest: Interest::NONE,
            stats,
        }
    }

    /// Arms read interest. Called once by the reactor after accept.
    pub fn start(&mut self) {
        debug!(conn = self.id, "Connection started");
        self.interest = Interest {
            read: true,
            write: false,
        };
    }

    /// Reads everything the socket has and processes it.
    pub fn do_read(&mut self) {
        if !self.is_alive() {
            return;
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            let room = self
                .limits
                .max_input_buffer
                .saturating_sub(self.input.len());
            if room == 0 {
                trace!(conn = self.id, buffered = self.input.len(), "Input buffer full");
                break;
            }

            let want = room.min(READ_CHUNK_SIZE);
            match self.socket.read(&mut chunk[..want]) {
                Ok(0) => {
                    // The peer may only have half-closed; hand it what is ready
                    if self.write_ready() {
                        self.on_close();
                    }
                    return;
                }
                Ok(n) => {
                    self.stats.bytes_read(n);
                    trace!(conn = self.id, bytes = n, "Read data");
                    self.input.extend_from_slice(&chunk[..n]);
                    self.process();
                    if !self.is_alive() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.on_error(e);
                    return;
                }
            }
        }

        if self.check_input_overflow() {
            self.update_interest();
        }
    }

    /// Writes queued replies until the queue is empty, the front reply is
    /// still pending, or the socket would block.
    pub fn do_write(&mut self) {
        if !self.is_alive() {
            return;
        }
        self.drain_completions();
        if !self.write_ready() {
            return;
        }
        trace!(conn = self.id, queued = self.outbound.len(), "Write pass finished");

        // Room in the queue again: pick up where backpressure stopped us
        self.process();
        if self.check_input_overflow() {
            self.update_interest();
        }
    }

    /// Moves finished pooled replies into their slots. The reactor calls
    /// this when the handler's notifier fires.
    pub fn collect_completions(&mut self) {
        if !self.is_alive() {
            return;
        }
        self.drain_completions();
        self.update_interest();
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state, State::Closed)
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Signalled whenever a pooled command finishes.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Reply slots currently queued, ready or pending.
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Reply slots waiting on a pool worker.
    pub fn pending_len(&self) -> usize {
        self.outbound
            .iter()
            .filter(|slot| matches!(slot, Slot::Pending(_)))
            .count()
    }

    /// Unparsed input bytes.
    pub fn input_len(&self) -> usize {
        self.input.len()
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    fn is_backpressured(&self) -> bool {
        self.outbound.len() >= self.limits.max_output_queue
    }

    /// Writes ready slots from the front until the queue is empty, the
    /// front slot is pending, or the socket would block. Returns false if
    /// the connection was closed by a write error.
    fn write_ready(&mut self) -> bool {
        loop {
            let Some(Slot::Ready(front)) = self.outbound.front() else {
                return true;
            };
            let len = front.len();

            match self.socket.write(&front[self.head_offset..]) {
                Ok(0) => {
                    self.on_error(io::Error::from(io::ErrorKind::WriteZero));
                    return false;
                }
                Ok(n) => {
                    self.stats.bytes_written(n);
                    self.head_offset += n;
                    if self.head_offset >= len {
                        self.outbound.pop_front();
                        self.head_offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.on_error(e);
                    return false;
                }
            }
        }
    }

    /// Closes the connection if the input buffer is full while nothing is
    /// queued: the buffered header can never complete. Returns whether the
    /// connection is still alive.
    fn check_input_overflow(&mut self) -> bool {
        if !self.is_alive() {
            return false;
        }
        if self.input.len() >= self.limits.max_input_buffer && !self.is_backpressured() {
            self.on_protocol_error(ParseError::LineTooLong {
                max: self.limits.max_input_buffer,
            });
            return false;
        }
        true
    }

    /// Runs the state machine until it stalls or backpressure stops it.
    fn process(&mut self) {
        while self.is_alive() && !self.is_backpressured() {
            if let Step::Stalled = self.step() {
                break;
            }
        }
    }

    /// Performs one state transition.
    fn step(&mut self) -> Step {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => self.read_header(),
            State::AwaitingArgument {
                command,
                remaining,
                argument,
            } => self.fill_argument(command, remaining, argument),
            State::ReadyToExecute { command, argument } => {
                self.dispatch(command, argument);
                Step::Progress
            }
            State::Closed => {
                self.state = State::Closed;
                Step::Stalled
            }
        }
    }

    fn read_header(&mut self) -> Step {
        if self.input.is_empty() {
            return Step::Stalled;
        }

        match self.parser.parse(&self.input) {
            Ok((0, _)) => Step::Stalled,
            Ok((consumed, recognized)) => {
                self.input.advance(consumed);
                if recognized {
                    if let Some((command, argument_len)) = self.parser.build() {
                        trace!(conn = self.id, command = command.name(), "Parsed command");
                        self.state = match argument_len {
                            Some(len) => State::AwaitingArgument {
                                command,
                                remaining: len + CRLF.len(),
                                argument: BytesMut::with_capacity(len + CRLF.len()),
                            },
                            None => State::ReadyToExecute {
                                command,
                                argument: Ok(Bytes::new()),
                            },
                        };
                    }
                }
                Step::Progress
            }
            Err(e) => {
                self.on_protocol_error(e);
                Step::Stalled
            }
        }
    }

    fn fill_argument(&mut self, command: Command, remaining: usize, mut argument: BytesMut) -> Step {
        if self.input.is_empty() {
            self.state = State::AwaitingArgument {
                command,
                remaining,
                argument,
            };
            return Step::Stalled;
        }

        let take = remaining.min(self.input.len());
        argument.put_slice(&self.input[..take]);
        self.input.advance(take);
        let remaining = remaining - take;

        if remaining > 0 {
            self.state = State::AwaitingArgument {
                command,
                remaining,
                argument,
            };
            return Step::Progress;
        }

        let terminated = argument.ends_with(CRLF);
        argument.truncate(argument.len() - CRLF.len());
        self.state = State::ReadyToExecute {
            command,
            argument: if terminated {
                Ok(argument.freeze())
            } else {
                Err(CommandError::BadDataChunk)
            },
        };
        Step::Progress
    }

    fn dispatch(&mut self, command: Command, argument: Result<Bytes, CommandError>) {
        self.stats.command_processed();
        self.parser.reset();

        let argument = match argument {
            Ok(argument) => argument,
            Err(e) => {
                self.push_reply(e.reply());
                return;
            }
        };

        let pool = match &self.dispatch {
            Dispatch::Inline => None,
            Dispatch::Pool(pool) => Some(Arc::clone(pool)),
        };

        let Some(pool) = pool else {
            let body = run_command(&self.cache, &command, argument);
            self.push_reply(body);
            return;
        };

        let seq = self.next_seq;
        self.next_seq += 1;

        let completion = Completion {
            seq,
            tx: self.completion_tx.clone(),
            notify: Arc::clone(&self.notify),
            sent: false,
        };
        let cache = self.cache.clone();
        let name = command.name();

        let submitted = pool.execute(move || {
            let body = run_command(&cache, &command, argument);
            completion.complete(body);
        });

        match submitted {
            Ok(()) => self.outbound.push_back(Slot::Pending(seq)),
            Err(e) => {
                self.stats.command_rejected();
                warn!(conn = self.id, command = name, error = %e, "Command rejected by worker pool");
                self.push_reply(Bytes::from_static(reply::BUSY));
            }
        }
    }

    fn push_reply(&mut self, body: Bytes) {
        self.outbound.push_back(Slot::Ready(frame(body)));
    }

    fn drain_completions(&mut self) {
        while let Ok((seq, framed)) = self.completion_rx.try_recv() {
            // Unknown sequence numbers belong to rejected submissions
            if let Some(slot) = self
                .outbound
                .iter_mut()
                .find(|slot| matches!(slot, Slot::Pending(pending) if *pending == seq))
            {
                *slot = Slot::Ready(framed);
            }
        }
    }

    fn update_interest(&mut self) {
        self.interest = if self.is_alive() {
            Interest {
                read: self.input.len() < self.limits.max_input_buffer,
                write: matches!(self.outbound.front(), Some(Slot::Ready(_))),
            }
        } else {
            Interest::NONE
        };
    }

    fn close(&mut self) {
        self.state = State::Closed;
        self.interest = Interest::NONE;
    }

    fn on_close(&mut self) {
        debug!(conn = self.id, "Connection closed by peer");
        self.close();
    }

    fn on_error(&mut self, error: io::Error) {
        if error.kind() == io::ErrorKind::ConnectionReset {
            debug!(conn = self.id, "Connection reset by peer");
        } else {
            warn!(conn = self.id, error = %error, "Connection error");
        }
        self.close();
    }

    fn on_protocol_error(&mut self, error: ParseError) {
        warn!(conn = self.id, error = %error, "Protocol error, closing connection");
        self.close();
    }
}

impl<S> Drop for ConnectionHandler<S> {
    fn drop(&mut self) {
        self.stats.connection_closed();
    }
}

/// Runs `command` under the cache lock and returns the reply body.
fn run_command(cache: &SharedCache, command: &Command, argument: Bytes) -> Bytes {
    match cache.with(|engine| command.execute(engine, argument)) {
        Ok(body) => body,
        Err(e) => e.reply(),
    }
}

/// Appends the line terminator to a reply body.
fn frame(body: Bytes) -> Bytes {
    let mut out = BytesMut::with_capacity(body.len() + CRLF.len());
    out.put_slice(&body);
    out.put_slice(CRLF);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::PoolConfig;
    use std::time::{Duration, Instant};

    /// Scripted nonblocking socket.
    #[derive(Default)]
    struct MockSocket {
        /// Results handed out by successive reads; empty means WouldBlock
        incoming: VecDeque<io::Result<Vec<u8>>>,
        written: Vec<u8>,
        /// Bytes accepted before writes start returning WouldBlock
        write_budget: Option<usize>,
        fail_writes: bool,
    }

    impl MockSocket {
        fn feed(&mut self, data: &[u8]) {
            self.incoming.push_back(Ok(data.to_vec()));
        }

        fn written_str(&self) -> String {
            String::from_utf8_lossy(&self.written).into_owned()
        }
    }

    impl Read for MockSocket {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.incoming.pop_front() {
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
                Some(Err(e)) => Err(e),
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.incoming.push_front(Ok(data[n..].to_vec()));
                    }
                    Ok(n)
                }
            }
        }
    }

    impl Write for MockSocket {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_writes {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            let n = match self.write_budget {
                Some(0) => return Err(io::Error::from(io::ErrorKind::WouldBlock)),
                Some(budget) => {
                    let n = budget.min(buf.len());
                    self.write_budget = Some(budget - n);
                    n
                }
                None => buf.len(),
            };
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn handler_with(
        dispatch: Dispatch,
        limits: ConnectionLimits,
    ) -> (ConnectionHandler<MockSocket>, SharedCache, Arc<ConnectionStats>) {
        let cache = SharedCache::new(1024);
        let stats = Arc::new(ConnectionStats::new());
        let mut handler = ConnectionHandler::new(
            1,
            MockSocket::default(),
            cache.clone(),
            dispatch,
            limits,
            Arc::clone(&stats),
        );
        handler.start();
        (handler, cache, stats)
    }

    fn inline_handler() -> (ConnectionHandler<MockSocket>, SharedCache, Arc<ConnectionStats>) {
        handler_with(Dispatch::Inline, ConnectionLimits::default())
    }

    #[test]
    fn test_start_arms_read_interest() {
        let (handler, _, stats) = inline_handler();
        assert_eq!(
            handler.interest(),
            Interest {
                read: true,
                write: false
            }
        );
        assert!(handler.is_alive());
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_set_then_get() {
        let (mut handler, _, _) = inline_handler();

        handler
            .socket_mut()
            .feed(b"set k 0 0 5\r\nhello\r\nget k\r\n");
        handler.do_read();

        assert_eq!(handler.outbound_len(), 2);
        assert!(handler.interest().write);

        handler.do_write();
        assert_eq!(
            handler.socket().written_str(),
            "STORED\r\nVALUE k 0 5\r\nhello\r\nEND\r\n"
        );
        assert_eq!(handler.outbound_len(), 0);
        assert_eq!(
            handler.interest(),
            Interest {
                read: true,
                write: false
            }
        );
    }

    #[test]
    fn test_argument_split_across_reads() {
        let (mut handler, cache, stats) = inline_handler();

        handler.socket_mut().feed(b"set k 0 0 10\r\nhello");
        handler.do_read();
        assert_eq!(handler.outbound_len(), 0);
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 0);

        handler.socket_mut().feed(b"world\r\n");
        handler.do_read();
        assert_eq!(handler.outbound_len(), 1);
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 1);
        assert_eq!(
            cache.with(|engine| engine.get(b"k")),
            Some(Bytes::from("helloworld"))
        );

        handler.do_write();
        assert_eq!(handler.socket().written_str(), "STORED\r\n");
    }

    #[test]
    fn test_header_split_across_reads() {
        let (mut handler, _, _) = inline_handler();

        handler.socket_mut().feed(b"se");
        handler.do_read();
        assert_eq!(handler.input_len(), 2);

        handler.socket_mut().feed(b"t k 0 0 1\r\nx\r");
        handler.do_read();
        assert_eq!(handler.outbound_len(), 0);

        handler.socket_mut().feed(b"\n");
        handler.do_read();
        handler.do_write();
        assert_eq!(handler.socket().written_str(), "STORED\r\n");
    }

    #[test]
    fn test_pipelined_commands_in_one_read() {
        let (mut handler, _, stats) = inline_handler();

        handler
            .socket_mut()
            .feed(b"set a 0 0 1\r\n1\r\nset b 0 0 1\r\n2\r\nget a b\r\ndelete a\r\nget a\r\n");
        handler.do_read();
        handler.do_write();

        assert_eq!(
            handler.socket().written_str(),
            "STORED\r\nSTORED\r\nVALUE a 0 1\r\n1\r\nVALUE b 0 1\r\n2\r\nEND\r\nDELETED\r\nEND\r\n"
        );
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_bad_data_chunk_is_recoverable() {
        let (mut handler, cache, _) = inline_handler();

        handler
            .socket_mut()
            .feed(b"set k 0 0 2\r\nabcd\r\nversion\r\n");
        handler.do_read();
        handler.do_write();

        let written = handler.socket().written_str();
        assert!(written.starts_with("CLIENT_ERROR bad data chunk\r\nVERSION "));
        assert!(handler.is_alive());
        assert!(!cache.with(|engine| engine.contains(b"k")));
    }

    #[test]
    fn test_peer_close() {
        let (mut handler, _, _) = inline_handler();

        handler.socket_mut().feed(b"");
        handler.do_read();

        assert!(!handler.is_alive());
        assert!(handler.interest().is_empty());
    }

    #[test]
    fn test_peer_close_flushes_ready_replies() {
        let (mut handler, _, _) = inline_handler();

        handler.socket_mut().feed(b"version\r\n");
        handler.socket_mut().feed(b"");
        handler.do_read();

        let written = handler.socket().written_str();
        assert!(written.starts_with("VERSION "));
        assert!(written.ends_with("\r\n"));
        assert!(!handler.is_alive());
        assert!(handler.interest().is_empty());
    }

    #[test]
    fn test_read_error_closes() {
        let (mut handler, _, _) = inline_handler();

        handler
            .socket_mut()
            .incoming
            .push_back(Err(io::Error::from(io::ErrorKind::ConnectionReset)));
        handler.do_read();

        assert!(!handler.is_alive());
        assert!(handler.interest().is_empty());
    }

    #[test]
    fn test_malformed_header_closes() {
        let (mut handler, cache, _) = inline_handler();

        handler.socket_mut().feed(b"bogus command\r\nset k 0 0 1\r\nv\r\n");
        handler.do_read();

        assert!(!handler.is_alive());
        assert_eq!(handler.outbound_len(), 0);
        assert!(cache.with(|engine| engine.is_empty()));
    }

    #[test]
    fn test_partial_write_keeps_offset() {
        let (mut handler, _, _) = inline_handler();

        handler.socket_mut().write_budget = Some(3);
        handler.socket_mut().feed(b"version\r\n");
        handler.do_read();

        handler.do_write();
        assert_eq!(handler.socket().written_str(), "VER");
        assert_eq!(handler.outbound_len(), 1);
        assert!(handler.interest().write);

        handler.socket_mut().write_budget = None;
        handler.do_write();
        assert!(handler.socket().written_str().starts_with("VERSION "));
        assert!(handler.socket().written_str().ends_with("\r\n"));
        assert_eq!(handler.outbound_len(), 0);
        assert!(!handler.interest().write);
    }

    #[test]
    fn test_write_error_closes() {
        let (mut handler, _, _) = inline_handler();

        handler.socket_mut().fail_writes = true;
        handler.socket_mut().feed(b"version\r\n");
        handler.do_read();
        handler.do_write();

        assert!(!handler.is_alive());
        assert!(handler.interest().is_empty());
    }

    #[test]
    fn test_backpressure_pauses_dispatch() {
        let limits = ConnectionLimits {
            max_output_queue: 2,
            max_input_buffer: DEFAULT_MAX_INPUT_BUFFER,
        };
        let (mut handler, _, stats) = handler_with(Dispatch::Inline, limits);

        handler
            .socket_mut()
            .feed(b"get a\r\nget b\r\nget c\r\nget d\r\n");
        handler.do_read();

        // Two replies queued, the rest of the input stays buffered
        assert_eq!(handler.outbound_len(), 2);
        assert_eq!(handler.input_len(), 14);
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 2);
        assert!(handler.interest().read);

        // Draining resumes dispatch
        handler.do_write();
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 4);
        assert_eq!(handler.input_len(), 0);

        handler.do_write();
        assert_eq!(handler.socket().written_str(), "END\r\n".repeat(4));
    }

    #[test]
    fn test_backpressure_stops_reading_when_input_full() {
        let limits = ConnectionLimits {
            max_output_queue: 1,
            max_input_buffer: 16,
        };
        let (mut handler, _, _) = handler_with(Dispatch::Inline, limits);

        handler.socket_mut().write_budget = Some(0);
        handler
            .socket_mut()
            .feed(b"get a\r\nget b\r\nget c\r\nget d\r\nget e\r\n");
        handler.do_read();

        assert_eq!(handler.outbound_len(), 1);
        assert_eq!(handler.input_len(), 16);
        assert_eq!(
            handler.interest(),
            Interest {
                read: false,
                write: true
            }
        );

        handler.socket_mut().write_budget = None;
        for _ in 0..10 {
            handler.do_write();
            handler.do_read();
        }
        assert_eq!(handler.socket().written_str(), "END\r\n".repeat(5));
    }

    #[test]
    fn test_header_larger_than_input_buffer_closes() {
        let limits = ConnectionLimits {
            max_output_queue: DEFAULT_MAX_OUTPUT_QUEUE,
            max_input_buffer: 8,
        };
        let (mut handler, _, _) = handler_with(Dispatch::Inline, limits);

        handler.socket_mut().feed(b"get averyveryverylongkey\r\n");
        handler.do_read();

        assert!(!handler.is_alive());
        assert!(handler.interest().is_empty());
    }

    #[test]
    fn test_unfinishable_header_closes_after_drain() {
        let limits = ConnectionLimits {
            max_output_queue: 1,
            max_input_buffer: 16,
        };
        let (mut handler, _, _) = handler_with(Dispatch::Inline, limits);

        handler.socket_mut().write_budget = Some(0);
        handler
            .socket_mut()
            .feed(b"get a\r\nget bbbbbbbbbbbbbbbbbbbb");
        handler.do_read();

        // Backpressured, so the full buffer is not an error yet
        assert!(handler.is_alive());
        assert_eq!(handler.input_len(), 16);
        assert!(!handler.interest().read);

        // Draining the reply leaves a header that can never complete
        handler.socket_mut().write_budget = None;
        handler.do_write();

        assert_eq!(handler.socket().written_str(), "END\r\n");
        assert!(!handler.is_alive());
        assert!(handler.interest().is_empty());
    }

    fn single_worker_pool() -> Arc<WorkerPool> {
        let pool = Arc::new(
            WorkerPool::new(PoolConfig {
                name: "conn-test".to_string(),
                low_watermark: 1,
                high_watermark: 1,
                ..PoolConfig::default()
            })
            .unwrap(),
        );
        pool.start().unwrap();
        pool
    }

    /// Occupies the pool's only worker until the returned sender is used.
    fn block_worker(pool: &WorkerPool) -> mpsc::Sender<()> {
        let (release, blocked) = mpsc::channel::<()>();
        pool.execute(move || {
            let _ = blocked.recv();
        })
        .unwrap();
        release
    }

    fn wait_for_completions(handler: &mut ConnectionHandler<MockSocket>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            handler.collect_completions();
            if handler.pending_len() == 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("pooled commands did not complete");
    }

    #[test]
    fn test_pool_dispatch_preserves_order() {
        let pool = Arc::new(
            WorkerPool::new(PoolConfig {
                name: "conn-test".to_string(),
                low_watermark: 1,
                high_watermark: 1,
                ..PoolConfig::default()
            })
            .unwrap(),
        );
        pool.start().unwrap();

        let (mut handler, _, _) =
            handler_with(Dispatch::Pool(Arc::clone(&pool)), ConnectionLimits::default());

        handler
            .socket_mut()
            .feed(b"set k 0 0 1\r\nv\r\nget k\r\ndelete k\r\n");
        handler.do_read();
        assert_eq!(handler.outbound_len(), 3);

        wait_for_completions(&mut handler);
        assert!(handler.interest().write);

        handler.do_write();
        // A single worker runs tasks FIFO, so the replies are deterministic
        assert_eq!(
            handler.socket().written_str(),
            "STORED\r\nVALUE k 0 1\r\nv\r\nEND\r\nDELETED\r\n"
        );
        assert_eq!(handler.outbound_len(), 0);

        pool.stop(true);
    }

    #[test]
    fn test_pool_backpressure_counts_pending_slots() {
        let pool = single_worker_pool();
        let release = block_worker(&pool);

        let limits = ConnectionLimits {
            max_output_queue: 2,
            max_input_buffer: DEFAULT_MAX_INPUT_BUFFER,
        };
        let (mut handler, _, stats) = handler_with(Dispatch::Pool(Arc::clone(&pool)), limits);

        handler
            .socket_mut()
            .feed(b"get a\r\nget b\r\nget c\r\n");
        handler.do_read();

        // Two pending slots fill the queue; the third header waits
        assert_eq!(handler.outbound_len(), 2);
        assert_eq!(handler.pending_len(), 2);
        assert_eq!(handler.input_len(), 7);
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 2);
        assert_eq!(
            handler.interest(),
            Interest {
                read: true,
                write: false
            }
        );

        release.send(()).unwrap();
        wait_for_completions(&mut handler);
        handler.do_write();
        assert_eq!(stats.commands_processed.load(Ordering::Relaxed), 3);
        assert_eq!(handler.input_len(), 0);

        wait_for_completions(&mut handler);
        handler.do_write();
        assert_eq!(handler.socket().written_str(), "END\r\n".repeat(3));
        assert_eq!(handler.outbound_len(), 0);

        pool.stop(true);
    }

    /// Reserves a pooled slot whose task panics before replying.
    fn submit_panicking_slot(handler: &mut ConnectionHandler<MockSocket>, pool: &WorkerPool) {
        let seq = handler.next_seq;
        handler.next_seq += 1;
        let completion = Completion {
            seq,
            tx: handler.completion_tx.clone(),
            notify: handler.notifier(),
            sent: false,
        };
        handler.outbound.push_back(Slot::Pending(seq));
        pool.execute(move || {
            let _completion = completion;
            panic!("command failed");
        })
        .unwrap();
    }

    #[test]
    fn test_panicked_task_replies_aborted_in_order() {
        let pool = single_worker_pool();
        let (mut handler, _, _) =
            handler_with(Dispatch::Pool(Arc::clone(&pool)), ConnectionLimits::default());

        handler.socket_mut().feed(b"set k 0 0 1\r\nv\r\n");
        handler.do_read();
        submit_panicking_slot(&mut handler, &pool);
        handler.socket_mut().feed(b"get k\r\n");
        handler.do_read();
        assert_eq!(handler.outbound_len(), 3);

        wait_for_completions(&mut handler);
        handler.do_write();

        assert_eq!(
            handler.socket().written_str(),
            "STORED\r\nSERVER_ERROR command aborted\r\nVALUE k 0 1\r\nv\r\nEND\r\n"
        );
        assert!(handler.is_alive());
        assert_eq!(pool.stats().panicked, 1);

        pool.stop(true);
    }

    #[test]
    fn test_pool_rejection_replies_busy() {
        let pool = Arc::new(WorkerPool::new(PoolConfig::default()).unwrap());
        // Never started: every submission is rejected

        let (mut handler, _, stats) =
            handler_with(Dispatch::Pool(pool), ConnectionLimits::default());

        handler.socket_mut().feed(b"get k\r\n");
        handler.do_read();
        handler.do_write();

        assert_eq!(handler.socket().written_str(), "SERVER_ERROR busy\r\n");
        assert_eq!(stats.commands_rejected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_drop_marks_connection_closed() {
        let (handler, _, stats) = inline_handler();
        drop(handler);
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
    }
}
