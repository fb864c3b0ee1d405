//! Reactor
//!
//! The server accepts connections on a tokio [`TcpListener`] and gives each
//! one its own task. The task owns a [`ConnectionHandler`] and does nothing
//! but wait for the readiness the handler asks for:
//!
//! ```text
//!   ┌──────────────┐   accept    ┌──────────────────────────────┐
//!   │ TcpListener  │ ──────────> │ connection task              │
//!   └──────────────┘             │                              │
//!                                │  loop {                      │
//!                                │    select! {                 │
//!                                │      ready(interest) ──> do_read / do_write
//!                                │      notified       ──> collect_completions
//!                                │      shutdown       ──> break
//!                                │    }                         │
//!                                │  }                           │
//!                                └──────────────────────────────┘
//! ```
//!
//! Sockets are never read or written with `.await`; the handler uses
//! `try_read`/`try_write`, which report `WouldBlock` exactly like a raw
//! nonblocking socket. A handler that is no longer alive is dropped, which
//! closes its socket.

use crate::connection::{ConnectionHandler, ConnectionLimits, ConnectionStats, Dispatch, Interest};
use crate::storage::SharedCache;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::Ready;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A tokio `TcpStream` seen through nonblocking `Read`/`Write`.
pub struct TcpSocket {
    stream: TcpStream,
}

impl TcpSocket {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        let wanted = match (interest.read, interest.write) {
            (true, true) => tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
            (true, false) => tokio::io::Interest::READABLE,
            (false, true) => tokio::io::Interest::WRITABLE,
            // Only a completion notification can make progress
            (false, false) => return std::future::pending().await,
        };
        self.stream.ready(wanted).await
    }
}

impl Read for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }
}

impl Write for TcpSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The listening server.
pub struct Server {
    listener: TcpListener,
    cache: SharedCache,
    dispatch: Dispatch,
    limits: ConnectionLimits,
    stats: Arc<ConnectionStats>,
}

impl Server {
    /// Binds the listener. Nothing is accepted until [`Server::run`].
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        cache: SharedCache,
        dispatch: Dispatch,
        limits: ConnectionLimits,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            cache,
            dispatch,
            limits,
            stats: Arc::new(ConnectionStats::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    /// Accepts connections until `shutdown` flips (or its sender is
    /// dropped), then waits for every connection task to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self.listener.local_addr() {
            Ok(addr) => info!(addr = %addr, "Listening"),
            Err(e) => warn!(error = %e, "Listening on unknown address"),
        }

        let mut tasks = JoinSet::new();
        let mut next_id: u64 = 0;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        next_id += 1;
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(conn = next_id, error = %e, "Failed to set TCP_NODELAY");
                        }

                        let handler = ConnectionHandler::new(
                            next_id,
                            TcpSocket::new(stream),
                            self.cache.clone(),
                            self.dispatch.clone(),
                            self.limits,
                            Arc::clone(&self.stats),
                        );
                        tasks.spawn(serve_connection(handler, peer, shutdown.clone()));
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown.changed() => {
                    info!(connections = tasks.len(), "Shutting down, no longer accepting");
                    break;
                }
            }
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Connection task failed");
            }
        }
        info!("All connections closed");
    }
}

/// Drives one connection until it dies or the server shuts down.
async fn serve_connection(
    mut handler: ConnectionHandler<TcpSocket>,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(conn = handler.id(), peer = %peer, "Client connected");

    let notify = handler.notifier();
    handler.start();

    while handler.is_alive() {
        let interest = handler.interest();

        tokio::select! {
            ready = handler.socket().ready(interest) => match ready {
                Ok(ready) => {
                    if ready.is_readable() || ready.is_read_closed() {
                        handler.do_read();
                    }
                    if ready.is_writable() || ready.is_write_closed() {
                        handler.do_write();
                    }
                }
                Err(e) => {
                    warn!(conn = handler.id(), error = %e, "Readiness wait failed");
                    break;
                }
            },
            _ = notify.notified() => handler.collect_completions(),
            _ = shutdown.changed() => {
                debug!(conn = handler.id(), "Closing connection for shutdown");
                break;
            }
        }
    }

    info!(conn = handler.id(), peer = %peer, "Client disconnected");
}
