//! A listener fed by the acceptor loop instead of a socket
//!
//! Connections the router keeps for the local HTTPS stack are pushed through a
//! [`ConnectionInjector`] and come out of [`InjectableListener::accept`] in FIFO
//! order, already sniffed and ready for a TLS handshake.

use crate::sniffer::SniffedStream;
use portico_router::HandoffReason;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// The listener was closed; no connection will be accepted or queued again
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Listener closed")]
pub struct ListenerClosedError;

/// A sniffed connection routed to the local HTTPS stack
#[derive(Debug)]
pub struct HandoffConnection {
    pub stream: SniffedStream<TcpStream>,
    pub peer_addr: SocketAddr,
    pub reason: HandoffReason,
}

/// Accept side of the queue
pub struct InjectableListener<C = HandoffConnection> {
    queue: Mutex<mpsc::UnboundedReceiver<C>>,
    closed: CancellationToken,
    local_addr: Option<SocketAddr>,
}

/// Push side of the queue, cloned into every connection task
pub struct ConnectionInjector<C = HandoffConnection> {
    queue: mpsc::UnboundedSender<C>,
    closed: CancellationToken,
}

impl<C> Clone for ConnectionInjector<C> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<C> InjectableListener<C> {
    /// Create a listener and the injector that feeds it
    pub fn new() -> (Self, ConnectionInjector<C>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let listener = Self {
            queue: Mutex::new(rx),
            closed: closed.clone(),
            local_addr: None,
        };
        let injector = ConnectionInjector { queue: tx, closed };
        (listener, injector)
    }

    /// Record the public address connections originally arrived on
    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Wait for the next pushed connection
    ///
    /// Returns [`ListenerClosedError`] once [`close`](Self::close) was called or
    /// every injector is gone.
    pub async fn accept(&self) -> Result<C, ListenerClosedError> {
        let mut queue = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(ListenerClosedError),
            queue = self.queue.lock() => queue,
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                queue.close();
                Err(ListenerClosedError)
            }
            conn = queue.recv() => conn.ok_or(ListenerClosedError),
        }
    }

    /// Stop accepting; pending and future `accept` calls fail, pushes fail
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl<C> ConnectionInjector<C> {
    /// Queue a connection for the listener; never blocks
    ///
    /// After close the connection is dropped, which closes it.
    pub fn push(&self, conn: C) -> Result<(), ListenerClosedError> {
        if self.closed.is_cancelled() {
            return Err(ListenerClosedError);
        }
        self.queue.send(conn).map_err(|_| ListenerClosedError)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.queue.is_closed()
    }
}
