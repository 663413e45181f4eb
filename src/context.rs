// src/context.rs
//
// Explicit server context shared by the reactor and the worker pool: the
// epoll handle, the connection table, counters, and configuration. Replaces
// the process-wide epoll fd and user count the naive design would use.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::error::ServerResult;
use crate::metrics::ServerMetrics;
use crate::syscalls::{self, Epoll};
use crate::table::{ConnTable, ConnToken};

/// Token reserved for the listening socket; connection tokens never collide
/// with it because slot indices are bounded by the table capacity.
pub const LISTENER_TOKEN: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

pub struct ServerContext {
    pub epoll: Epoll,
    pub table: ConnTable,
    pub metrics: ServerMetrics,
    pub doc_root: PathBuf,
    shutdown: AtomicBool,
}

impl ServerContext {
    pub fn new(table: ConnTable, doc_root: PathBuf) -> ServerResult<Self> {
        Ok(Self {
            epoll: Epoll::new()?,
            table,
            metrics: ServerMetrics::new(),
            doc_root,
            shutdown: AtomicBool::new(false),
        })
    }

    fn conn_interests(interest: Interest) -> i32 {
        let readiness = match interest {
            Interest::Readable => libc::EPOLLIN,
            Interest::Writable => libc::EPOLLOUT,
        };
        // Oneshot is the exclusivity mechanism: no second event can fire for
        // this connection until the current pass re-arms it.
        readiness | libc::EPOLLRDHUP | libc::EPOLLONESHOT
    }

    /// Level-free (edge-triggered) registration of the listening socket,
    /// without oneshot: the reactor drains accepts on every event.
    pub fn register_listener(&self, fd: i32) -> ServerResult<()> {
        self.epoll.add(fd, LISTENER_TOKEN, libc::EPOLLIN)
    }

    /// Register a fresh connection exclusive-readable.
    pub fn register_conn(&self, fd: i32, token: ConnToken) -> ServerResult<()> {
        self.epoll
            .add(fd, token.as_u64(), Self::conn_interests(Interest::Readable))
    }

    /// Re-enable exclusive delivery for the next event. Must be the last
    /// action of a handling pass, after all shared-state mutation.
    pub fn rearm(&self, fd: i32, token: ConnToken, interest: Interest) -> ServerResult<()> {
        self.epoll
            .modify(fd, token.as_u64(), Self::conn_interests(interest))
    }

    /// Tear a connection down: deregister, close, free the slot. Idempotent
    /// and callable from the reactor or a worker; the generation bump in
    /// `retire` picks exactly one winner.
    pub fn deregister_and_close(&self, token: ConnToken) {
        let Some(slot) = self.table.retire(token) else {
            return;
        };
        let fd = {
            let mut conn = slot.lock().expect("connection slot poisoned");
            let fd = conn.fd;
            conn.fd = -1;
            conn.peer = None;
            conn.file = None;
            fd
        };
        if fd >= 0 {
            self.epoll.delete(fd).ok();
            syscalls::close(fd);
            self.metrics.dec_conn();
            debug!(fd, "connection closed");
        }
        self.table.release(token.index);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
