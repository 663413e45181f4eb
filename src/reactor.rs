// src/reactor.rs
//
// The single event-loop thread. It owns every socket syscall: accepting,
// draining reads into connection buffers, and pushing responses out. Parsing
// and response construction happen on the worker pool; the oneshot re-arm
// discipline means no connection is ever handled by two threads at once.
use std::net::SocketAddr;
use std::sync::Arc;

use libc::epoll_event;
use tracing::{debug, error, info, warn};

use crate::context::{Interest, LISTENER_TOKEN, ServerContext};
use crate::error::{ServerError, ServerResult};
use crate::pool::WorkerPool;
use crate::response::{self, BUSY_MESSAGE, WriteProgress};
use crate::syscalls;
use crate::table::ConnToken;

const MAX_EVENTS: usize = 1024;
// Bounded so the shutdown flag is observed promptly.
const WAIT_TIMEOUT_MS: i32 = 500;

pub struct Reactor {
    ctx: Arc<ServerContext>,
    pool: WorkerPool,
    listen_fd: i32,
}

enum After {
    Rearm(Interest),
    Close,
}

impl Reactor {
    pub fn new(ctx: Arc<ServerContext>, pool: WorkerPool, listen_fd: i32) -> ServerResult<Self> {
        ctx.register_listener(listen_fd)?;
        Ok(Self {
            ctx,
            pool,
            listen_fd,
        })
    }

    /// Block on readiness until shutdown is requested, translating events
    /// into accepts, reads, dispatches, and writes. Per-connection failures
    /// tear down that connection only; the loop itself exits only on
    /// shutdown or an epoll failure.
    pub fn run(self) {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        while !self.ctx.is_shutdown() {
            let n = match self.ctx.epoll.wait(&mut events, WAIT_TIMEOUT_MS) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "epoll wait failed");
                    break;
                }
            };

            for i in 0..n {
                let raw_token = events[i].u64;
                let flags = events[i].events;

                if raw_token == LISTENER_TOKEN {
                    self.accept_pending();
                    continue;
                }

                let token = ConnToken::from_u64(raw_token);
                if flags & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
                    self.ctx.deregister_and_close(token);
                } else if flags & libc::EPOLLIN as u32 != 0 {
                    self.on_readable(token);
                } else if flags & libc::EPOLLOUT as u32 != 0 {
                    self.on_writable(token);
                }
            }
        }

        self.teardown();
    }

    /// Edge-triggered listener: accept until nothing is pending. A dead
    /// connection in the backlog must not end the drain; the listener's
    /// readable state never transitions while the backlog stays non-empty,
    /// so anything left behind would sit unserviced until the next SYN.
    fn accept_pending(&self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => self.admit(fd, peer),
                Ok(None) => break,
                Err(e) if accept_error_is_transient(&e) => {
                    debug!(error = %e, "skipping aborted connection in accept drain");
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&self, fd: i32, peer: Option<SocketAddr>) {
        let Some(token) = self.ctx.table.allocate() else {
            // At capacity: synchronous rejection, never enters the table.
            self.ctx.metrics.inc_rejected();
            warn!(fd, "connection table full, rejecting");
            let _ = syscalls::write_nonblocking(fd, BUSY_MESSAGE);
            syscalls::close(fd);
            return;
        };

        if let Some(slot) = self.ctx.table.get(token) {
            let mut conn = slot.lock().expect("connection slot poisoned");
            conn.init(fd, peer);
        }
        self.ctx.metrics.inc_conn();

        if let Err(e) = self.ctx.register_conn(fd, token) {
            debug!(fd, error = %e, "failed to register connection");
            self.ctx.deregister_and_close(token);
            return;
        }
        debug!(fd, ?peer, "accepted connection");
    }

    /// Raw read, then hand the connection to the pool. The worker re-arms.
    fn on_readable(&self, token: ConnToken) {
        let Some(slot) = self.ctx.table.get(token) else {
            return;
        };
        let ok = {
            let mut conn = slot.lock().expect("connection slot poisoned");
            if conn.fd < 0 {
                return;
            }
            conn.fill_from_socket()
        };
        if ok {
            self.pool.submit(token);
        } else {
            self.ctx.deregister_and_close(token);
        }
    }

    fn on_writable(&self, token: ConnToken) {
        let Some(slot) = self.ctx.table.get(token) else {
            return;
        };
        let (fd, after) = {
            let mut conn = slot.lock().expect("connection slot poisoned");
            if conn.fd < 0 {
                return;
            }
            let fd = conn.fd;
            let sent_before = conn.bytes_sent;
            let progress = response::transmit(&mut conn);
            self.ctx.metrics.add_bytes(conn.bytes_sent - sent_before);

            match progress {
                WriteProgress::Blocked => (fd, After::Rearm(Interest::Writable)),
                WriteProgress::Complete { keep_alive: true } => {
                    // Ready for the next request on the same socket.
                    conn.reset_for_next_request();
                    (fd, After::Rearm(Interest::Readable))
                }
                WriteProgress::Complete { keep_alive: false } => (fd, After::Close),
                WriteProgress::Error => (fd, After::Close),
            }
        };

        match after {
            After::Rearm(interest) => {
                if self.ctx.rearm(fd, token, interest).is_err() {
                    self.ctx.deregister_and_close(token);
                }
            }
            After::Close => self.ctx.deregister_and_close(token),
        }
    }

    fn teardown(self) {
        info!("reactor shutting down");
        self.ctx.request_shutdown();
        self.pool.shutdown();

        self.ctx.epoll.delete(self.listen_fd).ok();
        syscalls::close(self.listen_fd);
        for token in self.ctx.table.active_tokens() {
            self.ctx.deregister_and_close(token);
        }
    }
}

/// Failures that belong to one queued connection, not to the listener: the
/// peer reset before we accepted it. Resource exhaustion (EMFILE, ENFILE,
/// ENOMEM) hits the listener itself and ends the drain instead.
fn accept_error_is_transient(err: &ServerError) -> bool {
    match err {
        ServerError::Io(e) => matches!(
            e.raw_os_error(),
            Some(libc::ECONNABORTED) | Some(libc::EPROTO)
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn os_error(code: i32) -> ServerError {
        ServerError::Io(io::Error::from_raw_os_error(code))
    }

    #[test]
    fn aborted_connection_does_not_end_the_accept_drain() {
        assert!(accept_error_is_transient(&os_error(libc::ECONNABORTED)));
        assert!(accept_error_is_transient(&os_error(libc::EPROTO)));
    }

    #[test]
    fn listener_level_failures_end_the_accept_drain() {
        assert!(!accept_error_is_transient(&os_error(libc::EMFILE)));
        assert!(!accept_error_is_transient(&os_error(libc::ENFILE)));
        assert!(!accept_error_is_transient(&os_error(libc::ECONNRESET)));
        assert!(!accept_error_is_transient(&ServerError::Startup(
            "spawn failed".to_string()
        )));
    }
}
