// src/pool.rs
//
// Fixed worker pool consuming a FIFO queue of connection tokens. Workers do
// the CPU-bound half of a request (parse, resolve, build) so the reactor
// thread never stalls on it; each token is popped exactly once under the
// queue lock.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::trace;

use crate::context::{Interest, ServerContext};
use crate::error::{ServerError, ServerResult};
use crate::parser::{self, RequestStatus};
use crate::response;
use crate::table::ConnToken;

struct PoolShared {
    queue: Mutex<VecDeque<ConnToken>>,
    available: Condvar,
    shutdown: AtomicBool,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers once at startup. Spawn failure is fatal.
    pub fn start(size: usize, ctx: Arc<ServerContext>) -> ServerResult<Self> {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(size);
        for id in 0..size {
            let shared = shared.clone();
            let ctx = ctx.clone();
            let handle = thread::Builder::new()
                .name(format!("mazurka-worker-{id}"))
                .spawn(move || worker_loop(id, shared, ctx))
                .map_err(|e| {
                    ServerError::Startup(format!("failed to spawn worker {id}: {e}"))
                })?;
            handles.push(handle);
        }

        Ok(Self { shared, handles })
    }

    /// Append a ready connection and wake exactly one idle worker.
    /// Non-blocking from the caller's perspective.
    pub fn submit(&self, token: ConnToken) {
        let mut queue = self.shared.queue.lock().expect("task queue poisoned");
        queue.push_back(token);
        self.shared.available.notify_one();
    }

    /// Stop accepting work and join every worker.
    pub fn shutdown(mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(id: usize, shared: Arc<PoolShared>, ctx: Arc<ServerContext>) {
    trace!(worker = id, "worker started");
    loop {
        let token = {
            let mut queue = shared.queue.lock().expect("task queue poisoned");
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    trace!(worker = id, "worker exiting");
                    return;
                }
                if let Some(token) = queue.pop_front() {
                    break token;
                }
                queue = shared.available.wait(queue).expect("task queue poisoned");
            }
        };
        process(&ctx, token);
    }
}

enum NextStep {
    RearmRead,
    RearmWrite,
    Close,
}

/// Entry point for one handling pass: parse everything buffered, and either
/// ask for more input or stage a response. The slot lock is held for the
/// whole pass; re-arming happens after it is dropped, as the final action.
pub fn process(ctx: &ServerContext, token: ConnToken) {
    let Some(slot) = ctx.table.get(token) else {
        // Stale token: the connection was torn down after dispatch.
        return;
    };

    let (fd, step) = {
        let mut conn = slot.lock().expect("connection slot poisoned");
        if conn.fd < 0 {
            return;
        }
        let fd = conn.fd;

        match parser::process_read(&mut conn, &ctx.doc_root) {
            RequestStatus::Incomplete => (fd, NextStep::RearmRead),
            status => {
                ctx.metrics.inc_req();
                if response::build_response(&mut conn, status) {
                    (fd, NextStep::RearmWrite)
                } else {
                    // Best-effort 500; if even that does not fit, give up.
                    conn.file = None;
                    if response::build_response(&mut conn, RequestStatus::InternalError) {
                        (fd, NextStep::RearmWrite)
                    } else {
                        (fd, NextStep::Close)
                    }
                }
            }
        }
    };

    match step {
        NextStep::RearmRead => {
            if ctx.rearm(fd, token, Interest::Readable).is_err() {
                ctx.deregister_and_close(token);
            }
        }
        NextStep::RearmWrite => {
            if ctx.rearm(fd, token, Interest::Writable).is_err() {
                ctx.deregister_and_close(token);
            }
        }
        NextStep::Close => ctx.deregister_and_close(token),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ConnTable;
    use std::path::PathBuf;

    fn test_ctx() -> Arc<ServerContext> {
        Arc::new(ServerContext::new(ConnTable::new(4), PathBuf::from("/tmp")).unwrap())
    }

    #[test]
    fn pool_starts_and_shuts_down() {
        let pool = WorkerPool::start(4, test_ctx()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn tokens_are_queued_in_submission_order() {
        // No workers, so nothing drains the queue behind our back; the
        // queue itself must hold every submitted token in FIFO order.
        let pool = WorkerPool::start(0, test_ctx()).unwrap();
        let tokens: Vec<ConnToken> = (0..5)
            .map(|index| ConnToken {
                index,
                generation: 0,
            })
            .collect();
        for &token in &tokens {
            pool.submit(token);
        }

        let drained: Vec<ConnToken> = {
            let mut queue = pool.shared.queue.lock().unwrap();
            queue.drain(..).collect()
        };
        assert_eq!(drained, tokens);
        pool.shutdown();
    }

    #[test]
    fn stale_tokens_are_skipped() {
        let ctx = test_ctx();
        let pool = WorkerPool::start(2, ctx.clone()).unwrap();
        // Never-allocated generation: workers must treat these as stale and
        // do nothing rather than touch a free slot.
        for index in 0..4 {
            pool.submit(ConnToken {
                index,
                generation: 99,
            });
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        pool.shutdown();
        assert_eq!(ctx.table.active(), 0);
    }
}
