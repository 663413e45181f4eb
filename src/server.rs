// src/server.rs
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::info;

use crate::context::ServerContext;
use crate::error::{ServerError, ServerResult};
use crate::pool::WorkerPool;
use crate::reactor::Reactor;
use crate::syscalls;
use crate::table::ConnTable;

pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

pub struct Server {
    listen_addr: String,
    workers: usize,
    doc_root: PathBuf,
    max_connections: usize,
}

impl Server {
    pub fn bind(addr: &str) -> Self {
        Self {
            listen_addr: addr.to_string(),
            workers: num_cpus::get(),
            doc_root: PathBuf::from("."),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn doc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.doc_root = root.into();
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Bind, spawn the worker pool and the reactor thread, and hand back a
    /// handle. All failures here are fatal; nothing is retried.
    pub fn start(self) -> ServerResult<ServerHandle> {
        let listen_fd = syscalls::create_listen_socket(&self.listen_addr)?;
        let local_addr = match syscalls::local_addr(listen_fd) {
            Ok(addr) => addr,
            Err(e) => {
                syscalls::close(listen_fd);
                return Err(e);
            }
        };

        let ctx = match ServerContext::new(
            ConnTable::new(self.max_connections),
            self.doc_root.clone(),
        ) {
            Ok(ctx) => Arc::new(ctx),
            Err(e) => {
                syscalls::close(listen_fd);
                return Err(e);
            }
        };

        let pool = match WorkerPool::start(self.workers, ctx.clone()) {
            Ok(pool) => pool,
            Err(e) => {
                syscalls::close(listen_fd);
                return Err(e);
            }
        };

        let reactor = match Reactor::new(ctx.clone(), pool, listen_fd) {
            Ok(reactor) => reactor,
            Err(e) => {
                syscalls::close(listen_fd);
                return Err(e);
            }
        };

        let thread = thread::Builder::new()
            .name("mazurka-reactor".to_string())
            .spawn(move || reactor.run())
            .map_err(|e| ServerError::Startup(format!("failed to spawn reactor: {e}")))?;

        info!(
            addr = %local_addr,
            workers = self.workers,
            doc_root = %self.doc_root.display(),
            max_connections = self.max_connections,
            "server started"
        );

        Ok(ServerHandle {
            ctx,
            local_addr,
            thread: Some(thread),
        })
    }

    /// Run until Ctrl-C.
    pub fn serve(self) -> ServerResult<()> {
        let handle = self.start()?;
        let ctx = handle.ctx.clone();
        ctrlc::set_handler(move || {
            info!("received shutdown signal");
            ctx.request_shutdown();
        })
        .map_err(|e| ServerError::Startup(format!("failed to install signal handler: {e}")))?;
        handle.join()
    }
}

/// Running server: the reactor thread plus its shared context.
pub struct ServerHandle {
    ctx: Arc<ServerContext>,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Actual bound address; useful after binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask the reactor to stop. It notices within its wait timeout.
    pub fn shutdown(&self) {
        self.ctx.request_shutdown();
    }

    pub fn join(mut self) -> ServerResult<()> {
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| ServerError::Startup("reactor thread panicked".to_string()))?;
        }
        Ok(())
    }

    pub fn stop(self) -> ServerResult<()> {
        self.shutdown();
        self.join()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.ctx.request_shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
