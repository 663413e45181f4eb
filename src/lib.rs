// src/lib.rs
pub mod conn;
pub mod context;
pub mod error;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod resolve;
pub mod response;
pub mod server;
pub mod syscalls;
pub mod table;

// Re-exports for users
pub use error::{ServerError, ServerResult};
pub use server::{Server, ServerHandle};
