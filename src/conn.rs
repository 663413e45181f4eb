// src/conn.rs
use std::net::SocketAddr;

use crate::resolve::MappedFile;
use crate::syscalls;

pub const READ_BUF_SIZE: usize = 2048;
pub const WRITE_BUF_SIZE: usize = 1024;

/// Phase of the request state machine. `checked_idx` resumes exactly where
/// the previous read event left off, so a request may arrive in any number
/// of fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParsePhase {
    #[default]
    RequestLine,
    Header,
    Content,
}

/// Only GET is supported; every other method is classified as a bad request
/// before it reaches this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
}

/// Per-socket buffer state: one per live connection, owned by a table slot.
///
/// At most one thread mutates a `Conn` at a time. The EPOLLONESHOT re-arm
/// discipline guarantees no second event fires before the current pass
/// re-arms, and the slot mutex backs that up structurally.
pub struct Conn {
    pub fd: i32,
    pub peer: Option<SocketAddr>,

    pub read_buf: [u8; READ_BUF_SIZE],
    /// Bytes filled by the socket reads.
    pub read_idx: usize,
    /// Bytes already scanned by the line sub-machine.
    pub checked_idx: usize,
    /// Offset of the line currently being parsed.
    pub start_line: usize,

    pub phase: ParsePhase,
    pub method: Method,
    pub url: String,
    pub version: String,
    pub host: String,
    pub content_length: usize,
    pub keep_alive: bool,

    pub write_buf: [u8; WRITE_BUF_SIZE],
    /// Generated header/body bytes in `write_buf`.
    pub write_idx: usize,
    /// Bytes already on the wire, persisted across partial writes.
    pub bytes_sent: usize,

    /// Mapped response file, held from successful resolution until the last
    /// byte is sent. Dropping it unmaps the region.
    pub file: Option<MappedFile>,
}

impl Conn {
    pub fn new() -> Self {
        Self {
            fd: -1,
            peer: None,
            read_buf: [0; READ_BUF_SIZE],
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            phase: ParsePhase::RequestLine,
            method: Method::Get,
            url: String::new(),
            version: String::new(),
            host: String::new(),
            content_length: 0,
            keep_alive: false,
            write_buf: [0; WRITE_BUF_SIZE],
            write_idx: 0,
            bytes_sent: 0,
            file: None,
        }
    }

    /// Take ownership of a freshly accepted socket.
    pub fn init(&mut self, fd: i32, peer: Option<SocketAddr>) {
        self.fd = fd;
        self.peer = peer;
        self.reset_for_next_request();
    }

    /// Zero all parse and write state while keeping the socket. Used on
    /// accept and again between keep-alive requests. Buffer contents are not
    /// cleared; the cursors govern what is live.
    pub fn reset_for_next_request(&mut self) {
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.phase = ParsePhase::RequestLine;
        self.method = Method::Get;
        self.url.clear();
        self.version.clear();
        self.host.clear();
        self.content_length = 0;
        self.keep_alive = false;
        self.write_idx = 0;
        self.bytes_sent = 0;
        self.file = None;
    }

    /// Drain the non-blocking socket into the read buffer until it would
    /// block. Returns `false` if the buffer filled up before a request was
    /// assembled, the peer closed, or the read failed; `true` means at least
    /// the possibility of new bytes for the parser.
    pub fn fill_from_socket(&mut self) -> bool {
        loop {
            if self.read_idx >= READ_BUF_SIZE {
                tracing::debug!(fd = self.fd, "read buffer full before request completed");
                return false;
            }
            match syscalls::read_nonblocking(self.fd, &mut self.read_buf[self.read_idx..]) {
                Ok(None) => return true,
                Ok(Some(0)) => return false,
                Ok(Some(n)) => self.read_idx += n,
                Err(e) => {
                    tracing::debug!(fd = self.fd, error = %e, "read failed");
                    return false;
                }
            }
        }
    }

    /// Total response length: generated bytes plus the mapped file, if any.
    pub fn bytes_to_send(&self) -> usize {
        self.write_idx + self.file.as_ref().map_or(0, |f| f.len())
    }
}

impl Default for Conn {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_parse_and_write_state() {
        let mut conn = Conn::new();
        conn.init(7, None);
        conn.read_idx = 100;
        conn.checked_idx = 50;
        conn.phase = ParsePhase::Content;
        conn.url = "/index.html".to_string();
        conn.content_length = 12;
        conn.keep_alive = true;
        conn.write_idx = 30;
        conn.bytes_sent = 10;

        conn.reset_for_next_request();

        assert_eq!(conn.fd, 7);
        assert_eq!(conn.read_idx, 0);
        assert_eq!(conn.checked_idx, 0);
        assert_eq!(conn.phase, ParsePhase::RequestLine);
        assert!(conn.url.is_empty());
        assert_eq!(conn.content_length, 0);
        assert!(!conn.keep_alive);
        assert_eq!(conn.bytes_to_send(), 0);
    }
}
