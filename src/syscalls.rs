// src/syscalls.rs
//
// Thin wrappers over the raw libc surface the engine needs: a non-blocking
// listening socket, accept4, epoll in edge-triggered/oneshot mode, and
// non-blocking read/write/writev. Linux only.
use crate::error::ServerResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;

/// Create a non-blocking TCP listening socket bound to `addr`.
pub fn create_listen_socket(addr: &str) -> ServerResult<c_int> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // SO_REUSEADDR so restarts do not trip over TIME_WAIT sockets.
        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if let Err(e) = bind_addr(fd, &addr) {
            libc::close(fd);
            return Err(e);
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> ServerResult<()> {
    unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error().into());
                }
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error().into());
                }
            }
        }
        Ok(())
    }
}

fn storage_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

/// Local address the socket is bound to. Needed when binding to port 0.
pub fn local_addr(fd: c_int) -> ServerResult<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        storage_to_addr(&storage).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unsupported address family").into()
        })
    }
}

/// Accept one pending connection. `Ok(None)` means no connection is pending.
pub fn accept_connection(listen_fd: c_int) -> ServerResult<Option<(c_int, Option<SocketAddr>)>> {
    loop {
        unsafe {
            let mut storage: libc::sockaddr_storage = mem::zeroed();
            let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
            let fd = libc::accept4(
                listen_fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK,
            );

            if fd < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => return Ok(None),
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err.into()),
                }
            }
            return Ok(Some((fd, storage_to_addr(&storage))));
        }
    }
}

pub fn close(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Epoll ----

pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> ServerResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Add a file descriptor. Edge triggered (EPOLLET) always; callers pass
    /// EPOLLONESHOT in `interests` for exclusive one-event delivery.
    pub fn add(&self, fd: c_int, token: u64, interests: i32) -> ServerResult<()> {
        let mut event = libc::epoll_event {
            events: (interests | libc::EPOLLET) as u32,
            u64: token,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Re-enable delivery for an oneshot registration, possibly with new
    /// interests.
    pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> ServerResult<()> {
        let mut event = libc::epoll_event {
            events: (interests | libc::EPOLLET) as u32,
            u64: token,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Remove a file descriptor. Already-removed descriptors are tolerated.
    pub fn delete(&self, fd: c_int) -> ServerResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> ServerResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Non-blocking I/O ----

/// Read once. `Ok(None)` is would-block, `Ok(Some(0))` is peer EOF.
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> ServerResult<Option<usize>> {
    loop {
        unsafe {
            let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
            if res < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => return Ok(None),
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err.into()),
                }
            }
            return Ok(Some(res as usize));
        }
    }
}

/// Write once. `Ok(None)` is would-block.
pub fn write_nonblocking(fd: c_int, buf: &[u8]) -> ServerResult<Option<usize>> {
    loop {
        unsafe {
            let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
            if res < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => return Ok(None),
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err.into()),
                }
            }
            return Ok(Some(res as usize));
        }
    }
}

/// Vectored write: gather up to two disjoint regions in one syscall.
/// `Ok(None)` is would-block.
pub fn writev_nonblocking(fd: c_int, bufs: &[&[u8]]) -> ServerResult<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }

    let mut iovecs: [libc::iovec; 2] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(2);
    for i in 0..iov_count {
        iovecs[i] = libc::iovec {
            iov_base: bufs[i].as_ptr() as *mut c_void,
            iov_len: bufs[i].len(),
        };
    }

    loop {
        unsafe {
            let res = libc::writev(fd, iovecs.as_ptr(), iov_count as c_int);
            if res < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => return Ok(None),
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err.into()),
                }
            }
            return Ok(Some(res as usize));
        }
    }
}
