//! Conversions between [`pomp_core::Addr`] and the raw `libc` sockaddr
//! structures needed to actually open a socket. Kept separate from
//! `pomp_core::addr` since that crate has no business depending on `libc`
//! for anything beyond the buffer's fd bookkeeping.

use std::os::fd::RawFd;

use pomp_core::{Addr, PompError, Result};

#[repr(C)]
pub(crate) union RawSockaddr {
    pub inet: libc::sockaddr_in,
    pub inet6: libc::sockaddr_in6,
    pub un: libc::sockaddr_un,
}

/// Builds the raw sockaddr for `addr`, handing it to `f` as a `(ptr, len)`
/// pair the way `bind`/`connect`/`sendto` expect it.
pub(crate) fn with_sockaddr<R>(addr: &Addr, f: impl FnOnce(*const libc::sockaddr, libc::socklen_t) -> R) -> Result<R> {
    let (raw, len) = build_sockaddr(addr)?;
    let ptr: *const libc::sockaddr = match addr {
        Addr::Inet(_) => std::ptr::addr_of!(raw.inet).cast(),
        Addr::Inet6(_) => std::ptr::addr_of!(raw.inet6).cast(),
        Addr::Unix(_) | Addr::UnixAbstract(_) => std::ptr::addr_of!(raw.un).cast(),
    };
    Ok(f(ptr, len))
}

pub(crate) fn socket_family(addr: &Addr) -> libc::c_int {
    match addr {
        Addr::Inet(_) => libc::AF_INET,
        Addr::Inet6(_) => libc::AF_INET6,
        Addr::Unix(_) | Addr::UnixAbstract(_) => libc::AF_UNIX,
    }
}

fn build_sockaddr(addr: &Addr) -> Result<(RawSockaddr, libc::socklen_t)> {
    match addr {
        Addr::Inet(v4) => {
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_be_bytes(v4.ip().octets());
            Ok((RawSockaddr { inet: sin }, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t))
        }
        Addr::Inet6(v6) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            Ok((RawSockaddr { inet6: sin6 }, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t))
        }
        Addr::Unix(path) => {
            if path.len() >= 108 {
                return Err(PompError::InvalidArgument("unix socket path too long"));
            }
            let mut sun: libc::sockaddr_un = unsafe { std::mem::zeroed() };
            sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
            for (dst, &b) in sun.sun_path.iter_mut().zip(path.as_bytes()) {
                *dst = b as libc::c_char;
            }
            let base = std::mem::size_of::<libc::sa_family_t>();
            let len = base + path.len() + 1;
            Ok((RawSockaddr { un: sun }, len as libc::socklen_t))
        }
        Addr::UnixAbstract(name) => {
            if name.len() >= 107 {
                return Err(PompError::InvalidArgument("unix abstract name too long"));
            }
            let mut sun: libc::sockaddr_un = unsafe { std::mem::zeroed() };
            sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
            // sun_path[0] stays NUL (abstract marker); name starts at index 1.
            for (dst, &b) in sun.sun_path[1..].iter_mut().zip(name.as_bytes()) {
                *dst = b as libc::c_char;
            }
            let base = std::mem::size_of::<libc::sa_family_t>();
            let len = base + 1 + name.len();
            Ok((RawSockaddr { un: sun }, len as libc::socklen_t))
        }
    }
}

/// Reads back the local address bound/connected on `fd`, for
/// `getsockname`-style queries. `is_unix` picks the decode path since the
/// family byte alone does not distinguish path vs. abstract Unix names.
pub(crate) fn getsockname(fd: RawFd) -> Result<Addr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { libc::getsockname(fd, (&mut storage as *mut libc::sockaddr_storage).cast(), &mut len) };
    if rc < 0 {
        return Err(PompError::Io(std::io::Error::last_os_error()));
    }
    decode_sockaddr(&storage, len)
}

pub(crate) fn decode_sockaddr(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Result<Addr> {
    match i32::from(storage.ss_family) {
        f if f == libc::AF_INET => {
            let sin: libc::sockaddr_in = unsafe { std::ptr::read(std::ptr::addr_of!(*storage).cast()) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Ok(Addr::Inet(std::net::SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        f if f == libc::AF_INET6 => {
            let sin6: libc::sockaddr_in6 = unsafe { std::ptr::read(std::ptr::addr_of!(*storage).cast()) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(Addr::Inet6(std::net::SocketAddrV6::new(ip, u16::from_be(sin6.sin6_port), 0, 0)))
        }
        f if f == libc::AF_UNIX => {
            let sun: libc::sockaddr_un = unsafe { std::ptr::read(std::ptr::addr_of!(*storage).cast()) };
            let base = std::mem::size_of::<libc::sa_family_t>() as libc::socklen_t;
            if len <= base {
                return Ok(Addr::Unix(String::new()));
            }
            let path_bytes: Vec<u8> = sun.sun_path.iter().map(|&c| c as u8).collect();
            if path_bytes[0] == 0 {
                let end = path_bytes[1..(len - base) as usize].iter().position(|&b| b == 0).map_or((len - base) as usize - 1, |p| p);
                let name = String::from_utf8_lossy(&path_bytes[1..1 + end]).into_owned();
                Ok(Addr::UnixAbstract(name))
            } else {
                let end = path_bytes.iter().position(|&b| b == 0).unwrap_or(path_bytes.len());
                Ok(Addr::Unix(String::from_utf8_lossy(&path_bytes[..end]).into_owned()))
            }
        }
        _ => Err(PompError::InvalidArgument("unsupported sockaddr family")),
    }
}

pub(crate) fn set_nonblocking_close_on_exec(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(PompError::Io(std::io::Error::last_os_error()));
        }
        let fdflags = libc::fcntl(fd, libc::F_GETFD, 0);
        if fdflags < 0 || libc::fcntl(fd, libc::F_SETFD, fdflags | libc::FD_CLOEXEC) < 0 {
            return Err(PompError::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Opens a non-blocking, close-on-exec socket of `sock_type` for `addr`'s
/// family. For inet sockets, also sets `SO_REUSEADDR` so a server can rebind
/// promptly after restart (matching the reference implementation's "allow
/// address reuse" step).
pub(crate) fn open_socket(addr: &Addr, sock_type: libc::c_int) -> Result<RawFd> {
    let fd = unsafe { libc::socket(socket_family(addr), sock_type, 0) };
    if fd < 0 {
        return Err(PompError::Io(std::io::Error::last_os_error()));
    }
    if let Err(e) = set_nonblocking_close_on_exec(fd) {
        unsafe {
            libc::close(fd);
        }
        return Err(e);
    }
    if matches!(addr, Addr::Inet(_) | Addr::Inet6(_)) {
        let one: i32 = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&one as *const i32).cast(),
                std::mem::size_of::<i32>() as libc::socklen_t,
            );
        }
    }
    Ok(fd)
}

/// Removes a stale Unix socket path before binding, the way the reference
/// server implementation unlinks a leftover path from a previous run.
/// No-op for abstract-namespace and inet addresses.
pub(crate) fn unlink_unix_path(addr: &Addr) {
    if let Addr::Unix(path) = addr {
        let c = std::ffi::CString::new(path.as_str()).expect("unix path must not contain NUL");
        unsafe {
            libc::unlink(c.as_ptr());
        }
    }
}

pub(crate) fn bind_addr(fd: RawFd, addr: &Addr) -> Result<()> {
    with_sockaddr(addr, |ptr, len| {
        if unsafe { libc::bind(fd, ptr, len) } < 0 {
            Err(PompError::Io(std::io::Error::last_os_error()))
        } else {
            Ok(())
        }
    })?
}

pub(crate) fn listen_fd(fd: RawFd, backlog: libc::c_int) -> Result<()> {
    if unsafe { libc::listen(fd, backlog) } < 0 {
        return Err(PompError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Sets the filesystem mode bits on a Unix socket path, matching the
/// reference implementation's optional post-bind `chmod`. No-op for
/// abstract-namespace and inet addresses.
pub(crate) fn set_file_mode(addr: &Addr, mode: u32) -> Result<()> {
    if let Addr::Unix(path) = addr {
        let c = std::ffi::CString::new(path.as_str()).expect("unix path must not contain NUL");
        if unsafe { libc::chmod(c.as_ptr(), mode) } < 0 {
            return Err(PompError::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Starts a non-blocking `connect`. `Ok(true)` means the connection
/// completed synchronously (rare, usually only for Unix sockets); `Ok(false)`
/// means it is in progress and the caller must wait for `OUT` readiness and
/// check [`so_error`].
pub(crate) fn connect_addr(fd: RawFd, addr: &Addr) -> Result<bool> {
    with_sockaddr(addr, |ptr, len| {
        if unsafe { libc::connect(fd, ptr, len) } < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EINPROGRESS)
            {
                Ok(false)
            } else {
                Err(PompError::Io(err))
            }
        } else {
            Ok(true)
        }
    })?
}

/// Reads back the deferred error from a non-blocking `connect` once the fd
/// reports `OUT` readiness. `Ok(())` means the connection succeeded.
pub(crate) fn take_socket_error(fd: RawFd) -> Result<()> {
    let mut err: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR, (&mut err as *mut i32).cast(), &mut len)
    };
    if rc < 0 {
        return Err(PompError::Io(std::io::Error::last_os_error()));
    }
    if err != 0 {
        return Err(PompError::Io(std::io::Error::from_raw_os_error(err)));
    }
    Ok(())
}

/// Accepts one pending connection from a listening socket, returning the new
/// fd and the peer's address.
pub(crate) fn accept_conn(listen_fd: RawFd) -> Result<(RawFd, Addr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let fd = unsafe {
        libc::accept(listen_fd, (&mut storage as *mut libc::sockaddr_storage).cast(), &mut len)
    };
    if fd < 0 {
        return Err(PompError::Io(std::io::Error::last_os_error()));
    }
    if let Err(e) = set_nonblocking_close_on_exec(fd) {
        unsafe {
            libc::close(fd);
        }
        return Err(e);
    }
    let peer = decode_sockaddr(&storage, len).unwrap_or(Addr::Unix(String::new()));
    Ok((fd, peer))
}

/// Receives one datagram, returning the payload length and the sender's
/// address.
pub(crate) fn recvfrom_addr(fd: RawFd, buf: &mut [u8]) -> Result<(usize, Addr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            0,
            (&mut storage as *mut libc::sockaddr_storage).cast(),
            &mut len,
        )
    };
    if n < 0 {
        return Err(PompError::Io(std::io::Error::last_os_error()));
    }
    let peer = decode_sockaddr(&storage, len).unwrap_or(Addr::Unix(String::new()));
    Ok((n as usize, peer))
}

/// Sends one datagram to `addr`.
pub(crate) fn sendto_addr(fd: RawFd, data: &[u8], addr: &Addr) -> Result<usize> {
    with_sockaddr(addr, |ptr, len| {
        let n = unsafe { libc::sendto(fd, data.as_ptr().cast(), data.len(), libc::MSG_NOSIGNAL, ptr, len) };
        if n < 0 {
            Err(PompError::Io(std::io::Error::last_os_error()))
        } else {
            Ok(n as usize)
        }
    })?
}
