//! Per-socket I/O state machine: non-blocking read/write, a backpressure
//! write queue, and `SCM_RIGHTS` file descriptor passing over Unix domain
//! sockets. Grounded on `pomp_conn.c`.
//!
//! A [`Connection`] does not touch the event loop itself; [`crate::context`]
//! owns the fd registration and calls [`Connection::readable`] /
//! [`Connection::writable`] from its own dispatch callbacks. This keeps the
//! loop borrow entirely on the context side instead of threading `&mut Loop`
//! through the connection layer.

use std::{
    collections::VecDeque,
    os::fd::RawFd,
};

use pomp_core::{buffer::MAX_FD_COUNT, Message, PompError, Result};

/// Bytes read from the socket per [`Connection::readable`] call, matching
/// `POMP_CONN_READ_SIZE` in the reference implementation.
pub const DEFAULT_READ_SIZE: usize = 4096;

/// Credentials of the peer on the other end of a Unix domain socket,
/// fetched once via `SO_PEERCRED`.
#[derive(Debug, Clone, Copy)]
pub struct PeerCred {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// TCP keepalive tuning, applied to inet connections only.
#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    pub enable: bool,
    pub idle: i32,
    pub interval: i32,
    pub count: i32,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self { enable: true, idle: 5, interval: 1, count: 2 }
    }
}

/// What a queued send actually carries: a framed [`Message`] (whose buffer
/// starts with the 12-byte header) or a raw buffer sent verbatim in raw
/// mode. Both are sent the same way; only how they were constructed
/// differs.
enum Payload {
    Msg(Message),
    Raw(pomp_core::Buffer),
}

impl Payload {
    fn buffer(&self) -> &pomp_core::Buffer {
        match self {
            Self::Msg(m) => m.buffer(),
            Self::Raw(b) => b,
        }
    }
}

struct PendingSend {
    payload: Payload,
    offset: usize,
    cookie: u64,
}

/// Outcome of [`Connection::queue_send`].
pub enum QueueOutcome {
    /// Sent in full without blocking; the given cookie can be reported as a
    /// completed send right away.
    Completed { cookie: u64, queue_empty: bool },
    /// Left on the write queue. `became_async` is true if the caller must
    /// now subscribe this connection's fd for `OUT` readiness.
    Queued { became_async: bool },
}

/// What a [`Connection::readable`] call produced.
pub enum ReadOutcome {
    /// Zero or more complete frames extracted from this read (framed mode).
    Messages(Vec<Message>),
    /// Zero or more opaque chunks read straight off the socket, bypassing
    /// the framer entirely (raw mode).
    Raw(Vec<Vec<u8>>),
    /// Peer closed its write side (`read` returned 0).
    Eof,
    /// Nothing to read right now (`EAGAIN`/`EWOULDBLOCK`).
    WouldBlock,
}

/// One end of a connected (stream) or fake-connected (dgram) socket.
pub struct Connection {
    fd: RawFd,
    is_unix: bool,
    dgram: bool,
    /// Absent in raw mode: payloads are handed to the caller as opaque
    /// byte chunks instead of being run through the framer. Grounded on
    /// `pomp_conn`'s `prot` field, which `pomp_conn_new` leaves `NULL` when
    /// `is_raw` is set.
    framer: Option<pomp_core::protocol::Framer>,
    readbuf_len: usize,
    send_queue: VecDeque<PendingSend>,
    /// True once the socket has been subscribed for `OUT` readiness because
    /// a write would have blocked. Matches `pomp_conn`'s `iswatchwrite`.
    async_mode: bool,
    next_cookie: u64,
    peer_cred: Option<PeerCred>,
    eof: bool,
    /// Set by [`Connection::disconnect`]. Once true, `shutdown(SHUT_RDWR)`
    /// has already been called on the socket and further sends are rejected
    /// with [`PompError::NotConnected`] rather than attempted.
    shutdown: bool,
}

impl Connection {
    pub fn new(fd: RawFd, is_unix: bool, dgram: bool, readbuf_len: usize) -> Self {
        Self::new_with_mode(fd, is_unix, dgram, readbuf_len, false)
    }

    pub fn new_with_mode(fd: RawFd, is_unix: bool, dgram: bool, readbuf_len: usize, raw: bool) -> Self {
        Self {
            fd,
            is_unix,
            dgram,
            framer: if raw { None } else { Some(pomp_core::protocol::Framer::new()) },
            readbuf_len,
            send_queue: VecDeque::new(),
            async_mode: false,
            next_cookie: 1,
            peer_cred: None,
            eof: false,
            shutdown: false,
        }
    }

    #[inline]
    pub fn is_raw(&self) -> bool {
        self.framer.is_none()
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_async(&self) -> bool {
        self.async_mode
    }

    #[inline]
    pub fn has_pending_writes(&self) -> bool {
        !self.send_queue.is_empty()
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Shuts the socket down for both reading and writing. Grounded on
    /// `pomp_conn_close`: subsequent sends fail with
    /// [`PompError::NotConnected`] instead of attempting I/O; the fd itself
    /// is only actually closed (and the connection removed from its owning
    /// context) on the next loop iteration, so the caller can still observe
    /// readiness callbacks already in flight for it this tick.
    pub fn disconnect(&mut self) -> Result<()> {
        if self.shutdown {
            return Ok(());
        }
        self.shutdown = true;
        if unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) } < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOTCONN) {
                return Err(PompError::Io(err));
            }
        }
        Ok(())
    }

    #[inline]
    pub fn peer_cred(&self) -> Option<PeerCred> {
        self.peer_cred
    }

    /// Reads `SO_PEERCRED` for a Unix domain socket. No-op (and never
    /// fails) on a non-Unix connection.
    pub fn fetch_peer_cred(&mut self) -> Result<()> {
        if !self.is_unix {
            return Ok(());
        }
        let mut cred = libc::ucred { pid: 0, uid: 0, gid: 0 };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast(),
                &mut len,
            )
        };
        if rc < 0 {
            return Err(PompError::Io(std::io::Error::last_os_error()));
        }
        self.peer_cred = Some(PeerCred { pid: cred.pid, uid: cred.uid, gid: cred.gid });
        Ok(())
    }

    /// Applies TCP keepalive settings. No-op on a Unix domain socket, which
    /// has no `TCP_KEEPIDLE`/`TCP_KEEPINTVL`/`TCP_KEEPCNT` concept.
    pub fn setup_keepalive(&self, ka: Keepalive) -> Result<()> {
        if self.is_unix || self.dgram {
            return Ok(());
        }
        setsockopt_i32(self.fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, i32::from(ka.enable))?;
        if ka.enable {
            setsockopt_i32(self.fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, ka.idle)?;
            setsockopt_i32(self.fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, ka.interval)?;
            setsockopt_i32(self.fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, ka.count)?;
        }
        Ok(())
    }

    /// Drains as much as is currently available on the socket, feeding it
    /// through the framer. Returns every complete frame extracted, in
    /// order; stops at the first `EAGAIN`, EOF, or error.
    pub fn readable(&mut self) -> Result<ReadOutcome> {
        if self.framer.is_none() {
            return self.readable_raw();
        }
        let mut messages = Vec::new();
        let mut buf = vec![0u8; self.readbuf_len.max(1)];
        loop {
            let (n, fds) = match self.recv(&mut buf) {
                Ok(v) => v,
                Err(e) if is_would_block(&e) => {
                    return Ok(if messages.is_empty() { ReadOutcome::WouldBlock } else { ReadOutcome::Messages(messages) });
                }
                Err(e) => return Err(e),
            };
            if n == 0 {
                self.eof = true;
                return Ok(if messages.is_empty() { ReadOutcome::Eof } else { ReadOutcome::Messages(messages) });
            }

            let mut data = &buf[..n];
            let mut incoming_fds = VecDeque::from(fds);
            while !data.is_empty() {
                let framer = self.framer.as_mut().expect("raw connections return early above");
                let (consumed, msg) = framer.feed(data)?;
                data = &data[consumed..];
                if let Some(mut msg) = msg {
                    fixup_received_fds(&mut msg, &mut incoming_fds)?;
                    messages.push(msg);
                }
            }
            if n < buf.len() {
                // Short read: socket is drained for now.
                return Ok(ReadOutcome::Messages(messages));
            }
        }
    }

    /// Raw-mode read path: every chunk read off the socket is delivered to
    /// the caller verbatim, with no framing applied. A datagram read yields
    /// exactly one chunk per call (the whole datagram); a stream read yields
    /// one chunk per successful `read`/`recvmsg`, looping until `EAGAIN`.
    fn readable_raw(&mut self) -> Result<ReadOutcome> {
        let mut chunks = Vec::new();
        let mut buf = vec![0u8; self.readbuf_len.max(1)];
        loop {
            let (n, _fds) = match self.recv(&mut buf) {
                Ok(v) => v,
                Err(e) if is_would_block(&e) => {
                    return Ok(if chunks.is_empty() { ReadOutcome::WouldBlock } else { ReadOutcome::Raw(chunks) });
                }
                Err(e) => return Err(e),
            };
            if n == 0 {
                self.eof = true;
                return Ok(if chunks.is_empty() { ReadOutcome::Eof } else { ReadOutcome::Raw(chunks) });
            }
            chunks.push(buf[..n].to_vec());
            if self.dgram || n < buf.len() {
                return Ok(ReadOutcome::Raw(chunks));
            }
        }
    }

    /// Queues `msg` for sending. If the queue was empty, attempts an
    /// immediate non-blocking send before enqueuing anything durably: most
    /// sends to an unblocked peer complete synchronously and should report
    /// their completion right away rather than waiting for a spurious `OUT`
    /// readiness callback that may never come.
    pub fn queue_send(&mut self, msg: Message) -> Result<QueueOutcome> {
        self.queue_payload(Payload::Msg(msg))
    }

    /// Queues a raw, unframed buffer for sending verbatim. Used by contexts
    /// configured to skip the framer; see [`Connection::is_raw`]. Grounded on
    /// `pomp_ctx_send_raw_buf`, which hands `buf` straight to `pomp_conn_send`
    /// without going through `pomp_prot_encode_msg`.
    pub fn queue_send_raw(&mut self, buf: pomp_core::Buffer) -> Result<QueueOutcome> {
        self.queue_payload(Payload::Raw(buf))
    }

    fn queue_payload(&mut self, payload: Payload) -> Result<QueueOutcome> {
        if self.shutdown {
            return Err(PompError::NotConnected);
        }
        let cookie = self.next_cookie;
        self.next_cookie += 1;
        let was_empty = self.send_queue.is_empty();
        self.send_queue.push_back(PendingSend { payload, offset: 0, cookie });
        if was_empty {
            match self.try_flush_head() {
                Ok(true) => {
                    self.send_queue.pop_front();
                    self.async_mode = false;
                    return Ok(QueueOutcome::Completed { cookie, queue_empty: true });
                }
                Ok(false) => {}
                Err(e) if is_would_block(&e) => {}
                Err(e) => return Err(e),
            }
        }
        let became_async = !self.async_mode;
        self.async_mode = true;
        Ok(QueueOutcome::Queued { became_async })
    }

    /// Writes as much of the queue as the socket will currently accept.
    /// Returns the cookies of every send that fully completed during this
    /// call (for idle-queue completion notification), and whether the
    /// caller should now unsubscribe from `OUT` readiness (queue drained).
    pub fn writable(&mut self) -> Result<(Vec<u64>, bool)> {
        let mut done = Vec::new();
        loop {
            let Some(head) = self.send_queue.front() else { break };
            let cookie = head.cookie;
            match self.try_flush_head() {
                Ok(true) => {
                    self.send_queue.pop_front();
                    done.push(cookie);
                }
                Ok(false) => break,
                Err(e) if is_would_block(&e) => break,
                Err(e) => return Err(e),
            }
        }
        let drained = self.send_queue.is_empty();
        if drained {
            self.async_mode = false;
        }
        Ok((done, drained))
    }

    /// Attempts to finish sending the head of the queue. Returns `Ok(true)`
    /// if it fully completed, `Ok(false)` if a short/would-block write left
    /// bytes (or fds) still to send.
    fn try_flush_head(&mut self) -> Result<bool> {
        let Some(head) = self.send_queue.front_mut() else { return Ok(true) };
        let total = head.payload.buffer().len();
        loop {
            if head.offset >= total {
                return Ok(true);
            }
            let fds = if head.offset == 0 {
                match &head.payload {
                    Payload::Msg(m) => collect_fds(m)?,
                    Payload::Raw(_) => Vec::new(),
                }
            } else {
                Vec::new()
            };
            let n = send_chunk(self.fd, head.payload.buffer(), head.offset, total, &fds)?;
            if n == 0 {
                return Ok(false);
            }
            head.offset += n;
        }
    }

    fn recv(&self, buf: &mut [u8]) -> Result<(usize, Vec<RawFd>)> {
        if self.is_unix {
            recvmsg_fds(self.fd, buf)
        } else {
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
                return Err(PompError::Io(std::io::Error::last_os_error()));
            }
            Ok((n as usize, Vec::new()))
        }
    }

    /// Drains the write queue without attempting any further I/O, returning
    /// the cookie of every send left pending. Used when tearing a connection
    /// down so each abandoned send can still be reported to the caller.
    pub fn abort_pending_sends(&mut self) -> Vec<u64> {
        self.async_mode = false;
        self.send_queue.drain(..).map(|p| p.cookie).collect()
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
        self.fd = -1;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_would_block(e: &PompError) -> bool {
    matches!(e, PompError::Io(io) if io.kind() == std::io::ErrorKind::WouldBlock)
}

fn setsockopt_i32(fd: RawFd, level: libc::c_int, name: libc::c_int, value: i32) -> Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&value as *const i32).cast(),
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(PompError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Pulls the real fd for every `FD` argument slot out of `msg`'s buffer, in
/// wire order, to pass alongside the first chunk of this frame.
fn collect_fds(msg: &Message) -> Result<Vec<RawFd>> {
    let dec = pomp_core::codec::Decoder::new(msg);
    let offsets = dec.fd_offsets()?;
    let mut out = Vec::with_capacity(offsets.len());
    for off in offsets {
        let mut pos = off;
        out.push(msg.buffer().read_fd(&mut pos)?);
    }
    Ok(out)
}

/// Matches the fds received via `SCM_RIGHTS` on the first `recvmsg` of a
/// frame (delivered in wire order) to the `FD` argument slots discovered by
/// a pre-fixup decode walk, registering each into the message's buffer.
/// Extra or missing fds (count mismatch) are logged and delivered anyway,
/// per this crate's advisory treatment of the condition.
fn fixup_received_fds(msg: &mut Message, incoming: &mut VecDeque<RawFd>) -> Result<()> {
    let offsets = {
        let dec = pomp_core::codec::Decoder::new(msg);
        dec.fd_offsets()?
    };
    if offsets.is_empty() {
        return Ok(());
    }
    if offsets.len() != incoming.len() {
        tracing::error!(
            expected = offsets.len(),
            received = incoming.len(),
            "fd count mismatch decoding message with FD arguments"
        );
    }
    for off in offsets {
        let Some(fd) = incoming.pop_front() else { break };
        msg.buffer().register_fd(off, fd)?;
    }
    Ok(())
}

fn send_chunk(fd: RawFd, buf: &pomp_core::Buffer, offset: usize, total: usize, fds: &[RawFd]) -> Result<usize> {
    buf.with_slice(&mut offset.clone(), total - offset, |slice| {
        if fds.is_empty() {
            let n = unsafe { libc::write(fd, slice.as_ptr().cast(), slice.len()) };
            if n < 0 {
                return Err(PompError::Io(std::io::Error::last_os_error()));
            }
            Ok(n as usize)
        } else {
            sendmsg_fds(fd, slice, fds)
        }
    })?
}

/// Maximum `cmsghdr` control buffer big enough for [`MAX_FD_COUNT`] fds.
fn cmsg_space() -> usize {
    unsafe { libc::CMSG_SPACE((MAX_FD_COUNT * std::mem::size_of::<RawFd>()) as u32) as usize }
}

fn sendmsg_fds(fd: RawFd, data: &[u8], fds: &[RawFd]) -> Result<usize> {
    let mut iov = libc::iovec { iov_base: data.as_ptr() as *mut _, iov_len: data.len() };
    let mut cbuf = vec![0u8; cmsg_space()];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !fds.is_empty() {
        let len = unsafe { libc::CMSG_LEN((fds.len() * std::mem::size_of::<RawFd>()) as u32) } as usize;
        msg.msg_control = cbuf.as_mut_ptr().cast();
        msg.msg_controllen = cmsg_space() as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = len as _;
            std::ptr::copy_nonoverlapping(fds.as_ptr(), libc::CMSG_DATA(cmsg).cast(), fds.len());
        }
        msg.msg_controllen = unsafe { libc::CMSG_SPACE((fds.len() * std::mem::size_of::<RawFd>()) as u32) } as _;
    }

    let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(PompError::Io(std::io::Error::last_os_error()));
    }
    Ok(n as usize)
}

fn recvmsg_fds(fd: RawFd, buf: &mut [u8]) -> Result<(usize, Vec<RawFd>)> {
    let mut iov = libc::iovec { iov_base: buf.as_mut_ptr().cast(), iov_len: buf.len() };
    let mut cbuf = vec![0u8; cmsg_space()];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cbuf.as_mut_ptr().cast();
    msg.msg_controllen = cbuf.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(PompError::Io(std::io::Error::last_os_error()));
    }

    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize) / std::mem::size_of::<RawFd>();
                for i in 0..count {
                    let mut raw = [0u8; std::mem::size_of::<RawFd>()];
                    std::ptr::copy_nonoverlapping(data.add(i * std::mem::size_of::<RawFd>()), raw.as_mut_ptr(), raw.len());
                    fds.push(RawFd::from_ne_bytes(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    if (msg.msg_flags & libc::MSG_CTRUNC) != 0 {
        tracing::error!("SCM_RIGHTS control message truncated, dropping fds past MAX_FD_COUNT");
    }
    Ok((n as usize, fds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pomp_core::codec::Encoder;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn roundtrips_a_plain_message_over_a_socketpair() {
        let (a, b) = socketpair();
        let mut ca = Connection::new(a, true, false, DEFAULT_READ_SIZE);
        let mut cb = Connection::new(b, true, false, DEFAULT_READ_SIZE);

        let mut enc = Encoder::new(7);
        enc.write_u32(99).unwrap();
        let msg = enc.finish().unwrap();
        ca.queue_send(msg).unwrap();

        let (_done, drained) = ca.writable().unwrap();
        assert!(drained);

        match cb.readable().unwrap() {
            ReadOutcome::Messages(msgs) => {
                assert_eq!(msgs.len(), 1);
                assert_eq!(msgs[0].id(), 7);
            }
            _ => panic!("expected a message"),
        }
    }

    #[test]
    fn passes_a_file_descriptor_with_the_message() {
        let (a, b) = socketpair();
        let mut ca = Connection::new(a, true, false, DEFAULT_READ_SIZE);
        let mut cb = Connection::new(b, true, false, DEFAULT_READ_SIZE);

        let tmp = tempfile::tempfile().unwrap();
        use std::os::fd::AsRawFd;
        let mut enc = Encoder::new(1);
        enc.write_fd(tmp.as_raw_fd()).unwrap();
        let msg = enc.finish().unwrap();
        ca.queue_send(msg).unwrap();
        ca.writable().unwrap();

        match cb.readable().unwrap() {
            ReadOutcome::Messages(msgs) => {
                let mut dec = pomp_core::codec::Decoder::new(&msgs[0]);
                let fd = dec.read_fd().unwrap();
                assert!(fd >= 0);
                unsafe {
                    libc::close(fd);
                }
            }
            _ => panic!("expected a message"),
        }
    }
}
