//! Lifecycle of a server, client, or datagram endpoint: socket creation,
//! accept loop, reconnect-with-backoff, broadcast/single send, and the
//! single unified event callback surface that the application sees.
//! Grounded on `pomp_ctx.c`, with the server/client variant shape and
//! reconnect bookkeeping adapted from `flux-network::tcp::connector`'s
//! `ConnectionVariant`/`to_be_reconnected` pattern.
//!
//! A [`Context`] owns its [`Loop`] outright rather than sharing it: the fd
//! and timer callbacks registered with the loop only ever get `&mut Loop`
//! back (the loop has no notion of a context), so instead of threading a
//! `Context` reference through them, they record readiness into a small
//! side channel (`pending_fd`, `retry_flag`) that [`Context::wait_and_process`]
//! drains immediately after the loop call returns. This keeps `Loop` generic
//! and avoids the double-borrow that registering a closure capturing the
//! context's own state would otherwise require. The side channel is an
//! `Arc<Mutex<_>>` rather than a plain `Rc<RefCell<_>>` only because
//! `Loop::add_fd`/`Timer::new` require their callbacks to be `Send`, even
//! though in practice a single `Context` only ever drives its loop from one
//! thread.

use std::{
    collections::{HashMap, VecDeque},
    os::fd::RawFd,
    sync::{Arc, Mutex},
    time::Duration,
};

use pomp_core::{
    addr::Addr,
    codec::{Encoder, Value},
    error::{PompError, Result},
    message::Message,
};
use pomp_loop::{
    event_loop::{FdInterest, Loop, Revents},
    Timer,
};

use crate::{
    addr_sys,
    connection::{Connection, Keepalive, QueueOutcome, ReadOutcome, DEFAULT_READ_SIZE},
};

/// Default cap on simultaneously accepted server connections, matching
/// `POMP_CTX_MAX_CONN` in the reference implementation.
pub const MAX_CONN: usize = 32;

const SERVER_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const CLIENT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

bitflags::bitflags! {
    /// Status bits delivered to a registered send-completion callback.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SendStatus: u8 {
        const OK          = 0x01;
        const ABORTED     = 0x02;
        const QUEUE_EMPTY = 0x04;
    }
}

/// Event surfaced to the application's event callback for a given
/// connection (identified by its raw fd).
pub enum CtxEvent<'a> {
    Connected,
    Disconnected,
    Msg(&'a Message),
}

pub type EventCb = Box<dyn FnMut(&mut Context, RawFd, CtxEvent<'_>)>;
pub type RawCb = Box<dyn FnMut(&mut Context, RawFd, &[u8])>;
pub type SendCb = Box<dyn FnMut(&mut Context, RawFd, u64, SendStatus)>;
pub type SocketCb = Box<dyn Fn(RawFd)>;

/// Tuning shared by every connection a context manages.
#[derive(Clone, Copy)]
pub struct ContextConfig {
    pub max_conn: usize,
    pub keepalive: Keepalive,
    pub read_buf_len: usize,
    /// Filesystem mode applied to a Unix server socket's path after bind.
    /// Ignored for inet addresses and abstract-namespace Unix sockets.
    pub unix_file_mode: Option<u32>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_conn: MAX_CONN,
            keepalive: Keepalive::default(),
            read_buf_len: DEFAULT_READ_SIZE,
            unix_file_mode: None,
        }
    }
}

struct ConnSlot {
    conn: Connection,
    peer_addr: Addr,
}

enum Kind {
    Server {
        listen_fd: Option<RawFd>,
        conns: HashMap<RawFd, ConnSlot>,
        retry_timer: Timer,
        retry_flag: Arc<Mutex<bool>>,
    },
    Client {
        connect_fd: Option<RawFd>,
        conn: Option<ConnSlot>,
        retry_timer: Timer,
        retry_flag: Arc<Mutex<bool>>,
    },
    Dgram {
        fd: Option<RawFd>,
    },
}

/// A server, client, or datagram endpoint. See the module docs for why the
/// loop-facing callbacks only forward readiness through a side channel
/// instead of capturing `self`.
pub struct Context {
    loop_: Loop,
    addr: Addr,
    kind: Kind,
    cfg: ContextConfig,
    raw: bool,
    event_cb: EventCb,
    raw_cb: Option<RawCb>,
    socket_cb: Option<SocketCb>,
    send_cb: Option<SendCb>,
    notifying_depth: u32,
    stopping: bool,
    started: bool,
    pending_fd: Arc<Mutex<VecDeque<(RawFd, Revents)>>>,
    next_msgid_scratch: u32,
}

impl Context {
    fn new(mut loop_: Loop, addr: Addr, cfg: ContextConfig, event_cb: EventCb, make_kind: impl FnOnce(&mut Loop, Arc<Mutex<bool>>) -> Kind) -> Self {
        let retry_flag = Arc::new(Mutex::new(false));
        let kind = make_kind(&mut loop_, retry_flag);
        Self {
            loop_,
            addr,
            kind,
            cfg,
            raw: false,
            event_cb,
            raw_cb: None,
            socket_cb: None,
            send_cb: None,
            notifying_depth: 0,
            stopping: false,
            started: false,
            pending_fd: Arc::new(Mutex::new(VecDeque::new())),
            next_msgid_scratch: 0,
        }
    }

    /// Creates a server context bound to (but not yet listening on) `addr`.
    pub fn server(loop_: Loop, addr: Addr, cfg: ContextConfig, event_cb: EventCb) -> Self {
        Self::new(loop_, addr, cfg, event_cb, |l, retry_flag| {
            let rf = retry_flag.clone();
            let retry_timer = Timer::new(l, move |_l, _t| {
                *rf.lock().unwrap() = true;
            });
            Kind::Server { listen_fd: None, conns: HashMap::new(), retry_timer, retry_flag }
        })
    }

    /// Creates a client context that will connect to `addr`.
    pub fn client(loop_: Loop, addr: Addr, cfg: ContextConfig, event_cb: EventCb) -> Self {
        Self::new(loop_, addr, cfg, event_cb, |l, retry_flag| {
            let rf = retry_flag.clone();
            let retry_timer = Timer::new(l, move |_l, _t| {
                *rf.lock().unwrap() = true;
            });
            Kind::Client { connect_fd: None, conn: None, retry_timer, retry_flag }
        })
    }

    /// Creates a datagram context that will bind `addr`.
    pub fn dgram(loop_: Loop, addr: Addr, cfg: ContextConfig, event_cb: EventCb) -> Self {
        Self::new(loop_, addr, cfg, event_cb, |_l, _retry_flag| Kind::Dgram { fd: None })
    }

    fn assert_not_started(&self) -> Result<()> {
        if self.started {
            Err(PompError::Busy("context already listening/connected/bound"))
        } else {
            Ok(())
        }
    }

    /// Switches this context to raw mode: payloads are delivered to `cb` as
    /// opaque byte slices instead of being run through the framer. Must be
    /// called before `listen`/`connect`/`bind`.
    pub fn set_raw(&mut self, cb: RawCb) -> Result<()> {
        self.assert_not_started()?;
        self.raw = true;
        self.raw_cb = Some(cb);
        Ok(())
    }

    /// Registers a hook invoked with every freshly-created socket fd, before
    /// bind/connect, so the caller can tune options this crate doesn't
    /// already expose. Must be called before `listen`/`connect`/`bind`.
    pub fn set_socket_cb(&mut self, cb: SocketCb) -> Result<()> {
        self.assert_not_started()?;
        self.socket_cb = Some(cb);
        Ok(())
    }

    /// Registers a send-completion callback. Must be called before
    /// `listen`/`connect`/`bind`.
    pub fn set_send_cb(&mut self, cb: SendCb) -> Result<()> {
        self.assert_not_started()?;
        self.send_cb = Some(cb);
        Ok(())
    }

    /// Changes the server connection cap. `n` must be positive.
    pub fn set_max_conn(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(PompError::InvalidArgument("max_conn must be positive"));
        }
        self.cfg.max_conn = n;
        Ok(())
    }

    fn call_socket_cb(&self, fd: RawFd) {
        if let Some(cb) = &self.socket_cb {
            cb(fd);
        }
    }

    // ---- starting -----------------------------------------------------

    /// Creates the listening socket and starts accepting connections.
    /// Fails if this is not a server context or is already started.
    pub fn listen(&mut self) -> Result<()> {
        if !matches!(self.kind, Kind::Server { .. }) {
            return Err(PompError::InvalidArgument("listen() requires a server context"));
        }
        self.assert_not_started()?;
        self.started = true;
        self.try_listen()
    }

    fn try_listen(&mut self) -> Result<()> {
        addr_sys::unlink_unix_path(&self.addr);
        let fd = match addr_sys::open_socket(&self.addr, libc::SOCK_STREAM) {
            Ok(fd) => fd,
            Err(e) => return self.schedule_server_retry(e),
        };
        self.call_socket_cb(fd);
        if let Err(e) = addr_sys::bind_addr(fd, &self.addr) {
            unsafe {
                libc::close(fd);
            }
            return self.schedule_server_retry(e);
        }
        if let Some(mode) = self.cfg.unix_file_mode {
            if let Err(e) = addr_sys::set_file_mode(&self.addr, mode) {
                tracing::warn!(error = %e, "failed to chmod unix socket path");
            }
        }
        if let Err(e) = addr_sys::listen_fd(fd, libc::SOMAXCONN) {
            unsafe {
                libc::close(fd);
            }
            return self.schedule_server_retry(e);
        }
        let pending = self.pending_fd.clone();
        self.loop_.add_fd(fd, FdInterest::IN, move |_l, fd, rev| {
            pending.lock().unwrap().push_back((fd, rev));
        })?;
        let Kind::Server { listen_fd, .. } = &mut self.kind else { unreachable!() };
        *listen_fd = Some(fd);
        Ok(())
    }

    fn schedule_server_retry(&mut self, err: PompError) -> Result<()> {
        let retryable = matches!(&err, PompError::Io(io) if io.raw_os_error() == Some(libc::EADDRNOTAVAIL));
        let Kind::Server { retry_timer, .. } = &mut self.kind else { unreachable!() };
        if retryable {
            tracing::warn!(error = %err, "server bind failed, retrying");
            retry_timer.set(&mut self.loop_, SERVER_RECONNECT_DELAY, None)?;
            Ok(())
        } else {
            Err(err)
        }
    }

    /// Starts a non-blocking connect. Fails if this is not a client context
    /// or is already started.
    pub fn connect(&mut self) -> Result<()> {
        if !matches!(self.kind, Kind::Client { .. }) {
            return Err(PompError::InvalidArgument("connect() requires a client context"));
        }
        self.assert_not_started()?;
        self.started = true;
        self.try_connect()
    }

    fn try_connect(&mut self) -> Result<()> {
        let sock_type = libc::SOCK_STREAM;
        let fd = match addr_sys::open_socket(&self.addr, sock_type) {
            Ok(fd) => fd,
            Err(e) => return self.schedule_client_retry(e),
        };
        self.call_socket_cb(fd);
        match addr_sys::connect_addr(fd, &self.addr) {
            Ok(true) => {
                self.finish_client_connect(fd)?;
            }
            Ok(false) => {
                let pending = self.pending_fd.clone();
                self.loop_.add_fd(fd, FdInterest::OUT, move |_l, fd, rev| {
                    pending.lock().unwrap().push_back((fd, rev));
                })?;
                let Kind::Client { connect_fd, .. } = &mut self.kind else { unreachable!() };
                *connect_fd = Some(fd);
            }
            Err(e) => {
                unsafe {
                    libc::close(fd);
                }
                return self.schedule_client_retry(e);
            }
        }
        Ok(())
    }

    fn schedule_client_retry(&mut self, err: PompError) -> Result<()> {
        tracing::warn!(error = %err, "client connect failed, retrying");
        let Kind::Client { retry_timer, .. } = &mut self.kind else { unreachable!() };
        retry_timer.set(&mut self.loop_, CLIENT_RECONNECT_DELAY, None)?;
        Ok(())
    }

    fn finish_client_connect(&mut self, fd: RawFd) -> Result<()> {
        let peer_addr = addr_sys::getsockname(fd).unwrap_or(Addr::Unix(String::new()));
        let is_unix = self.addr.is_unix();
        let mut conn = Connection::new_with_mode(fd, is_unix, false, self.cfg.read_buf_len, self.raw);
        conn.setup_keepalive(self.cfg.keepalive)?;
        if is_unix {
            let _ = conn.fetch_peer_cred();
        }
        let pending = self.pending_fd.clone();
        self.loop_.add_fd(fd, FdInterest::IN, move |_l, fd, rev| {
            pending.lock().unwrap().push_back((fd, rev));
        })?;
        let Kind::Client { connect_fd, conn: slot, .. } = &mut self.kind else { unreachable!() };
        *connect_fd = None;
        *slot = Some(ConnSlot { conn, peer_addr });
        self.notify(fd, CtxEvent::Connected);
        Ok(())
    }

    /// Binds the datagram socket. Fails if this is not a dgram context or is
    /// already started.
    pub fn bind(&mut self) -> Result<()> {
        if !matches!(self.kind, Kind::Dgram { .. }) {
            return Err(PompError::InvalidArgument("bind() requires a dgram context"));
        }
        self.assert_not_started()?;
        self.started = true;
        addr_sys::unlink_unix_path(&self.addr);
        let fd = addr_sys::open_socket(&self.addr, libc::SOCK_DGRAM)?;
        self.call_socket_cb(fd);
        if let Err(e) = addr_sys::bind_addr(fd, &self.addr) {
            unsafe {
                libc::close(fd);
            }
            return Err(e);
        }
        let pending = self.pending_fd.clone();
        self.loop_.add_fd(fd, FdInterest::IN, move |_l, fd, rev| {
            pending.lock().unwrap().push_back((fd, rev));
        })?;
        let Kind::Dgram { fd: slot } = &mut self.kind else { unreachable!() };
        *slot = Some(fd);
        Ok(())
    }

    // ---- driving the loop ----------------------------------------------

    /// Runs one pass: blocks in the underlying loop for at most `timeout`
    /// (or forever if `None`), then dispatches everything it produced. A
    /// `timeout` that elapses with nothing ready is not an error; the call
    /// simply returns having done no dispatch work.
    pub fn wait_and_process(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.loop_.wait_and_process(timeout)?;
        self.drain_pending();
        Ok(())
    }

    fn drain_pending(&mut self) {
        let events: Vec<_> = self.pending_fd.lock().unwrap().drain(..).collect();
        for (fd, revents) in events {
            self.dispatch_fd(fd, revents);
            self.maybe_finish_stop();
        }
        self.check_retry();
        self.maybe_finish_stop();
    }

    fn check_retry(&mut self) {
        match &self.kind {
            Kind::Server { retry_flag, .. } => {
                if std::mem::take(&mut *retry_flag.lock().unwrap()) {
                    let _ = self.try_listen();
                }
            }
            Kind::Client { retry_flag, .. } => {
                if std::mem::take(&mut *retry_flag.lock().unwrap()) {
                    let _ = self.try_connect();
                }
            }
            Kind::Dgram { .. } => {}
        }
    }

    fn dispatch_fd(&mut self, fd: RawFd, revents: Revents) {
        match &self.kind {
            Kind::Server { listen_fd, .. } if *listen_fd == Some(fd) => self.dispatch_accept(fd),
            Kind::Client { connect_fd, .. } if *connect_fd == Some(fd) => self.dispatch_connect_progress(fd),
            Kind::Dgram { fd: dfd, .. } if *dfd == Some(fd) => self.dispatch_dgram(fd, revents),
            _ => self.dispatch_conn(fd, revents),
        }
    }

    fn dispatch_accept(&mut self, listen_fd: RawFd) {
        loop {
            let (fd, peer_addr) = match addr_sys::accept_conn(listen_fd) {
                Ok(v) => v,
                Err(e) if is_would_block(&e) => return,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    return;
                }
            };
            let Kind::Server { conns, .. } = &mut self.kind else { unreachable!() };
            if conns.len() >= self.cfg.max_conn {
                tracing::warn!(max_conn = self.cfg.max_conn, "server connection cap reached, closing accepted fd");
                unsafe {
                    libc::close(fd);
                }
                continue;
            }
            let is_unix = self.addr.is_unix();
            let mut conn = Connection::new_with_mode(fd, is_unix, false, self.cfg.read_buf_len, self.raw);
            if let Err(e) = conn.setup_keepalive(self.cfg.keepalive) {
                tracing::warn!(error = %e, "failed to apply keepalive settings");
            }
            if is_unix {
                let _ = conn.fetch_peer_cred();
            }
            let pending = self.pending_fd.clone();
            if let Err(e) = self.loop_.add_fd(fd, FdInterest::IN, move |_l, fd, rev| {
                pending.lock().unwrap().push_back((fd, rev));
            }) {
                tracing::error!(error = %e, "failed to register accepted connection with loop");
                continue;
            }
            let Kind::Server { conns, .. } = &mut self.kind else { unreachable!() };
            conns.insert(fd, ConnSlot { conn, peer_addr });
            self.notify(fd, CtxEvent::Connected);
        }
    }

    fn dispatch_connect_progress(&mut self, fd: RawFd) {
        match addr_sys::take_socket_error(fd) {
            Ok(()) => {
                let _ = self.loop_.remove_fd(fd);
                if let Err(e) = self.finish_client_connect(fd) {
                    tracing::error!(error = %e, "failed to finalize client connection");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "client connect failed");
                let _ = self.loop_.remove_fd(fd);
                unsafe {
                    libc::close(fd);
                }
                let Kind::Client { connect_fd, .. } = &mut self.kind else { unreachable!() };
                *connect_fd = None;
                let _ = self.schedule_client_retry(e);
            }
        }
    }

    fn dispatch_dgram(&mut self, fd: RawFd, revents: Revents) {
        if !revents.contains(Revents::IN) {
            return;
        }
        let mut buf = vec![0u8; self.cfg.read_buf_len.max(1)];
        loop {
            match addr_sys::recvfrom_addr(fd, &mut buf) {
                Ok((n, _peer)) => {
                    if self.raw {
                        self.notify_raw(fd, &buf[..n]);
                    } else {
                        match Message::from_buffer(pomp_core::Buffer::new_with_data(&buf[..n])) {
                            Ok(msg) => self.notify(fd, CtxEvent::Msg(&msg)),
                            Err(e) => tracing::warn!(error = %e, "discarding malformed datagram"),
                        }
                    }
                }
                Err(e) if is_would_block(&e) => return,
                Err(e) => {
                    tracing::error!(error = %e, "dgram recv failed");
                    return;
                }
            }
        }
    }

    fn dispatch_conn(&mut self, fd: RawFd, revents: Revents) {
        if revents.contains(Revents::OUT) {
            self.dispatch_writable(fd);
            if !self.conn_exists(fd) {
                return;
            }
        }
        if revents.contains(Revents::IN) || revents.contains(Revents::HUP) || revents.contains(Revents::ERR) {
            self.dispatch_readable(fd);
        }
    }

    fn conn_exists(&self, fd: RawFd) -> bool {
        match &self.kind {
            Kind::Server { conns, .. } => conns.contains_key(&fd),
            Kind::Client { conn, .. } => conn.as_ref().is_some_and(|s| s.conn.fd() == fd),
            Kind::Dgram { .. } => false,
        }
    }

    fn dispatch_readable(&mut self, fd: RawFd) {
        let outcome = {
            let Some(slot) = self.conn_slot_mut(fd) else { return };
            slot.conn.readable()
        };
        match outcome {
            Ok(ReadOutcome::Messages(msgs)) => {
                for msg in msgs {
                    self.notify(fd, CtxEvent::Msg(&msg));
                }
            }
            Ok(ReadOutcome::Raw(chunks)) => {
                for chunk in chunks {
                    self.notify_raw(fd, &chunk);
                }
            }
            Ok(ReadOutcome::WouldBlock) => {}
            Ok(ReadOutcome::Eof) => self.teardown_conn(fd),
            Err(e) => {
                tracing::warn!(error = %e, "connection read error");
                self.teardown_conn(fd);
            }
        }
    }

    fn dispatch_writable(&mut self, fd: RawFd) {
        let result = {
            let Some(slot) = self.conn_slot_mut(fd) else { return };
            slot.conn.writable()
        };
        match result {
            Ok((done, drained)) => {
                let last = done.len().saturating_sub(1);
                for (i, cookie) in done.into_iter().enumerate() {
                    let mut status = SendStatus::OK;
                    if drained && i == last {
                        status |= SendStatus::QUEUE_EMPTY;
                    }
                    self.notify_send(fd, cookie, status);
                }
                if drained {
                    if let Some(slot) = self.conn_slot_mut(fd) {
                        if !slot.conn.is_async() {
                            let _ = self.loop_.update_fd(fd, FdInterest::IN);
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "connection write error");
                self.teardown_conn(fd);
            }
        }
    }

    fn conn_slot_mut(&mut self, fd: RawFd) -> Option<&mut ConnSlot> {
        match &mut self.kind {
            Kind::Server { conns, .. } => conns.get_mut(&fd),
            Kind::Client { conn, .. } => conn.as_mut().filter(|s| s.conn.fd() == fd),
            Kind::Dgram { .. } => None,
        }
    }

    /// Shuts down the single connection identified by `fd` (server or
    /// client context): subsequent sends on it fail with
    /// [`PompError::NotConnected`]. The connection is not actually removed
    /// from the context, and [`CtxEvent::Disconnected`] is not delivered,
    /// until the next loop iteration: `shutdown(SHUT_RDWR)` makes the fd's
    /// own read side report EOF, which the next `wait_and_process` pass (not
    /// the one currently dispatching, if any) observes as an ordinary
    /// `readable()` EOF and tears down through the usual path. This avoids
    /// invalidating a dispatch currently in progress (e.g. a server
    /// iterating its connection map while broadcasting), matching
    /// `pomp_conn_close`'s deferred-removal contract.
    pub fn disconnect(&mut self, fd: RawFd) -> Result<()> {
        let Some(slot) = self.conn_slot_mut(fd) else { return Err(PompError::NotFound("no such connection")) };
        slot.conn.disconnect()
    }

    fn teardown_conn(&mut self, fd: RawFd) {
        let _ = self.loop_.remove_fd(fd);
        let removed = match &mut self.kind {
            Kind::Server { conns, .. } => conns.remove(&fd).is_some(),
            Kind::Client { conn, .. } => {
                if conn.as_ref().is_some_and(|s| s.conn.fd() == fd) {
                    *conn = None;
                    true
                } else {
                    false
                }
            }
            Kind::Dgram { .. } => false,
        };
        if removed {
            self.notify(fd, CtxEvent::Disconnected);
            if matches!(self.kind, Kind::Client { .. }) && !self.stopping {
                let _ = self.schedule_client_retry(PompError::NotConnected);
            }
        }
    }

    fn notify(&mut self, fd: RawFd, ev: CtxEvent<'_>) {
        let mut cb = std::mem::replace(&mut self.event_cb, Box::new(|_, _, _| {}));
        self.notifying_depth += 1;
        cb(self, fd, ev);
        self.notifying_depth -= 1;
        self.event_cb = cb;
    }

    fn notify_raw(&mut self, fd: RawFd, data: &[u8]) {
        let Some(mut cb) = self.raw_cb.take() else { return };
        self.notifying_depth += 1;
        cb(self, fd, data);
        self.notifying_depth -= 1;
        self.raw_cb = Some(cb);
    }

    fn notify_send(&mut self, fd: RawFd, cookie: u64, status: SendStatus) {
        let Some(mut cb) = self.send_cb.take() else { return };
        self.notifying_depth += 1;
        cb(self, fd, cookie, status);
        self.notifying_depth -= 1;
        self.send_cb = Some(cb);
    }

    fn maybe_finish_stop(&mut self) {
        if self.stopping && self.notifying_depth == 0 {
            self.do_stop();
        }
    }

    // ---- sending --------------------------------------------------------

    fn queue_on(&mut self, fd: RawFd, msg: Message) {
        let outcome = {
            let Some(slot) = self.conn_slot_mut(fd) else { return };
            slot.conn.queue_send(msg)
        };
        match outcome {
            Ok(QueueOutcome::Completed { cookie, queue_empty }) => {
                let mut status = SendStatus::OK;
                if queue_empty {
                    status |= SendStatus::QUEUE_EMPTY;
                }
                self.notify_send(fd, cookie, status);
            }
            Ok(QueueOutcome::Queued { became_async }) => {
                if became_async {
                    tracing::debug!(fd, "connection entering async (write-pending) mode");
                    let _ = self.loop_.update_fd(fd, FdInterest::IN | FdInterest::OUT);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, fd, "send failed");
                self.teardown_conn(fd);
            }
        }
    }

    /// Broadcasts (server) or sends on the single connection (client).
    /// Rejected for a dgram context: use [`Context::send_msg_to`].
    pub fn send_msg(&mut self, msg: Message) -> Result<()> {
        match &self.kind {
            Kind::Server { conns, .. } => {
                let fds: Vec<RawFd> = conns.keys().copied().collect();
                for fd in fds {
                    let clone = msg.clone();
                    self.queue_on(fd, clone);
                }
                Ok(())
            }
            Kind::Client { conn, .. } => {
                let Some(slot) = conn else { return Err(PompError::NotConnected) };
                let fd = slot.conn.fd();
                self.queue_on(fd, msg);
                Ok(())
            }
            Kind::Dgram { .. } => Err(PompError::InvalidArgument("use send_msg_to on a dgram context")),
        }
    }

    /// Sends `msg` to `to` on a dgram context. Rejected for server/client
    /// contexts.
    pub fn send_msg_to(&mut self, msg: &Message, to: &Addr) -> Result<()> {
        let Kind::Dgram { fd } = &self.kind else {
            return Err(PompError::InvalidArgument("send_msg_to requires a dgram context"));
        };
        let fd = fd.ok_or(PompError::NotConnected)?;
        let len = msg.buffer().len();
        let mut pos = 0;
        msg.buffer().with_slice(&mut pos, len, |d| addr_sys::sendto_addr(fd, d, to))??;
        Ok(())
    }

    fn queue_on_raw(&mut self, fd: RawFd, buf: pomp_core::Buffer) {
        let outcome = {
            let Some(slot) = self.conn_slot_mut(fd) else { return };
            slot.conn.queue_send_raw(buf)
        };
        match outcome {
            Ok(QueueOutcome::Completed { cookie, queue_empty }) => {
                let mut status = SendStatus::OK;
                if queue_empty {
                    status |= SendStatus::QUEUE_EMPTY;
                }
                self.notify_send(fd, cookie, status);
            }
            Ok(QueueOutcome::Queued { became_async }) => {
                if became_async {
                    tracing::debug!(fd, "connection entering async (write-pending) mode");
                    let _ = self.loop_.update_fd(fd, FdInterest::IN | FdInterest::OUT);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, fd, "send failed");
                self.teardown_conn(fd);
            }
        }
    }

    /// Sends `buf` verbatim, bypassing the framer. Only meaningful on a
    /// context configured with [`Context::set_raw`]; grounded on
    /// `pomp_ctx_send_raw_buf`, which skips `pomp_prot_encode_msg` entirely.
    /// Broadcasts (server) or sends on the single connection (client).
    /// Rejected for a dgram context: use [`Context::send_raw_to`].
    pub fn send_raw(&mut self, buf: pomp_core::Buffer) -> Result<()> {
        if !self.raw {
            return Err(PompError::InvalidArgument("send_raw requires a context configured with set_raw"));
        }
        match &self.kind {
            Kind::Server { conns, .. } => {
                let fds: Vec<RawFd> = conns.keys().copied().collect();
                for fd in fds {
                    let clone = buf.clone();
                    self.queue_on_raw(fd, clone);
                }
                Ok(())
            }
            Kind::Client { conn, .. } => {
                let Some(slot) = conn else { return Err(PompError::NotConnected) };
                let fd = slot.conn.fd();
                self.queue_on_raw(fd, buf);
                Ok(())
            }
            Kind::Dgram { .. } => Err(PompError::InvalidArgument("use send_raw_to on a dgram context")),
        }
    }

    /// Sends `buf` verbatim to `to` on a dgram context, bypassing the
    /// framer. Rejected for server/client contexts. Grounded on
    /// `pomp_ctx_send_raw_buf_to`.
    pub fn send_raw_to(&mut self, buf: &pomp_core::Buffer, to: &Addr) -> Result<()> {
        if !self.raw {
            return Err(PompError::InvalidArgument("send_raw_to requires a context configured with set_raw"));
        }
        let Kind::Dgram { fd } = &self.kind else {
            return Err(PompError::InvalidArgument("send_raw_to requires a dgram context"));
        };
        let fd = fd.ok_or(PompError::NotConnected)?;
        let len = buf.len();
        let mut pos = 0;
        buf.with_slice(&mut pos, len, |d| addr_sys::sendto_addr(fd, d, to))??;
        Ok(())
    }

    /// Builds a message from a printf-style format string and typed
    /// arguments, then sends it the same way [`Context::send_msg`] would.
    pub fn send(&mut self, msgid: u32, fmt: &str, values: &[Value]) -> Result<()> {
        let mut enc = Encoder::new(msgid);
        enc.write(fmt, values)?;
        self.send_msg(enc.finish()?)
    }

    /// Allocates a fresh message id scoped to this context, matching the
    /// reference implementation's auto-incrementing id counter for
    /// `pomp_ctx_send` callers that don't track their own ids.
    pub fn next_msgid(&mut self) -> u32 {
        self.next_msgid_scratch = self.next_msgid_scratch.wrapping_add(1);
        self.next_msgid_scratch
    }

    // ---- shutdown ---------------------------------------------------------

    /// Stops the context: disconnects every connection (flushing pending
    /// sends as `ABORTED`), tears down sockets, and unlinks any Unix path.
    /// If called from within an event callback, teardown is deferred to the
    /// next time `notifying_depth` returns to zero.
    pub fn stop(&mut self) {
        if self.notifying_depth > 0 {
            self.stopping = true;
            return;
        }
        self.do_stop();
    }

    fn do_stop(&mut self) {
        self.stopping = false;
        match std::mem::replace(&mut self.kind, Kind::Dgram { fd: None }) {
            Kind::Server { listen_fd, mut conns, .. } => {
                if let Some(fd) = listen_fd {
                    let _ = self.loop_.remove_fd(fd);
                    unsafe {
                        libc::close(fd);
                    }
                }
                for (fd, mut slot) in conns.drain() {
                    let _ = self.loop_.remove_fd(fd);
                    self.abort_pending(&mut slot.conn);
                    self.notify(fd, CtxEvent::Disconnected);
                }
            }
            Kind::Client { connect_fd, conn, .. } => {
                if let Some(fd) = connect_fd {
                    let _ = self.loop_.remove_fd(fd);
                    unsafe {
                        libc::close(fd);
                    }
                }
                if let Some(mut slot) = conn {
                    let fd = slot.conn.fd();
                    let _ = self.loop_.remove_fd(fd);
                    self.abort_pending(&mut slot.conn);
                    self.notify(fd, CtxEvent::Disconnected);
                }
            }
            Kind::Dgram { fd } => {
                if let Some(fd) = fd {
                    let _ = self.loop_.remove_fd(fd);
                    unsafe {
                        libc::close(fd);
                    }
                }
            }
        }
        addr_sys::unlink_unix_path(&self.addr);
        self.started = false;
    }

    fn abort_pending(&mut self, conn: &mut Connection) {
        for cookie in conn.abort_pending_sends() {
            let fd = conn.fd();
            self.notify_send(fd, cookie, SendStatus::ABORTED | SendStatus::QUEUE_EMPTY);
        }
    }

    /// Underlying loop, for embedding this context's readiness into a host
    /// application's own dispatch (e.g. via [`Loop::get_fd`]).
    pub fn loop_mut(&mut self) -> &mut Loop {
        &mut self.loop_
    }

    pub fn addr(&self) -> &Addr {
        &self.addr
    }
}

fn is_would_block(e: &PompError) -> bool {
    matches!(e, PompError::Io(io) if io.kind() == std::io::ErrorKind::WouldBlock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    fn unique_unix_addr() -> Addr {
        let path = std::env::temp_dir().join(format!("pomp-ctx-test-{}-{}.sock", std::process::id(), rand_suffix()));
        Addr::Unix(path.to_string_lossy().into_owned())
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos() as u64
    }

    fn unique_loopback_addr() -> Addr {
        let port = 20000 + (rand_suffix() % 20000) as u16;
        Addr::Inet(std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn server_accepts_client_and_exchanges_a_message() {
        let addr = unique_unix_addr();
        let server_events: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let se = server_events.clone();
        let mut server = Context::server(
            Loop::new().unwrap(),
            addr.clone(),
            ContextConfig::default(),
            Box::new(move |ctx, fd, ev| match ev {
                CtxEvent::Connected => {
                    se.borrow_mut().push("connected".into());
                    let mut enc = Encoder::new(1);
                    enc.write_u32(7).unwrap();
                    ctx.send_msg(enc.finish().unwrap()).unwrap();
                    let _ = fd;
                }
                CtxEvent::Disconnected => se.borrow_mut().push("disconnected".into()),
                CtxEvent::Msg(_) => se.borrow_mut().push("msg".into()),
            }),
        );
        server.listen().unwrap();

        let client_events: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
        let ce = client_events.clone();
        let mut client = Context::client(
            Loop::new().unwrap(),
            addr,
            ContextConfig::default(),
            Box::new(move |_ctx, _fd, ev| {
                if let CtxEvent::Msg(m) = ev {
                    let mut dec = pomp_core::codec::Decoder::new(m);
                    ce.borrow_mut().push(dec.read_u32().unwrap());
                }
            }),
        );
        client.connect().unwrap();

        for _ in 0..50 {
            server.wait_and_process(Some(Duration::from_millis(20))).ok();
            client.wait_and_process(Some(Duration::from_millis(20))).ok();
            if !client_events.borrow().is_empty() {
                break;
            }
        }
        assert_eq!(*client_events.borrow(), vec![7]);
        assert!(server_events.borrow().contains(&"connected".to_string()));
    }

    #[test]
    fn disconnecting_one_client_leaves_the_other_connected() {
        let addr = unique_unix_addr();
        let connected_fds: Rc<RefCell<Vec<RawFd>>> = Rc::new(RefCell::new(Vec::new()));
        let cf = connected_fds.clone();
        let mut server = Context::server(
            Loop::new().unwrap(),
            addr.clone(),
            ContextConfig::default(),
            Box::new(move |ctx, fd, ev| match ev {
                CtxEvent::Connected => {
                    let mut fds = cf.borrow_mut();
                    fds.push(fd);
                    if fds.len() == 2 {
                        let first = fds[0];
                        drop(fds);
                        ctx.disconnect(first).unwrap();
                    }
                }
                CtxEvent::Disconnected => {
                    cf.borrow_mut().retain(|f| *f != fd);
                }
                CtxEvent::Msg(_) => {}
            }),
        );
        server.listen().unwrap();

        let mut client_a = Context::client(
            Loop::new().unwrap(),
            addr.clone(),
            ContextConfig::default(),
            Box::new(|_ctx, _fd, _ev| {}),
        );
        client_a.connect().unwrap();

        let mut client_b = Context::client(
            Loop::new().unwrap(),
            addr,
            ContextConfig::default(),
            Box::new(|_ctx, _fd, _ev| {}),
        );
        client_b.connect().unwrap();

        for _ in 0..100 {
            server.wait_and_process(Some(Duration::from_millis(10))).ok();
            client_a.wait_and_process(Some(Duration::from_millis(10))).ok();
            client_b.wait_and_process(Some(Duration::from_millis(10))).ok();
            if connected_fds.borrow().len() == 1 {
                break;
            }
        }
        assert_eq!(connected_fds.borrow().len(), 1, "exactly one client should remain connected");
    }

    #[test]
    fn dgram_contexts_exchange_a_request_and_a_reply_with_no_connection_events() {
        let addr_a = unique_loopback_addr();
        let Addr::Inet(v4) = &addr_a else { unreachable!() };
        let addr_b = Addr::Inet(std::net::SocketAddrV4::new(*v4.ip(), v4.port().wrapping_add(1)));

        let a_events: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let a_replies: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
        let ae = a_events.clone();
        let ar = a_replies.clone();
        let mut a = Context::dgram(
            Loop::new().unwrap(),
            addr_a,
            ContextConfig::default(),
            Box::new(move |_ctx, _fd, ev| match ev {
                CtxEvent::Connected => ae.borrow_mut().push("connected".into()),
                CtxEvent::Disconnected => ae.borrow_mut().push("disconnected".into()),
                CtxEvent::Msg(m) => {
                    let mut dec = pomp_core::codec::Decoder::new(m);
                    ar.borrow_mut().push(dec.read_u32().unwrap());
                }
            }),
        );
        a.bind().unwrap();

        let b_events: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let be = b_events.clone();
        let addr_a_for_reply = a.addr().clone();
        let mut b = Context::dgram(
            Loop::new().unwrap(),
            addr_b.clone(),
            ContextConfig::default(),
            Box::new(move |ctx, _fd, ev| match ev {
                CtxEvent::Connected => be.borrow_mut().push("connected".into()),
                CtxEvent::Disconnected => be.borrow_mut().push("disconnected".into()),
                CtxEvent::Msg(m) => {
                    let mut dec = pomp_core::codec::Decoder::new(m);
                    assert_eq!(dec.read_u32().unwrap(), 1);
                    let mut enc = Encoder::new(2);
                    enc.write_u32(99).unwrap();
                    ctx.send_msg_to(&enc.finish().unwrap(), &addr_a_for_reply).unwrap();
                }
            }),
        );
        b.bind().unwrap();

        let mut req = Encoder::new(1);
        req.write_u32(1).unwrap();
        a.send_msg_to(&req.finish().unwrap(), &addr_b).unwrap();

        for _ in 0..100 {
            a.wait_and_process(Some(Duration::from_millis(10))).ok();
            b.wait_and_process(Some(Duration::from_millis(10))).ok();
            if !a_replies.borrow().is_empty() {
                break;
            }
        }

        assert_eq!(*a_replies.borrow(), vec![99]);
        assert!(a_events.borrow().is_empty(), "dgram contexts must never emit connection events");
        assert!(b_events.borrow().is_empty(), "dgram contexts must never emit connection events");
    }

    #[test]
    fn backpressure_delivers_all_buffers_in_order_with_one_completion_per_send() {
        const COUNT: usize = 1024;
        let addr = unique_unix_addr();

        let received: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
        let r = received.clone();
        let mut server = Context::server(
            Loop::new().unwrap(),
            addr.clone(),
            ContextConfig::default(),
            Box::new(move |_ctx, _fd, ev| {
                if let CtxEvent::Msg(m) = ev {
                    let mut dec = pomp_core::codec::Decoder::new(m);
                    r.borrow_mut().push(dec.read_u32().unwrap() as usize);
                }
            }),
        );
        server.listen().unwrap();

        let completions: Rc<RefCell<Vec<SendStatus>>> = Rc::new(RefCell::new(Vec::new()));
        let c = completions.clone();
        let mut client = Context::client(
            Loop::new().unwrap(),
            addr,
            ContextConfig::default(),
            Box::new(|_ctx, _fd, _ev| {}),
        );
        client.set_send_cb(Box::new(move |_ctx, _fd, _cookie, status| c.borrow_mut().push(status))).unwrap();
        client.connect().unwrap();

        for _ in 0..50 {
            client.wait_and_process(Some(Duration::from_millis(10))).ok();
            if matches!(&client.kind, Kind::Client { conn: Some(_), .. }) {
                break;
            }
        }

        for i in 0..COUNT {
            let mut enc = Encoder::new(1);
            enc.write_u32(i as u32).unwrap();
            enc.write_buf(&[0u8; 1024]).unwrap();
            client.send_msg(enc.finish().unwrap()).unwrap();
        }

        for _ in 0..2000 {
            client.wait_and_process(Some(Duration::from_millis(5))).ok();
            server.wait_and_process(Some(Duration::from_millis(5))).ok();
            if received.borrow().len() == COUNT && completions.borrow().len() == COUNT {
                break;
            }
        }

        assert_eq!(received.borrow().len(), COUNT, "server must receive every buffer");
        assert_eq!(
            *received.borrow(),
            (0..COUNT).collect::<Vec<_>>(),
            "buffers must arrive in send order"
        );
        assert_eq!(completions.borrow().len(), COUNT, "one completion per successful send");
        assert!(completions.borrow().iter().all(|s| s.contains(SendStatus::OK)));
        assert!(
            completions.borrow().last().unwrap().contains(SendStatus::QUEUE_EMPTY),
            "the final completion must observe the queue drained"
        );
    }
}
