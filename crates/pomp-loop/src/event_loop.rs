//! Single-backend (`mio`) event loop: fd readiness dispatch, an idle work
//! queue, and the timer/cross-thread-event integration that drives
//! [`crate::timer::Timer`] and [`crate::event::Event`].
//!
//! The reference implementation picks an OS-specific backend (`epoll`,
//! `poll`, `kqueue`, IOCP) at build time; here `mio` plays that role
//! uniformly across platforms, so there is exactly one `Loop` implementation
//! instead of one per OS.

use std::{
    collections::{BinaryHeap, HashMap, VecDeque},
    os::fd::{AsRawFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use mio::{unix::SourceFd, Events, Interest, Poll, Token};
use pomp_core::{PompError, Result};

bitflags::bitflags! {
    /// Readiness a caller registers interest in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdInterest: u8 {
        const IN  = 0x01;
        const OUT = 0x02;
    }
}

bitflags::bitflags! {
    /// Readiness actually observed for a dispatched fd.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Revents: u8 {
        const IN  = 0x01;
        const OUT = 0x02;
        const ERR = 0x04;
        const HUP = 0x08;
    }
}

impl FdInterest {
    fn to_mio(self) -> Interest {
        match (self.contains(FdInterest::IN), self.contains(FdInterest::OUT)) {
            (true, true) => Interest::READABLE.add(Interest::WRITABLE),
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => Interest::READABLE,
        }
    }
}

type FdCallback = Box<dyn FnMut(&mut Loop, RawFd, Revents) + Send + 'static>;

struct FdEntry {
    interest: FdInterest,
    callback: FdCallback,
}

type ExtraCallback = Box<dyn FnMut(&mut Loop) + Send + 'static>;

type IdleCallback = Box<dyn FnOnce(&mut Loop) + Send + 'static>;

/// Opaque handle identifying one [`Loop::idle_add`]/[`Loop::idle_add_with_cookie`]
/// entry, for use with [`Loop::idle_remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdleToken(u64);

struct IdleEntry {
    token: IdleToken,
    cookie: Option<u64>,
    /// `None` once fired or removed. A removed entry is kept in the queue
    /// (not popped) so FIFO positions of later entries are preserved, and is
    /// simply skipped when its turn comes up during a dispatch pass.
    callback: Option<IdleCallback>,
}

/// Opaque handle identifying an idle-queue entry, timer, or event, scoped to
/// the `Loop` that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

pub(crate) struct TimerEntry {
    pub(crate) deadline: Instant,
    pub(crate) period: Option<Duration>,
    pub(crate) callback: Box<dyn FnMut(&mut Loop, TimerId) + Send + 'static>,
    pub(crate) armed: bool,
}

#[derive(PartialEq, Eq)]
struct TimerKey {
    deadline: Instant,
    id: u64,
}

impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts
        // first.
        other.deadline.cmp(&self.deadline).then_with(|| other.id.cmp(&self.id))
    }
}
impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Maximum time a single `poll` call is allowed to block even with no timers
/// armed, so a loop that only ever waits on fds still wakes periodically to
/// notice external `wakeup()` calls racing the poll syscall.
const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(1);

const WAKE_TOKEN: Token = Token(usize::MAX);

/// The event loop itself. Not `Send`/`Sync`: like the reference
/// implementation, a loop is meant to be driven from a single thread, with
/// cross-thread interaction only through [`crate::event::Event`] and the
/// idle queue's `post` path.
pub struct Loop {
    poll: Poll,
    events_buf: Events,
    fds: HashMap<RawFd, FdEntry>,
    /// Non-fd readiness sources registered directly against a `mio::Token`
    /// (currently just [`crate::event::Event`]'s internal `Waker`).
    extra: HashMap<usize, ExtraCallback>,
    idle: VecDeque<IdleEntry>,
    next_idle_id: u64,
    timers: HashMap<u64, TimerEntry>,
    timer_heap: BinaryHeap<TimerKey>,
    /// Ids destroyed while their own callback was running (the entry is
    /// removed from `timers` for the duration of the callback so it can hold
    /// `&mut self`); checked after the callback returns to suppress
    /// reinsertion.
    timers_removed: std::collections::HashSet<u64>,
    next_timer_id: u64,
    waker: Arc<mio::Waker>,
    woken: Arc<AtomicBool>,
    thread_id: std::thread::ThreadId,
    watchdog: Option<crate::watchdog::Watchdog>,
}

impl Loop {
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            events_buf: Events::with_capacity(128),
            fds: HashMap::new(),
            extra: HashMap::new(),
            idle: VecDeque::new(),
            next_idle_id: 1,
            timers: HashMap::new(),
            timer_heap: BinaryHeap::new(),
            timers_removed: std::collections::HashSet::new(),
            next_timer_id: 1,
            waker,
            woken: Arc::new(AtomicBool::new(false)),
            thread_id: std::thread::current().id(),
            watchdog: None,
        })
    }

    /// Enables dispatch-pass monitoring: if a single [`Loop::wait_and_process`]
    /// call's fd/timer/idle dispatch (excluding the blocking `poll` wait
    /// itself) takes longer than `delay`, `cb` fires once from a dedicated
    /// watchdog thread. Replaces any previously installed watchdog.
    pub fn enable_watchdog(&mut self, delay: Duration, cb: impl FnMut() + Send + 'static) {
        self.watchdog = Some(crate::watchdog::Watchdog::start(delay, cb));
    }

    /// Disables dispatch-pass monitoring installed by [`Loop::enable_watchdog`].
    pub fn disable_watchdog(&mut self) {
        self.watchdog = None;
    }

    /// The loop's underlying poll descriptor, for embedding into another
    /// event source's poll set.
    pub fn get_fd(&self) -> RawFd {
        self.poll.as_raw_fd()
    }

    fn assert_same_thread(&self) {
        pomp_utils::safe_assert!(
            std::thread::current().id() == self.thread_id,
            "pomp loop accessed from a thread other than the one that created it"
        );
    }

    /// Registers `fd` for the given interest, invoking `callback` whenever
    /// it becomes ready.
    pub fn add_fd(
        &mut self,
        fd: RawFd,
        interest: FdInterest,
        callback: impl FnMut(&mut Loop, RawFd, Revents) + Send + 'static,
    ) -> Result<()> {
        self.assert_same_thread();
        if self.fds.contains_key(&fd) {
            return Err(PompError::Busy("fd already registered with this loop"));
        }
        self.poll.registry().register(&mut SourceFd(&fd), Token(fd as usize), interest.to_mio())?;
        self.fds.insert(fd, FdEntry { interest, callback: Box::new(callback) });
        Ok(())
    }

    /// Changes the readiness interest for an already-registered fd.
    pub fn update_fd(&mut self, fd: RawFd, interest: FdInterest) -> Result<()> {
        self.assert_same_thread();
        let entry = self.fds.get_mut(&fd).ok_or(PompError::NotFound("fd not registered with this loop"))?;
        self.poll.registry().reregister(&mut SourceFd(&fd), Token(fd as usize), interest.to_mio())?;
        entry.interest = interest;
        Ok(())
    }

    /// Unregisters `fd`. Safe to call from within the fd's own callback.
    pub fn remove_fd(&mut self, fd: RawFd) -> Result<()> {
        self.assert_same_thread();
        if self.fds.remove(&fd).is_none() {
            return Err(PompError::NotFound("fd not registered with this loop"));
        }
        self.poll.registry().deregister(&mut SourceFd(&fd)).ok();
        Ok(())
    }

    pub fn has_fd(&self, fd: RawFd) -> bool {
        self.fds.contains_key(&fd)
    }

    /// Dispatches `fd`'s callback directly with the given `revents`, without
    /// going through [`Loop::wait_and_process`]'s `poll` call. For embedding
    /// this loop's fds into an external dispatch mechanism that has already
    /// determined readiness some other way.
    pub fn process_fd(&mut self, fd: RawFd, revents: Revents) -> Result<()> {
        self.assert_same_thread();
        let mut entry = self.fds.remove(&fd).ok_or(PompError::NotFound("fd not registered with this loop"))?;
        (entry.callback)(self, fd, revents);
        if !self.fds.contains_key(&fd) {
            self.fds.insert(fd, entry);
        }
        Ok(())
    }

    /// The loop's `mio` registry, for sources (such as
    /// [`crate::event::Event`]'s internal `Waker`) that register themselves
    /// directly against a token rather than going through [`Loop::add_fd`].
    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Associates `token` (already registered against this loop's registry
    /// by the caller) with a dispatch callback.
    pub(crate) fn add_token(&mut self, token: usize, callback: ExtraCallback) {
        self.extra.insert(token, callback);
    }

    pub(crate) fn remove_token(&mut self, token: usize) {
        self.extra.remove(&token);
    }

    /// Queues `f` to run on the next idle pass (from inside
    /// [`Loop::wait_and_process`], after fd/timer dispatch for this tick).
    pub fn idle_add(&mut self, f: impl FnOnce(&mut Loop) + Send + 'static) -> IdleToken {
        self.push_idle(None, f)
    }

    /// Like [`Loop::idle_add`], but tags the entry with `cookie` so a whole
    /// group of related idle callbacks can later be cancelled at once with
    /// [`Loop::idle_remove_by_cookie`] (e.g. all pending send-completion
    /// notifications for one connection).
    pub fn idle_add_with_cookie(&mut self, cookie: u64, f: impl FnOnce(&mut Loop) + Send + 'static) -> IdleToken {
        self.push_idle(Some(cookie), f)
    }

    fn push_idle(&mut self, cookie: Option<u64>, f: impl FnOnce(&mut Loop) + Send + 'static) -> IdleToken {
        let id = self.next_idle_id;
        self.next_idle_id += 1;
        let token = IdleToken(id);
        self.idle.push_back(IdleEntry { token, cookie, callback: Some(Box::new(f)) });
        token
    }

    /// Cancels a single idle entry by token. The entry is not removed from
    /// the queue (preserving FIFO order of the rest) but is skipped when its
    /// turn to fire comes up. Fails with [`PompError::NotFound`] if the
    /// token does not name a still-pending entry (already fired or already
    /// removed).
    pub fn idle_remove(&mut self, token: IdleToken) -> Result<()> {
        for entry in &mut self.idle {
            if entry.token == token && entry.callback.is_some() {
                entry.callback = None;
                return Ok(());
            }
        }
        Err(PompError::NotFound("idle entry not pending"))
    }

    /// Cancels every still-pending idle entry tagged with `cookie`. Fails
    /// with [`PompError::NotFound`] if none matched.
    pub fn idle_remove_by_cookie(&mut self, cookie: u64) -> Result<()> {
        let mut any = false;
        for entry in &mut self.idle {
            if entry.cookie == Some(cookie) && entry.callback.is_some() {
                entry.callback = None;
                any = true;
            }
        }
        if any {
            Ok(())
        } else {
            Err(PompError::NotFound("no idle entry with this cookie"))
        }
    }

    /// True while at least one idle entry (fired or not) remains in the
    /// queue. A loop refuses to be torn down while this holds, matching
    /// `pomp_loop_destroy`'s `-EBUSY` behavior with pending idle work.
    pub fn has_pending_idle(&self) -> bool {
        !self.idle.is_empty()
    }

    fn timer_key(id: u64, deadline: Instant) -> TimerKey {
        TimerKey { deadline, id }
    }

    pub(crate) fn register_timer(&mut self, entry: TimerEntry) -> TimerId {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        if entry.armed {
            self.timer_heap.push(Self::timer_key(id, entry.deadline));
        }
        self.timers.insert(id, entry);
        TimerId(id)
    }

    pub(crate) fn rearm_timer(&mut self, id: TimerId, deadline: Instant, period: Option<Duration>) {
        if let Some(entry) = self.timers.get_mut(&id.0) {
            entry.deadline = deadline;
            entry.period = period;
            entry.armed = true;
            self.timer_heap.push(Self::timer_key(id.0, deadline));
        }
    }

    pub(crate) fn disarm_timer(&mut self, id: TimerId) {
        if let Some(entry) = self.timers.get_mut(&id.0) {
            entry.armed = false;
        }
    }

    pub(crate) fn unregister_timer(&mut self, id: TimerId) {
        self.timers.remove(&id.0);
        self.timers_removed.insert(id.0);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().filter(|t| t.armed).map(|t| t.deadline).min()
    }

    /// Dispatches timers whose deadline has passed, rearming periodic ones.
    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        loop {
            let Some(top) = self.timer_heap.peek() else { break };
            if top.deadline > now {
                break;
            }
            let TimerKey { id, .. } = self.timer_heap.pop().unwrap();
            let Some(entry) = self.timers.get(&id) else { continue };
            if !entry.armed || entry.deadline > now {
                // Stale heap entry: the timer was cleared/rescheduled since
                // this key was pushed.
                continue;
            }
            let period = entry.period;
            if let Some(period) = period {
                let entry = self.timers.get_mut(&id).unwrap();
                entry.deadline = now + period;
                self.timer_heap.push(Self::timer_key(id, entry.deadline));
            } else if let Some(entry) = self.timers.get_mut(&id) {
                entry.armed = false;
            }
            let Some(mut entry) = self.timers.remove(&id) else { continue };
            self.timers_removed.remove(&id);
            (entry.callback)(self, TimerId(id));
            if self.timers_removed.remove(&id) {
                // Destroyed from inside its own callback: stays gone.
            } else {
                self.timers.insert(id, entry);
            }
        }
    }

    /// Runs one idle-queue pass: entries present at the start of the pass
    /// run; entries appended during the pass (including by other entries in
    /// this same pass) wait for the next call.
    fn drain_idle_once(&mut self) {
        let n = self.idle.len();
        for _ in 0..n {
            let Some(entry) = self.idle.pop_front() else { break };
            if let Some(f) = entry.callback {
                f(self);
            }
        }
    }

    /// Returns a thread-safe handle that can interrupt a blocked
    /// [`Loop::wait_and_process`] call from another thread.
    pub fn waker(&self) -> LoopWaker {
        LoopWaker { waker: self.waker.clone(), woken: self.woken.clone() }
    }

    /// Interrupts a concurrent or upcoming `wait_and_process` call. Multiple
    /// calls before the loop wakes collapse into a single wakeup.
    pub fn wakeup(&self) {
        self.waker().wake();
    }

    /// Blocks for at most `timeout` (or forever if `None`), waiting for fd
    /// readiness, due timers, or a `wakeup()`/`Event::signal()` call,
    /// dispatches everything that is ready, then runs one idle-queue pass.
    pub fn wait_and_process(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.assert_same_thread();

        let timer_deadline = self.next_deadline().map(|d| d.saturating_duration_since(Instant::now()));
        let effective = match (timeout, timer_deadline) {
            (Some(t), Some(d)) => Some(t.min(d).min(MAX_POLL_TIMEOUT)),
            (Some(t), None) => Some(t.min(MAX_POLL_TIMEOUT)),
            (None, Some(d)) => Some(d.min(MAX_POLL_TIMEOUT)),
            (None, None) => Some(MAX_POLL_TIMEOUT),
        };

        match self.poll.poll(&mut self.events_buf, effective) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        self.woken.store(false, Ordering::SeqCst);

        if let Some(wd) = &self.watchdog {
            wd.enter();
        }

        self.fire_due_timers();

        let mut ready_fds = Vec::new();
        let mut ready_tokens = Vec::new();
        for ev in self.events_buf.iter() {
            let token = ev.token();
            if token == WAKE_TOKEN {
                continue;
            }
            let mut r = Revents::empty();
            if ev.is_readable() {
                r |= Revents::IN;
            }
            if ev.is_writable() {
                r |= Revents::OUT;
            }
            if ev.is_error() {
                r |= Revents::ERR;
            }
            if ev.is_read_closed() || ev.is_write_closed() {
                r |= Revents::HUP;
            }
            let fd = token.0 as RawFd;
            if self.fds.contains_key(&fd) {
                ready_fds.push((fd, r));
            } else if self.extra.contains_key(&token.0) {
                ready_tokens.push(token.0);
            }
        }

        for (fd, revents) in ready_fds {
            let Some(mut entry) = self.fds.remove(&fd) else { continue };
            (entry.callback)(self, fd, revents);
            if !self.fds.contains_key(&fd) {
                // Callback may have removed (or re-added under a different
                // entry) the fd itself; only reinsert if it is still absent
                // and nothing replaced it.
                self.fds.insert(fd, entry);
            }
        }

        for token in ready_tokens {
            let Some(mut callback) = self.extra.remove(&token) else { continue };
            callback(self);
            if !self.extra.contains_key(&token) {
                self.extra.insert(token, callback);
            }
        }

        self.drain_idle_once();

        if let Some(wd) = &self.watchdog {
            wd.leave();
        }

        Ok(())
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        for fd in self.fds.keys().copied().collect::<Vec<_>>() {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
    }
}

/// A thread-safe, cloneable handle capable of interrupting a loop blocked in
/// [`Loop::wait_and_process`]. Repeated `wake()` calls before the loop
/// observes one collapse into a single wakeup, via the same idempotent
/// compare-exchange discipline as [`crate::event::Event`].
#[derive(Clone)]
pub struct LoopWaker {
    waker: Arc<mio::Waker>,
    woken: Arc<AtomicBool>,
}

impl LoopWaker {
    pub fn wake(&self) {
        if self.woken.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            if let Err(e) = self.waker.wake() {
                tracing::error!(error = %e, "failed to wake event loop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn idle_queue_runs_single_pass() {
        let mut l = Loop::new().unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        l.idle_add(move |l2| {
            o1.lock().unwrap().push(1);
            let o2 = o1.clone();
            l2.idle_add(move |_| {
                o2.lock().unwrap().push(2);
            });
        });
        l.wait_and_process(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1]);
        l.wait_and_process(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn watchdog_fires_on_slow_dispatch_pass() {
        let mut l = Loop::new().unwrap();
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let f2 = fired.clone();
        l.enable_watchdog(Duration::from_millis(10), move || {
            f2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        l.idle_add(|_| std::thread::sleep(Duration::from_millis(40)));
        l.wait_and_process(Some(Duration::from_millis(1))).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn wakeup_unblocks_wait() {
        let mut l = Loop::new().unwrap();
        let waker = l.waker();
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake();
            tx.send(()).unwrap();
        });
        let start = Instant::now();
        l.wait_and_process(Some(Duration::from_secs(5))).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        rx.recv().unwrap();
    }
}
