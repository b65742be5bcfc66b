//! A cross-thread wakeup signal dispatched through the owning [`Loop`].
//! Grounded on `pomp_evt.c`: any thread may call [`Event::signal`]; the
//! loop thread sees at most one dispatch per signal burst, since repeated
//! signals before the loop wakes collapse via the `AtomicBool`
//! compare-exchange below (mirroring the original's `eventfd`/pipe
//! coalescing).
//!
//! Creation and attachment are separate steps, matching `pomp_evt_new`
//! followed by `pomp_evt_attach`: an [`Event`] can be constructed before a
//! loop exists and reused across an attach/detach/attach cycle.

use std::{
    os::fd::{AsRawFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use mio::Token;
use pomp_core::{PompError, Result};

use crate::event_loop::{FdInterest, Loop};

/// A signal source that any thread can trigger, and that the loop thread
/// observes as an ordinary fd readiness callback once attached.
pub struct Event {
    signaled: Arc<AtomicBool>,
    waker: Option<Arc<mio::Waker>>,
    token: u32,
    /// The poll fd of the loop this event is currently attached to, if any.
    /// Used only to answer [`Event::is_attached`]; a bare `bool` would not
    /// let a caller distinguish "attached to some other loop" from
    /// "attached to this one".
    attached_fd: Option<RawFd>,
}

/// A cloneable, `Send + Sync` handle used to signal an [`Event`] from a
/// thread other than the one running the loop.
#[derive(Clone)]
pub struct EventSignaler {
    signaled: Arc<AtomicBool>,
    waker: Arc<mio::Waker>,
}

impl EventSignaler {
    /// Signals the event. If it is already signaled and not yet observed by
    /// the loop thread, this is a no-op: signals do not queue.
    pub fn signal(&self) {
        if self.signaled.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            if let Err(e) = self.waker.wake() {
                tracing::error!(error = %e, "failed to wake loop for event signal");
            }
        }
    }
}

impl Event {
    /// Creates a new, unattached event. `token` distinguishes this event
    /// from others attached to the same loop and any of the loop's own
    /// internal tokens; it has no meaning until [`Event::attach`] is called.
    pub fn new(token: u32) -> Self {
        Self { signaled: Arc::new(AtomicBool::new(false)), waker: None, token, attached_fd: None }
    }

    /// Attaches the event to `l`, invoking `callback` on the loop thread
    /// each time [`EventSignaler::signal`] is observed. Fails with
    /// [`PompError::Busy`] if already attached; call [`Event::detach`]
    /// first to move the event to a different loop.
    pub fn attach(&mut self, l: &mut Loop, mut callback: impl FnMut(&mut Loop) + Send + 'static) -> Result<()> {
        if self.waker.is_some() {
            return Err(PompError::Busy("event already attached to a loop"));
        }
        let waker = Arc::new(mio::Waker::new(l.registry(), Token(Self::wake_token(self.token)))?);
        let fd = waker.as_raw_fd();
        let sig = self.signaled.clone();
        l.add_fd(fd, FdInterest::IN, move |l2, _fd, _rev| {
            sig.store(false, Ordering::SeqCst);
            callback(l2);
        })?;
        self.attached_fd = Some(l.get_fd());
        self.waker = Some(waker);
        Ok(())
    }

    fn wake_token(token: u32) -> usize {
        // Disjoint from both fd tokens (which use the fd number itself) and
        // the loop's own internal wake token (`usize::MAX`).
        (usize::MAX / 2) + token as usize
    }

    /// Whether the event is currently attached. With `l` given, checks
    /// attachment to that specific loop; with `None`, reports whether it is
    /// attached to any loop at all.
    pub fn is_attached(&self, l: Option<&Loop>) -> bool {
        match (self.attached_fd, l) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(fd), Some(l)) => fd == l.get_fd(),
        }
    }

    /// Detaches the event from its loop; the loop will no longer dispatch
    /// it. Idempotent. The event can be reattached afterward, to the same
    /// loop or a different one.
    pub fn detach(&mut self, l: &mut Loop) -> Result<()> {
        let Some(waker) = self.waker.take() else { return Ok(()) };
        let fd = waker.as_raw_fd();
        l.remove_fd(fd)?;
        self.attached_fd = None;
        Ok(())
    }

    /// Returns a handle other threads can use to signal this event. Fails
    /// with [`PompError::NotConnected`] if not currently attached: with no
    /// loop to wake, a signal would otherwise be silently lost.
    pub fn signaler(&self) -> Result<EventSignaler> {
        let waker = self.waker.clone().ok_or(PompError::NotConnected)?;
        Ok(EventSignaler { signaled: self.signaled.clone(), waker })
    }

    /// Signals this event directly, from the loop thread or any other.
    pub fn signal(&self) -> Result<()> {
        self.signaler()?.signal();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn signal_wakes_loop_and_dispatches_once() {
        let mut l = Loop::new().unwrap();
        let count = Arc::new(AtomicBool::new(false));
        let c2 = count.clone();
        let mut ev = Event::new(1);
        assert!(!ev.is_attached(None));
        ev.attach(&mut l, move |_| {
            c2.store(true, Ordering::SeqCst);
        })
        .unwrap();
        assert!(ev.is_attached(Some(&l)));
        let signaler = ev.signaler().unwrap();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            signaler.signal();
        });
        l.wait_and_process(Some(Duration::from_secs(2))).unwrap();
        assert!(count.load(Ordering::SeqCst));
    }

    #[test]
    fn detach_then_reattach() {
        let mut l = Loop::new().unwrap();
        let mut ev = Event::new(2);
        ev.attach(&mut l, |_| {}).unwrap();
        assert!(ev.attach(&mut l, |_| {}).is_err());
        ev.detach(&mut l).unwrap();
        assert!(!ev.is_attached(Some(&l)));
        ev.detach(&mut l).unwrap();
        ev.attach(&mut l, |_| {}).unwrap();
        assert!(ev.is_attached(Some(&l)));
    }

    #[test]
    fn signal_before_attach_is_an_error() {
        let ev = Event::new(3);
        assert!(ev.signal().is_err());
    }
}
