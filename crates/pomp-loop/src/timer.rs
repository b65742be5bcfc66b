//! Single-shot and periodic timers driven by the owning [`Loop`]'s deadline
//! computation; there is no OS timer primitive involved; `Loop` folds the
//! next due timer into the timeout it passes to `mio::Poll::poll`. Grounded
//! on `pomp_timer.c`.

use std::time::{Duration, Instant};

use pomp_core::{PompError, Result};

use crate::event_loop::{Loop, TimerEntry, TimerId};

/// A handle to a timer registered with a [`Loop`]. Dropping the handle does
/// not clear or destroy the timer; call [`Timer::destroy`] explicitly, same
/// as the reference implementation's `pomp_timer_destroy`.
pub struct Timer {
    id: TimerId,
}

impl Timer {
    /// Creates a new, unarmed timer. Call [`Timer::set`] to start it.
    pub fn new(l: &mut Loop, callback: impl FnMut(&mut Loop, &Timer) + Send + 'static) -> Self {
        let mut callback = callback;
        let id = l.register_timer(TimerEntry {
            deadline: Instant::now(),
            period: None,
            armed: false,
            callback: Box::new(move |l2, id| callback(l2, &Timer { id })),
        });
        Self { id }
    }

    /// Arms the timer to fire once after `delay`, then (if `period` is
    /// `Some`) repeatedly every `period` thereafter. A zero `delay` fires on
    /// the loop's next dispatch pass rather than synchronously. Rearms and
    /// replaces any previous schedule; there is no catch-up behavior if the
    /// loop falls behind; a late callback only fires once per elapsed
    /// deadline, resynchronizing to `now + period` rather than stacking up
    /// missed ticks.
    pub fn set(&self, l: &mut Loop, delay: Duration, period: Option<Duration>) -> Result<()> {
        if let Some(p) = period {
            validate_period(p)?;
        }
        l.rearm_timer(self.id, Instant::now() + delay, period);
        Ok(())
    }

    /// Disarms the timer without destroying it; it can be rearmed later with
    /// [`Timer::set`].
    pub fn clear(&self, l: &mut Loop) -> Result<()> {
        l.disarm_timer(self.id);
        Ok(())
    }

    /// Disarms and forgets the timer. The handle must not be used with this
    /// loop afterward.
    pub fn destroy(self, l: &mut Loop) -> Result<()> {
        l.unregister_timer(self.id);
        Ok(())
    }
}

pub(crate) fn validate_period(period: Duration) -> Result<()> {
    if period.is_zero() {
        return Err(PompError::InvalidArgument("periodic timer period must be non-zero"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::Loop;
    use std::sync::{Arc, Mutex};

    #[test]
    fn fires_once_after_delay() {
        let mut l = Loop::new().unwrap();
        let fired = Arc::new(Mutex::new(0));
        let f2 = fired.clone();
        let timer = Timer::new(&mut l, move |_, _| {
            *f2.lock().unwrap() += 1;
        });
        timer.set(&mut l, Duration::from_millis(5), None).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        l.wait_and_process(Some(Duration::from_millis(5))).unwrap();
        assert_eq!(*fired.lock().unwrap(), 1);
        l.wait_and_process(Some(Duration::from_millis(5))).unwrap();
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[test]
    fn periodic_timer_rearms() {
        let mut l = Loop::new().unwrap();
        let fired = Arc::new(Mutex::new(0));
        let f2 = fired.clone();
        let timer = Timer::new(&mut l, move |_, _| {
            *f2.lock().unwrap() += 1;
        });
        timer.set(&mut l, Duration::from_millis(5), Some(Duration::from_millis(5))).unwrap();
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(8));
            l.wait_and_process(Some(Duration::from_millis(5))).unwrap();
        }
        assert!(*fired.lock().unwrap() >= 2);
    }
}
