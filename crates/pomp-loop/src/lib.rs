//! `mio`-backed event loop, timers, cross-thread events, and a dispatch
//! watchdog, grounded on `pomp_loop.h`/`pomp_timer.h`/`pomp_evt.h`/
//! `pomp_watchdog.h`.

pub mod event;
pub mod event_loop;
pub mod timer;
pub mod watchdog;

pub use event::{Event, EventSignaler};
pub use event_loop::{FdInterest, IdleToken, Loop, LoopWaker, Revents, TimerId};
pub use timer::Timer;
pub use watchdog::Watchdog;
