//! Virtual-time discrete-event simulation core.
//!
//! A [`GlobalClock`](parallel::GlobalClock) advances a virtual time `t` by
//! firing due [`Action`](action::Action)s in time order: one-shot and
//! repeating [events](schedule), periodic [samples](schedule), and
//! [condition](action::Predicate)-gated events, all polled at a cadence that
//! never busy-spins. Long-lived [process](process::ProcessContext)
//! coroutines suspend on `delay`, `wait`, and `now` and are released back
//! onto the clock's own execution context in time order. `fork`ing a clock
//! spreads events and processes across a pool of worker clocks kept within
//! one synchronization window of the master.
//!
//! The free functions in [`api`] are the external interface; most callers
//! should use those rather than reaching into [`parallel`] and [`process`]
//! directly.

pub mod action;
pub mod api;
pub mod clock;
pub mod error;
pub mod parallel;
pub mod process;
pub mod rng;
pub mod schedule;
pub mod time;

pub use action::{Action, Predicate};
pub use clock::{LocalClock, RunReport};
pub use error::{ClockError, ClockException, ClockResult};
pub use parallel::{GlobalClock, ThreadId};
pub use process::ProcessContext;
pub use time::{Resolve, Stochastic, Time};
