//! A single-threaded cooperative fiber runtime.
//!
//! `strand` multiplexes many lightweight fibers onto one OS thread. Fibers
//! are stackful: each one runs on its own guarded stack and blocks by
//! cooperatively yielding to a scheduler, never in the kernel. Descriptor
//! readiness is integrated through epoll, so thousands of logically
//! blocking call sites — reads, accepts, sleeps, lock acquisitions — ride
//! on a single kernel thread, the shape high-fan-out network servers want.
//!
//! The moving parts:
//!
//! - a FIFO scheduler with a dedicated switch context and an idle fiber
//!   that runs the event dispatch when nothing is runnable,
//! - a sleep heap for timed wakeups,
//! - [`poll`], the single primitive that parks a fiber on fd readiness,
//! - [`sync::Cond`] and [`sync::Mutex`] built over the scheduler queues,
//! - a guarded, free-listed stack allocator,
//! - [fiber-local storage](crate::fls) with exit-time destructors.
//!
//! # Example
//!
//! ```no_run
//! fn main() -> Result<(), strand::Error> {
//!     strand::init()?;
//!     let pong = strand::spawn(|| {
//!         strand::sleep(std::time::Duration::from_millis(10)).unwrap();
//!         42u32
//!     })?;
//!     assert_eq!(pong.join()?, 42);
//!     Ok(())
//! }
//! ```
//!
//! # Model
//!
//! Exactly one fiber runs at a time and switches are explicit, so there is
//! no data-race surface and no internal locking; the price is that a fiber
//! that never parks starves everyone else. Cancellation is cooperative:
//! [`interrupt`] makes a parked target's parking call fail with
//! [`Error::Interrupted`], once. All of this is per OS thread; runtimes on
//! different threads are completely independent.

mod arch;
mod error;
mod event;
mod fiber;
pub mod fls;
pub mod net;
mod poll;
mod queue;
mod runtime;
mod slab;
mod sleep;
mod stack;
pub mod sync;
mod time;

pub use error::Error;
pub use fiber::{current, exit, interrupt, spawn, Builder, FiberId, JoinHandle};
pub use poll::{poll, Events, PollFd};
pub use runtime::{fd_limit, init, stats, Stats};
pub use stack::{randomize_stacks, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
pub use time::{
    last_clock_us, now_seconds, now_us, set_time_source, sleep, suspend, time_cache, usleep,
};
