//! Fiber-safe channels and condition primitives.
//!
//! Everything here suspends the calling fiber instead of blocking the reactor's OS thread, and
//! is safe to reach into from plain OS threads as well (see [`done::Done::wait_blocking`]).

pub mod channel;
pub mod done;
pub mod mutex;

pub use channel::Channel;
pub use done::Done;
pub use mutex::{Condvar, Mutex, MutexGuard};
