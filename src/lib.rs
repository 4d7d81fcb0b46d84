//! A cooperative-fiber runtime for distributed data-processing tools.
//!
//! This crate provides the concurrency and I/O core that a higher-level pipeline driver, an
//! accept server, a reconnecting client channel, and a streaming object-storage reader are all
//! built on top of:
//!
//! - [`reactor`]: a pool of single-threaded event loops ([`reactor::Reactor`],
//!   [`reactor::pool::ReactorPool`]), each multiplexing many fibers with a nice-level scheduling
//!   policy.
//! - [`sync`]: fiber-safe [`sync::channel::Channel`], one-shot [`sync::done::Done`], and a
//!   fiber-aware [`sync::mutex::Mutex`]/[`sync::mutex::Condvar`] pair.
//! - [`threadpool`]: [`threadpool::FiberQueueThreadPool`], which offloads blocking closures to
//!   worker OS threads without blocking a reactor.
//! - [`net`]: connection lifecycle primitives built on the above:
//!   [`net::accept::AcceptServer`], [`net::client_channel::ClientChannel`], and
//!   [`net::range_reader::RangeReader`].
//!
//! Fibers here are realized as stackless futures driven by a per-reactor executor rather than as
//! OS-stack-switched coroutines; the public contracts stay blocking-style from the caller's point
//! of view.

#![allow(clippy::let_and_return)]

pub mod error;
pub mod reactor;
pub mod sync;
pub mod threadpool;
pub mod net;

pub use error::{Error, Result};
pub use net::{AcceptServer, ClientChannel, Connection, RangeReader};
pub use reactor::pool::ReactorPool;
pub use reactor::Reactor;
pub use sync::channel::Channel;
pub use sync::done::Done;
pub use threadpool::FiberQueueThreadPool;
