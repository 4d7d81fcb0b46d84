//! Connection lifecycle primitives built on top of [`crate::reactor`], [`crate::sync`], and
//! [`crate::threadpool`].

pub mod accept;
pub mod client_channel;
pub mod range_reader;

pub use accept::{AcceptServer, AcceptServerConfig, Connection, ConnectionHandler};
pub use client_channel::{ClientChannel, ClientChannelConfig, Status as ClientChannelStatus};
pub use range_reader::{RangeReader, RangeReaderConfig, StaticToken, TokenProvider};
