//! Message exchange layer for multiplayer game servers.
//!
//! Independently addressable actors publish binary packets to each other by
//! string id, either to one exclusive owner or to every subscriber of a
//! broadcast id. Each module covers one concern:
//!
//! - [`varint`] and [`packet`] define the binary envelope carried by every
//!   message.
//! - [`ack`] correlates requests with the broker's acknowledgments.
//! - [`protocol`] encodes and incrementally decodes wire frames.
//! - [`exchange`] holds the `Exchange` trait and its local, sharded,
//!   local-bypass and TCP implementations.
//! - [`broker`] is the standalone server that wire clients connect to.
//! - [`config`] builds an exchange from a JSON description.
//! - [`cli`] and [`client`] back the `mexchange` binary.
//!
//! Integration tests use this crate directly to exercise the exchanges and
//! the broker over real sockets.

pub mod ack;
pub mod broker;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod exchange;
pub mod packet;
pub mod protocol;
pub mod varint;

pub use config::ExchangeConfig;
pub use error::{ExchangeError, ExchangeResult, FatalError, FatalHook};
pub use exchange::{Delivery, Exchange, Handler, Inbox, SharedExchange};
pub use packet::{Packet, PacketWriter};
