//! The exchange contract and its implementations.
//!
//! An exchange routes [`Packet`]s by string id. An id is either claimed by
//! one exclusive [`Handler`] (`register`) or carries a list of broadcast
//! subscribers (`subscribe`), never both.
//!
//! Handlers are channels: a [`Handler`] is the sending half and the
//! application drains the paired [`Inbox`]. Delivery is therefore never a
//! call back into application code, so `publish` cannot re-enter its caller
//! no matter which implementation is configured.
//!
//! - [`local::LocalExchange`] keeps everything in-process.
//! - [`hashed::HashedExchange`] shards ids over several exchanges.
//! - [`bypass::LocalBypassExchange`] short-circuits publishes to destinations
//!   registered in this process.
//! - [`wire::WireExchange`] talks to a standalone broker over TCP.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::{error::ExchangeResult, packet::Packet};

pub mod bypass;
pub mod hashed;
pub mod local;
pub mod registry;
pub mod wire;

/// A packet arriving at a registered or subscribed id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub destination: String,
    pub packet: Packet,
}

/// Receiving side of a [`Handler`].
pub type Inbox = mpsc::UnboundedReceiver<Delivery>;

/// Destination for inbound packets.
///
/// Two handlers are the same handler when they feed the same inbox.
#[derive(Debug, Clone)]
pub struct Handler {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Handler {
    /// Creates a handler together with the inbox it feeds.
    pub fn channel() -> (Self, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn same_as(&self, other: &Handler) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// True once the inbox has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queues `packet` for the inbox with its cursor rewound. Returns false
    /// when the inbox is gone.
    pub(crate) fn deliver(&self, destination: &str, mut packet: Packet) -> bool {
        packet.rewind();
        self.tx
            .send(Delivery {
                destination: destination.to_owned(),
                packet,
            })
            .is_ok()
    }
}

/// The exchange contract.
///
/// Every operation is asynchronous and none takes effect before it is
/// awaited. Errors of kind [`ExchangeError::AlreadyExists`] and
/// [`ExchangeError::NotFound`] are ordinary outcomes for the caller to handle.
///
/// [`ExchangeError::AlreadyExists`]: crate::error::ExchangeError::AlreadyExists
/// [`ExchangeError::NotFound`]: crate::error::ExchangeError::NotFound
pub trait Exchange: Send + Sync {
    /// Claims `id` exclusively for `handler`.
    fn register<'a>(&'a self, id: &'a str, handler: Handler) -> BoxFuture<'a, ExchangeResult<()>>;

    /// Releases an exclusive claim.
    fn unregister<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ExchangeResult<()>>;

    /// Adds `handler` to the broadcast list for `id`.
    fn subscribe<'a>(&'a self, id: &'a str, handler: Handler)
        -> BoxFuture<'a, ExchangeResult<()>>;

    /// Swaps the exclusive handler for `id` without a window where the id is
    /// unclaimed. `old` must be the current handler.
    fn replace_message_handler<'a>(
        &'a self,
        id: &'a str,
        old: &'a Handler,
        new: Handler,
    ) -> BoxFuture<'a, ExchangeResult<()>>;

    /// Delivers `packet` to whoever holds `destination`.
    fn publish<'a>(&'a self, destination: &'a str, packet: Packet)
        -> BoxFuture<'a, ExchangeResult<()>>;
}

pub type SharedExchange = Arc<dyn Exchange>;

impl<E: Exchange + ?Sized> Exchange for Arc<E> {
    fn register<'a>(&'a self, id: &'a str, handler: Handler) -> BoxFuture<'a, ExchangeResult<()>> {
        (**self).register(id, handler)
    }

    fn unregister<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ExchangeResult<()>> {
        (**self).unregister(id)
    }

    fn subscribe<'a>(
        &'a self,
        id: &'a str,
        handler: Handler,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        (**self).subscribe(id, handler)
    }

    fn replace_message_handler<'a>(
        &'a self,
        id: &'a str,
        old: &'a Handler,
        new: Handler,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        (**self).replace_message_handler(id, old, new)
    }

    fn publish<'a>(
        &'a self,
        destination: &'a str,
        packet: Packet,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        (**self).publish(destination, packet)
    }
}
