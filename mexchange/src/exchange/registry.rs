//! Id → handler table shared by the in-process exchanges and the wire client.

use std::collections::HashMap;

use tracing::debug;

use super::Handler;
use crate::{
    error::{ExchangeError, ExchangeResult},
    packet::Packet,
};

#[derive(Debug)]
enum Entry {
    Exclusive(Handler),
    Broadcast(Vec<Handler>),
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `id`. Fails if it is registered or has subscribers.
    pub fn register(&mut self, id: &str, handler: Handler) -> ExchangeResult<()> {
        if self.entries.contains_key(id) {
            return Err(ExchangeError::AlreadyExists);
        }
        self.entries.insert(id.to_owned(), Entry::Exclusive(handler));
        Ok(())
    }

    /// Drops an exclusive claim and returns its handler.
    pub fn unregister(&mut self, id: &str) -> ExchangeResult<Handler> {
        match self.entries.remove(id) {
            Some(Entry::Exclusive(handler)) => Ok(handler),
            Some(broadcast) => {
                self.entries.insert(id.to_owned(), broadcast);
                Err(ExchangeError::NotFound)
            }
            None => Err(ExchangeError::NotFound),
        }
    }

    /// Appends a broadcast subscriber. Fails only if `id` is claimed exclusively.
    pub fn subscribe(&mut self, id: &str, handler: Handler) -> ExchangeResult<()> {
        match self
            .entries
            .entry(id.to_owned())
            .or_insert_with(|| Entry::Broadcast(Vec::new()))
        {
            Entry::Broadcast(subscribers) => {
                subscribers.retain(|subscriber| !subscriber.is_closed());
                subscribers.push(handler);
                Ok(())
            }
            Entry::Exclusive(_) => Err(ExchangeError::AlreadyExists),
        }
    }

    pub fn replace(&mut self, id: &str, old: &Handler, new: Handler) -> ExchangeResult<()> {
        match self.entries.get_mut(id) {
            Some(Entry::Exclusive(current)) if current.same_as(old) => {
                *current = new;
                Ok(())
            }
            Some(Entry::Exclusive(_)) => Err(ExchangeError::HandlerMismatch),
            _ => Err(ExchangeError::NotFound),
        }
    }

    pub fn is_registered(&self, id: &str) -> bool {
        matches!(self.entries.get(id), Some(Entry::Exclusive(_)))
    }

    /// The exclusive handler for `id`, if any.
    pub fn handler(&self, id: &str) -> Option<&Handler> {
        match self.entries.get(id) {
            Some(Entry::Exclusive(handler)) => Some(handler),
            _ => None,
        }
    }

    pub fn subscriber_count(&self, id: &str) -> usize {
        match self.entries.get(id) {
            Some(Entry::Broadcast(subscribers)) => subscribers.len(),
            _ => 0,
        }
    }

    /// Routes `packet` to `id`. Every subscriber gets its own clone; an
    /// exclusive handler gets the packet itself. Returns how many inboxes
    /// accepted it.
    ///
    /// Subscribers whose inbox is gone are dropped from the list, and a
    /// broadcast id left with none is forgotten.
    pub fn dispatch(&mut self, id: &str, packet: Packet) -> ExchangeResult<usize> {
        match self.entries.get_mut(id) {
            Some(Entry::Exclusive(handler)) => {
                if handler.deliver(id, packet) {
                    Ok(1)
                } else {
                    debug!(%id, "inbox closed, dropping packet");
                    Ok(0)
                }
            }
            Some(Entry::Broadcast(subscribers)) => {
                let before = subscribers.len();
                subscribers.retain(|handler| handler.deliver(id, packet.clone()));
                let delivered = subscribers.len();
                if delivered < before {
                    debug!(%id, closed = before - delivered, "pruned closed inboxes");
                }
                if subscribers.is_empty() {
                    self.entries.remove(id);
                }
                Ok(delivered)
            }
            None => Err(ExchangeError::NotFound),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
