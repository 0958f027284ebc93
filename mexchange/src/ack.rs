//! Acknowledgment correlation.
//!
//! Every command a wire client sends carries an ack id taken from a
//! per-connection counter. The matching completion waits in an [`AckTable`]
//! until the broker's ACK frame names that id, or until the connection is
//! lost and [`AckTable::fail_all`] completes everything with
//! [`ExchangeError::ConnectionLost`].

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::error::{ExchangeError, ExchangeResult};

pub type AckId = u64;

/// Reserved id meaning "no acknowledgment requested". The broker uses it when
/// forwarding publishes.
pub const NO_ACK: AckId = 0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AckError {
    #[error("acknowledgment for unknown ack id {0}")]
    UnknownAck(AckId),
}

/// Something that can be told how an acknowledged operation ended.
pub trait Completion {
    fn complete(self, result: ExchangeResult<()>);
}

impl Completion for oneshot::Sender<ExchangeResult<()>> {
    fn complete(self, result: ExchangeResult<()>) {
        // A dropped receiver means the caller stopped waiting.
        let _ = self.send(result);
    }
}

#[derive(Debug)]
pub struct AckTable<C> {
    next_id: AckId,
    pending: HashMap<AckId, C>,
}

impl<C> AckTable<C> {
    pub fn new() -> Self {
        Self {
            next_id: NO_ACK + 1,
            pending: HashMap::new(),
        }
    }

    /// Assigns the next id to `completion` and starts tracking it.
    pub fn wrap(&mut self, completion: C) -> AckId {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, completion);
        id
    }

    /// Stops tracking `id` and hands its completion back.
    pub fn take(&mut self, id: AckId) -> Result<C, AckError> {
        self.pending.remove(&id).ok_or(AckError::UnknownAck(id))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<C: Completion> AckTable<C> {
    /// Completes `id` with the outcome carried by an ACK frame.
    pub fn resolve(&mut self, id: AckId, error_code: Option<u8>) -> Result<(), AckError> {
        let completion = self.take(id)?;
        completion.complete(match error_code {
            None => Ok(()),
            Some(code) => Err(ExchangeError::from_code(code)),
        });
        Ok(())
    }

    /// Fails every pending entry with `ConnectionLost`. Returns how many
    /// entries were failed.
    pub fn fail_all(&mut self) -> usize {
        let failed = self.pending.len();
        for (_, completion) in self.pending.drain() {
            completion.complete(Err(ExchangeError::ConnectionLost));
        }
        failed
    }
}

impl<C> Default for AckTable<C> {
    fn default() -> Self {
        Self::new()
    }
}
