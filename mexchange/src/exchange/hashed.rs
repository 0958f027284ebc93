//! Sharding façade.
//!
//! Each id is pinned to one of a fixed list of exchanges by a 32-bit string
//! hash: `shard = hash(id) * shard_count / 2^32`. The list never changes
//! after construction, so an id never moves.

use futures::future::BoxFuture;

use super::{Exchange, Handler, SharedExchange};
use crate::{config::ConfigError, error::ExchangeResult, packet::Packet};

const FNV_OFFSET: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a over the id's character codes with a murmur3 finalizer on top.
pub fn hash_id(id: &str) -> u32 {
    let mut hash = FNV_OFFSET;
    for ch in id.chars() {
        hash ^= u32::from(ch);
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85EB_CA6B);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xC2B2_AE35);
    hash ^ (hash >> 16)
}

/// Scales a hash onto `0..shard_count`.
pub fn shard_index(hash: u32, shard_count: usize) -> usize {
    ((u64::from(hash) * shard_count as u64) >> 32) as usize
}

pub struct HashedExchange {
    shards: Vec<SharedExchange>,
}

impl HashedExchange {
    pub fn new(shards: Vec<SharedExchange>) -> Result<Self, ConfigError> {
        if shards.is_empty() {
            return Err(ConfigError::NoShards);
        }
        Ok(Self { shards })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_index_for(&self, id: &str) -> usize {
        shard_index(hash_id(id), self.shards.len())
    }

    pub fn shard_for(&self, id: &str) -> &SharedExchange {
        &self.shards[self.shard_index_for(id)]
    }
}

impl Exchange for HashedExchange {
    fn register<'a>(&'a self, id: &'a str, handler: Handler) -> BoxFuture<'a, ExchangeResult<()>> {
        self.shard_for(id).register(id, handler)
    }

    fn unregister<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ExchangeResult<()>> {
        self.shard_for(id).unregister(id)
    }

    fn subscribe<'a>(
        &'a self,
        id: &'a str,
        handler: Handler,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        self.shard_for(id).subscribe(id, handler)
    }

    fn replace_message_handler<'a>(
        &'a self,
        id: &'a str,
        old: &'a Handler,
        new: Handler,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        self.shard_for(id).replace_message_handler(id, old, new)
    }

    fn publish<'a>(
        &'a self,
        destination: &'a str,
        packet: Packet,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        self.shard_for(destination).publish(destination, packet)
    }
}
