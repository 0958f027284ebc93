//! Local-bypass façade.
//!
//! Mirrors the exclusive registrations made through it. A publish aimed at a
//! mirrored id is handed straight to the local inbox, skipping encoding and
//! the network round trip, unless the packet is flagged `no_local_bypass`.
//! Subscriptions are never mirrored: other processes may be subscribed to
//! the same id, so broadcasts always go through the real exchange.

use futures::future::BoxFuture;
use tokio::{sync::Mutex, task::yield_now};
use tracing::trace;

use super::{registry::Registry, Exchange, Handler, SharedExchange};
use crate::{
    error::{ExchangeError, ExchangeResult},
    packet::Packet,
};

pub struct LocalBypassExchange {
    actual: SharedExchange,
    local: Mutex<Registry>,
}

impl LocalBypassExchange {
    pub fn new(actual: SharedExchange) -> Self {
        Self {
            actual,
            local: Mutex::new(Registry::new()),
        }
    }

    pub async fn is_local(&self, id: &str) -> bool {
        self.local.lock().await.is_registered(id)
    }
}

impl Exchange for LocalBypassExchange {
    fn register<'a>(&'a self, id: &'a str, handler: Handler) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            self.actual.register(id, handler.clone()).await?;
            self.local.lock().await.register(id, handler)
        })
    }

    fn unregister<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            // Ids registered elsewhere are not mirrored; only the real
            // exchange can judge those.
            match self.local.lock().await.unregister(id) {
                Ok(_) | Err(ExchangeError::NotFound) => {}
                Err(other) => return Err(other),
            }
            self.actual.unregister(id).await
        })
    }

    fn subscribe<'a>(
        &'a self,
        id: &'a str,
        handler: Handler,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        self.actual.subscribe(id, handler)
    }

    fn replace_message_handler<'a>(
        &'a self,
        id: &'a str,
        old: &'a Handler,
        new: Handler,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            self.actual
                .replace_message_handler(id, old, new.clone())
                .await?;
            let mut local = self.local.lock().await;
            if local.is_registered(id) {
                local.replace(id, old, new)?;
            }
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        destination: &'a str,
        packet: Packet,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            if !packet.no_local_bypass() {
                let handler = self.local.lock().await.handler(destination).cloned();
                if let Some(handler) = handler {
                    yield_now().await;
                    trace!(%destination, "bypassing transport for local destination");
                    handler.deliver(destination, packet);
                    return Ok(());
                }
            }
            self.actual.publish(destination, packet).await
        })
    }
}
