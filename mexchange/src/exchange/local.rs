//! In-process exchange.
//!
//! No I/O happens here, yet every operation yields to the scheduler before
//! touching the registry. Code written against this exchange therefore sees
//! the same "effects happen later" timing it would see over the wire.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::{sync::Mutex, task::yield_now};
use tracing::trace;

use super::{registry::Registry, Exchange, Handler};
use crate::{error::ExchangeResult, packet::Packet};

#[derive(Debug, Clone, Default)]
pub struct LocalExchange {
    registry: Arc<Mutex<Registry>>,
}

impl LocalExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids currently registered or subscribed.
    pub async fn len(&self) -> usize {
        self.registry.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.lock().await.is_empty()
    }
}

impl Exchange for LocalExchange {
    fn register<'a>(&'a self, id: &'a str, handler: Handler) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            yield_now().await;
            self.registry.lock().await.register(id, handler)
        })
    }

    fn unregister<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            yield_now().await;
            self.registry.lock().await.unregister(id).map(drop)
        })
    }

    fn subscribe<'a>(
        &'a self,
        id: &'a str,
        handler: Handler,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            yield_now().await;
            self.registry.lock().await.subscribe(id, handler)
        })
    }

    fn replace_message_handler<'a>(
        &'a self,
        id: &'a str,
        old: &'a Handler,
        new: Handler,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            yield_now().await;
            self.registry.lock().await.replace(id, old, new)
        })
    }

    fn publish<'a>(
        &'a self,
        destination: &'a str,
        packet: Packet,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            yield_now().await;
            let delivered = self.registry.lock().await.dispatch(destination, packet)?;
            trace!(%destination, delivered, "local publish");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;
    use crate::error::ExchangeError;

    #[tokio::test]
    async fn operations_do_not_complete_on_first_poll() {
        let exchange = LocalExchange::new();
        let (handler, mut inbox) = Handler::channel();

        let mut register = exchange.register("unit.7", handler);
        assert!((&mut register).now_or_never().is_none());
        register.await.unwrap();

        let mut publish = exchange.publish("unit.7", Packet::from_string("move"));
        assert!((&mut publish).now_or_never().is_none());
        assert!(inbox.try_recv().is_err());

        publish.await.unwrap();
        assert_eq!(
            inbox.recv().await.unwrap().packet,
            Packet::from_string("move")
        );
    }

    #[tokio::test]
    async fn unregister_of_unknown_id_is_not_found() {
        let exchange = LocalExchange::new();
        assert_eq!(
            exchange.unregister("ghost").await,
            Err(ExchangeError::NotFound)
        );
        assert!(exchange.is_empty().await);
    }
}
