//! TCP client for the standalone broker.
//!
//! [`WireExchange::connect`] returns at once and spawns a driver task that
//! owns the socket, the ack table and the local registry. Requests reach the
//! driver through an unbounded queue, so anything issued while the driver
//! is still connecting is held there and flushed in submission order once the
//! connection is ready.
//!
//! The client never reconnects. Running out of connect attempts, losing the
//! socket, or receiving anything the protocol does not allow goes to the
//! [`FatalHook`]. Re-registering every destination after a reconnect could
//! deliver to two owners at once; restarting the process cannot.

use futures::future::BoxFuture;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
    sync::{mpsc, oneshot},
    time::{sleep, timeout},
};
use tracing::{debug, info, trace, warn};

use super::{registry::Registry, Exchange, Handler};
use crate::{
    ack::{AckId, AckTable, Completion},
    config::{RetryPolicy, WireConfig},
    error::{ExchangeError, ExchangeResult, FatalError, FatalHook},
    packet::{Packet, PacketError},
    protocol::{Frame, FrameDecoder, WireError},
};

const READ_CHUNK: usize = 8 * 1024;

type Reply = oneshot::Sender<ExchangeResult<()>>;

#[derive(Debug)]
enum Request {
    Register {
        id: String,
        handler: Handler,
        reply: Reply,
    },
    Unregister {
        id: String,
        reply: Reply,
    },
    Subscribe {
        id: String,
        handler: Handler,
        reply: Reply,
    },
    Replace {
        id: String,
        old: Handler,
        new: Handler,
        reply: Reply,
    },
    Publish {
        id: String,
        packet: Packet,
        reply: Reply,
    },
}

/// Handle to a broker connection. Dropping the last handle closes it.
#[derive(Debug, Clone)]
pub struct WireExchange {
    requests: mpsc::UnboundedSender<Request>,
}

impl WireExchange {
    /// Spawns the driver and starts connecting to `config.addr()`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(config: WireConfig, fatal: FatalHook) -> Self {
        let (requests, queue) = mpsc::unbounded_channel();
        tokio::spawn(drive(config, queue, fatal));
        Self { requests }
    }

    async fn submit(
        &self,
        request: Request,
        reply: oneshot::Receiver<ExchangeResult<()>>,
    ) -> ExchangeResult<()> {
        if self.requests.send(request).is_err() {
            return Err(ExchangeError::ConnectionLost);
        }
        reply.await.unwrap_or(Err(ExchangeError::ConnectionLost))
    }
}

impl Exchange for WireExchange {
    fn register<'a>(&'a self, id: &'a str, handler: Handler) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            let (reply, rx) = oneshot::channel();
            let id = id.to_owned();
            self.submit(Request::Register { id, handler, reply }, rx)
                .await
        })
    }

    fn unregister<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            let (reply, rx) = oneshot::channel();
            let id = id.to_owned();
            self.submit(Request::Unregister { id, reply }, rx).await
        })
    }

    fn subscribe<'a>(
        &'a self,
        id: &'a str,
        handler: Handler,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            let (reply, rx) = oneshot::channel();
            let id = id.to_owned();
            self.submit(Request::Subscribe { id, handler, reply }, rx)
                .await
        })
    }

    fn replace_message_handler<'a>(
        &'a self,
        id: &'a str,
        old: &'a Handler,
        new: Handler,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            let (reply, rx) = oneshot::channel();
            let request = Request::Replace {
                id: id.to_owned(),
                old: old.clone(),
                new,
                reply,
            };
            self.submit(request, rx).await
        })
    }

    fn publish<'a>(
        &'a self,
        destination: &'a str,
        packet: Packet,
    ) -> BoxFuture<'a, ExchangeResult<()>> {
        Box::pin(async move {
            let (reply, rx) = oneshot::channel();
            let request = Request::Publish {
                id: destination.to_owned(),
                packet,
                reply,
            };
            self.submit(request, rx).await
        })
    }
}

/// Registry change applied once the broker acknowledges it.
#[derive(Debug)]
enum Effect {
    None,
    Register(String, Handler),
    Subscribe(String, Handler),
    Unregister(String),
}

#[derive(Debug)]
struct PendingOp {
    effect: Effect,
    reply: Reply,
}

impl Completion for PendingOp {
    fn complete(self, result: ExchangeResult<()>) {
        self.reply.complete(result);
    }
}

async fn drive(
    config: WireConfig,
    mut queue: mpsc::UnboundedReceiver<Request>,
    fatal: FatalHook,
) {
    let addr = config.addr();
    let stream = match connect_with_retry(&addr, &config.retry).await {
        Ok(stream) => stream,
        Err(err) => {
            fatal.invoke(&err);
            fail_queued(&mut queue);
            return;
        }
    };

    let mut session = Session::new(addr, stream);
    let outcome = session.run(&mut queue).await;
    let failed = session.acks.fail_all();

    match outcome {
        Ok(()) => debug!(addr = %session.addr, "exchange dropped, closing broker connection"),
        Err(err) => {
            warn!(addr = %session.addr, failed, "broker session ended");
            fatal.invoke(&err);
        }
    }
    fail_queued(&mut queue);
}

/// Connects with bounded retries, sleeping per the policy between attempts.
async fn connect_with_retry(addr: &str, policy: &RetryPolicy) -> Result<TcpStream, FatalError> {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match timeout(policy.connect_timeout(), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(error = %err, "failed to disable nagle");
                }
                info!(%addr, attempt, "connected to broker");
                return Ok(stream);
            }
            Ok(Err(err)) => {
                warn!(%addr, attempt, error = %err, "broker connect attempt failed");
                last_error = err.to_string();
            }
            Err(_) => {
                warn!(%addr, attempt, "broker connect attempt timed out");
                last_error = format!("timed out after {:?}", policy.connect_timeout());
            }
        }

        if attempt < attempts {
            sleep(policy.delay_after(attempt)).await;
        }
    }

    Err(FatalError::ConnectExhausted {
        addr: addr.to_owned(),
        attempts,
        last_error,
    })
}

fn fail_queued(queue: &mut mpsc::UnboundedReceiver<Request>) {
    queue.close();
    while let Ok(request) = queue.try_recv() {
        let reply = match request {
            Request::Register { reply, .. }
            | Request::Unregister { reply, .. }
            | Request::Subscribe { reply, .. }
            | Request::Replace { reply, .. }
            | Request::Publish { reply, .. } => reply,
        };
        reply.complete(Err(ExchangeError::ConnectionLost));
    }
}

struct Session {
    addr: String,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    decoder: FrameDecoder,
    acks: AckTable<PendingOp>,
    registry: Registry,
}

impl Session {
    fn new(addr: String, stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            addr,
            reader,
            writer,
            decoder: FrameDecoder::new(),
            acks: AckTable::new(),
            registry: Registry::new(),
        }
    }

    /// Pumps requests and inbound frames until every handle is dropped
    /// (`Ok`) or something fatal happens (`Err`).
    async fn run(
        &mut self,
        queue: &mut mpsc::UnboundedReceiver<Request>,
    ) -> Result<(), FatalError> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            select! {
                request = queue.recv() => match request {
                    Some(request) => self.handle_request(request).await?,
                    None => return Ok(()),
                },
                read = self.reader.read(&mut chunk) => {
                    let read = read.map_err(|err| self.connection_failed(err.to_string()))?;
                    if read == 0 {
                        return Err(self.connection_failed("broker closed the connection".into()));
                    }
                    for frame in self.decoder.push(&chunk[..read])? {
                        self.handle_frame(frame)?;
                    }
                }
            }
        }
    }

    async fn handle_request(&mut self, request: Request) -> Result<(), FatalError> {
        let frame = match request {
            Request::Replace { id, old, new, reply } => {
                reply.complete(self.registry.replace(&id, &old, new));
                return Ok(());
            }
            Request::Register { id, handler, reply } => {
                let ack = self.track(Effect::Register(id.clone(), handler), reply);
                Frame::Register { ack, id }
            }
            Request::Subscribe { id, handler, reply } => {
                let ack = self.track(Effect::Subscribe(id.clone(), handler), reply);
                Frame::Subscribe { ack, id }
            }
            Request::Unregister { id, reply } => {
                let ack = self.track(Effect::Unregister(id.clone()), reply);
                Frame::Unregister { ack, id }
            }
            Request::Publish { id, packet, reply } => {
                let ack = self.track(Effect::None, reply);
                let payload = packet.as_bytes().clone();
                Frame::Publish { ack, id, payload }
            }
        };
        self.send(frame).await
    }

    fn track(&mut self, effect: Effect, reply: Reply) -> AckId {
        self.acks.wrap(PendingOp { effect, reply })
    }

    async fn send(&mut self, frame: Frame) -> Result<(), FatalError> {
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(error = %err, "rejecting unencodable command");
                let result = match err {
                    // An id that cannot be encoded has no owner on the broker.
                    WireError::Malformed(PacketError::NonAnsiChar(_)) => {
                        Err(ExchangeError::NotFound)
                    }
                    WireError::FrameTooLarge(length) => {
                        Err(ExchangeError::FrameTooLarge(length))
                    }
                    other => return Err(other.into()),
                };
                if let Ok(pending) = self.acks.take(frame.ack_id()) {
                    pending.complete(result);
                }
                return Ok(());
            }
        };

        trace!(command = ?frame.command(), ack = frame.ack_id(), "sending frame");
        self.writer
            .write_all(&bytes)
            .await
            .map_err(|err| self.connection_failed(err.to_string()))
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), FatalError> {
        match frame {
            Frame::Ack { ack, error } => {
                let pending = self.acks.take(ack)?;
                let result = match error {
                    None => self.apply(pending.effect),
                    Some(code) => Err(ExchangeError::from_code(code)),
                };
                pending.reply.complete(result);
                Ok(())
            }
            Frame::Publish { id, payload, .. } => {
                if let Err(err) = self.registry.dispatch(&id, Packet::from_bytes(payload)) {
                    debug!(%id, error = %err, "dropping publish for unknown destination");
                }
                Ok(())
            }
            other => Err(WireError::UnexpectedCommand(other.command()).into()),
        }
    }

    /// Mirrors an acknowledged change into the local registry. The broker
    /// already accepted it, so the mirror cannot disagree.
    fn apply(&mut self, effect: Effect) -> ExchangeResult<()> {
        match effect {
            Effect::None => Ok(()),
            Effect::Register(id, handler) => self.registry.register(&id, handler),
            Effect::Subscribe(id, handler) => self.registry.subscribe(&id, handler),
            Effect::Unregister(id) => self.registry.unregister(&id).map(drop),
        }
    }

    fn connection_failed(&self, reason: String) -> FatalError {
        FatalError::ConnectionFailed {
            addr: self.addr.clone(),
            reason,
        }
    }
}
