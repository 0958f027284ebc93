//! Standalone broker for wire exchange clients.
//!
//! The broker owns two tables: exclusive claims (`id → connection`) and
//! broadcast subscriptions (`id → [connection]`). Each accepted socket gets a
//! reader task that decodes frames and applies them to the tables, and a
//! writer task that drains the connection's outbox.
//!
//! Every frame already read from a socket is processed before that
//! connection's registrations are removed; a trailing partial frame is
//! discarded when the socket closes.

use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    select,
    sync::{mpsc, Mutex},
};
use tracing::{debug, info, trace, warn};

use crate::{
    ack::{AckId, NO_ACK},
    error::{ExchangeError, ExchangeResult, FatalError, FatalHook},
    protocol::{CommandCode, Frame, FrameDecoder, WireError},
};

type ConnectionId = u64;
type Outbox = mpsc::UnboundedSender<Bytes>;

const READ_CHUNK: usize = 8 * 1024;

pub struct Broker {
    listener: TcpListener,
    state: Arc<BrokerState>,
    fatal: FatalHook,
}

impl Broker {
    pub fn new(listener: TcpListener) -> Self {
        Self::with_fatal_hook(listener, FatalHook::default())
    }

    pub fn with_fatal_hook(listener: TcpListener, fatal: FatalHook) -> Self {
        Self {
            listener,
            state: Arc::new(BrokerState::new()),
            fatal,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker {
            listener,
            state,
            fatal,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("broker shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &fatal);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<BrokerState>,
    fatal: &FatalHook,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state, fatal),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<BrokerState>,
    fatal: &FatalHook,
) {
    let state = Arc::clone(state);
    let fatal = fatal.clone();
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, &state).await {
            warn!(peer = %peer, error = %err, "client sent an invalid frame");
            fatal.invoke(&FatalError::Protocol(err));
        }
    });
}

/// Registration tables shared by every connection handler.
pub struct BrokerState {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Tables {
    outboxes: HashMap<ConnectionId, Outbox>,
    exclusive: HashMap<String, ConnectionId>,
    broadcast: HashMap<String, Vec<ConnectionId>>,
}

impl Tables {
    fn send(&self, connection: ConnectionId, bytes: Bytes) {
        match self.outboxes.get(&connection) {
            Some(outbox) => {
                if outbox.send(bytes).is_err() {
                    debug!(connection, "outbox closed, dropping frame");
                }
            }
            None => debug!(connection, "no outbox for connection"),
        }
    }

    fn ack(&self, connection: ConnectionId, ack: AckId, result: ExchangeResult<()>) {
        if ack == NO_ACK {
            return;
        }
        let frame = Frame::Ack {
            ack,
            error: result.err().and_then(|err| err.code()),
        };
        match frame.encode() {
            Ok(bytes) => self.send(connection, bytes),
            Err(err) => warn!(error = %err, "failed to encode ack"),
        }
    }

    fn register(&mut self, connection: ConnectionId, id: String) -> ExchangeResult<()> {
        if self.exclusive.contains_key(&id) || self.broadcast.contains_key(&id) {
            return Err(ExchangeError::AlreadyExists);
        }
        self.exclusive.insert(id, connection);
        Ok(())
    }

    fn unregister(&mut self, connection: ConnectionId, id: &str) -> ExchangeResult<()> {
        match self.exclusive.get(id) {
            Some(owner) if *owner == connection => {
                self.exclusive.remove(id);
                Ok(())
            }
            _ => Err(ExchangeError::NotFound),
        }
    }

    fn subscribe(&mut self, connection: ConnectionId, id: String) -> ExchangeResult<()> {
        if self.exclusive.contains_key(&id) {
            return Err(ExchangeError::AlreadyExists);
        }
        let subscribers = self.broadcast.entry(id).or_default();
        if !subscribers.contains(&connection) {
            subscribers.push(connection);
        }
        Ok(())
    }

    fn publish(&self, id: &str, payload: Bytes) -> Result<(), WireError> {
        let recipients: Vec<ConnectionId> = match self.broadcast.get(id) {
            Some(subscribers) => subscribers.clone(),
            None => match self.exclusive.get(id) {
                Some(owner) => vec![*owner],
                None => return Ok(()),
            },
        };

        // One encoding, shared by every recipient.
        let bytes = Frame::Publish {
            ack: NO_ACK,
            id: id.to_owned(),
            payload,
        }
        .encode()?;
        for connection in recipients {
            self.send(connection, bytes.clone());
        }
        Ok(())
    }

    fn routable(&self, id: &str) -> bool {
        self.broadcast.contains_key(id) || self.exclusive.contains_key(id)
    }

    fn remove_connection(&mut self, connection: ConnectionId) -> usize {
        self.outboxes.remove(&connection);

        let before = self.exclusive.len();
        self.exclusive.retain(|_, owner| *owner != connection);
        let mut removed = before - self.exclusive.len();

        self.broadcast.retain(|_, subscribers| {
            let len = subscribers.len();
            subscribers.retain(|subscriber| *subscriber != connection);
            removed += len - subscribers.len();
            !subscribers.is_empty()
        });
        removed
    }
}

impl BrokerState {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn connect(&self, outbox: Outbox) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tables.lock().await.outboxes.insert(id, outbox);
        id
    }

    async fn disconnect(&self, connection: ConnectionId) -> usize {
        self.tables.lock().await.remove_connection(connection)
    }

    /// Applies one client frame. Acks are queued while the tables are locked,
    /// so a client always sees the ACK for a registration before any publish
    /// routed through it.
    async fn apply(&self, connection: ConnectionId, frame: Frame) -> Result<(), WireError> {
        let mut tables = self.tables.lock().await;
        match frame {
            Frame::Register { ack, id } => {
                let result = tables.register(connection, id);
                tables.ack(connection, ack, result);
            }
            Frame::Unregister { ack, id } => {
                let result = tables.unregister(connection, &id);
                tables.ack(connection, ack, result);
            }
            Frame::Subscribe { ack, id } => {
                let result = tables.subscribe(connection, id);
                tables.ack(connection, ack, result);
            }
            Frame::Publish { ack, id, payload } => {
                let result = if tables.routable(&id) {
                    tables.publish(&id, payload)?;
                    Ok(())
                } else {
                    Err(ExchangeError::NotFound)
                };
                tables.ack(connection, ack, result);
            }
            Frame::Ack { .. } => return Err(WireError::UnexpectedCommand(CommandCode::Ack)),
        }
        Ok(())
    }

    /// Ids claimed exclusively and ids with subscribers.
    pub async fn counts(&self) -> (usize, usize) {
        let tables = self.tables.lock().await;
        (tables.exclusive.len(), tables.broadcast.len())
    }
}

impl Default for BrokerState {
    fn default() -> Self {
        Self::new()
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: &BrokerState,
) -> Result<(), WireError> {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(error = %err, "failed to disable nagle");
    }
    let (mut reader, writer) = stream.into_split();
    let (outbox, queued) = mpsc::unbounded_channel();
    let connection = state.connect(outbox).await;
    info!(%peer, connection, "client connected");

    let writer_task = tokio::spawn(drain_outbox(writer, queued, connection));
    let outcome = read_frames(&mut reader, state, connection).await;

    let removed = state.disconnect(connection).await;
    info!(%peer, connection, removed, "client disconnected");
    // The outbox sender is gone with the connection entry, so the writer
    // finishes once it has flushed what was queued.
    let _ = writer_task.await;
    outcome
}

async fn read_frames(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    state: &BrokerState,
    connection: ConnectionId,
) -> Result<(), WireError> {
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                debug!(connection, error = %err, "read failed");
                break;
            }
        };
        for frame in decoder.push(&chunk[..read])? {
            trace!(connection, command = ?frame.command(), ack = frame.ack_id(), "frame");
            state.apply(connection, frame).await?;
        }
    }

    if decoder.buffered() > 0 {
        debug!(connection, bytes = decoder.buffered(), "discarding partial frame");
    }
    Ok(())
}

async fn drain_outbox(
    mut writer: OwnedWriteHalf,
    mut queued: mpsc::UnboundedReceiver<Bytes>,
    connection: ConnectionId,
) {
    while let Some(bytes) = queued.recv().await {
        if let Err(err) = writer.write_all(&bytes).await {
            debug!(connection, error = %err, "write failed, dropping outbox");
            return;
        }
    }
    if let Err(err) = writer.shutdown().await {
        debug!(connection, error = %err, "failed to shut down writer cleanly");
    }
}
