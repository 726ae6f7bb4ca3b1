//! Broker-queue transport (`broker://host:port/<exchange>/<queue>`).
//!
//! The [`Broker`] is a small standalone message router. Every endpoint holds
//! one TCP connection to it and declares the queue it consumes from:
//!
//! - a bound endpoint consumes the named queue of its address (shared, so
//!   several servers may split the load round-robin);
//! - a connected endpoint consumes an exclusive queue named after its
//!   identity, and stamps that name as `reply_to` on everything it publishes.
//!
//! The bound side remembers the `reply_to` of the delivery it received last and
//! publishes its next message there.
//!
//! An endpoint whose broker connection breaks dials again and re-declares its
//! queue on the next `send` or `receive`.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::error::ChannelError;

use super::{
    connect_within, wait_for, Channel, ChannelAddress, Role, DEFAULT_CHANNEL_TIMEOUT,
    DEFAULT_CONNECT_TIMEOUT, MAX_MESSAGE_SIZE,
};

/// Room reserved in each frame for the envelope around a payload, so payloads
/// up to [`MAX_MESSAGE_SIZE`] travel the broker like any stream transport.
const FRAME_OVERHEAD: usize = 64 * 1024;

/// Messages held for a queue without consumers before the oldest are dropped.
pub const MAX_BACKLOG: usize = 4096;

// =============================================================================
// Wire frames
// =============================================================================

/// Frames exchanged between endpoints and the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerFrame {
    /// Subscribe this connection to a queue, creating it if needed
    Declare {
        exchange: String,
        queue: String,
        exclusive: bool,
    },

    /// The broker accepted a `Declare`
    Declared { exchange: String, queue: String },

    /// The broker refused a `Declare`
    Rejected { reason: String },

    /// Route a message to the queue named by `routing_key`
    Publish {
        exchange: String,
        routing_key: String,
        reply_to: Option<String>,
        payload: Vec<u8>,
    },

    /// A message delivered from a queue this connection consumes
    Deliver {
        exchange: String,
        queue: String,
        reply_to: Option<String>,
        payload: Vec<u8>,
    },
}

impl BrokerFrame {
    fn encode(&self) -> Result<Bytes, ChannelError> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| ChannelError::Transport(format!("encode broker frame: {e}")))
    }

    fn decode(bytes: &[u8]) -> Result<Self, ChannelError> {
        bincode::deserialize(bytes)
            .map_err(|e| ChannelError::Transport(format!("decode broker frame: {e}")))
    }
}

type FramedTcp = Framed<TcpStream, LengthDelimitedCodec>;

fn broker_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_MESSAGE_SIZE + FRAME_OVERHEAD)
        .new_codec()
}

// =============================================================================
// Broker
// =============================================================================

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type QueueKey = (String, String);

#[derive(Default)]
struct Queue {
    consumers: Vec<u64>,
    next: usize,
    backlog: VecDeque<BrokerFrame>,
    exclusive_owner: Option<u64>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<QueueKey, Queue>,
    connections: HashMap<u64, mpsc::UnboundedSender<Bytes>>,
}

impl BrokerState {
    /// Subscribe `conn` to a queue. Returns the frames to send back, in order:
    /// the acknowledgement, then anything published while nobody was listening.
    fn declare(
        &mut self,
        conn: u64,
        exchange: String,
        queue: String,
        exclusive: bool,
    ) -> Vec<BrokerFrame> {
        let key = (exchange.clone(), queue.clone());
        let entry = self.queues.entry(key).or_default();

        if let Some(owner) = entry.exclusive_owner {
            if owner != conn {
                return vec![BrokerFrame::Rejected {
                    reason: format!("queue {exchange}/{queue} is exclusive to another connection"),
                }];
            }
        }
        if exclusive {
            if !entry.consumers.is_empty() && entry.consumers != [conn] {
                return vec![BrokerFrame::Rejected {
                    reason: format!("queue {exchange}/{queue} already has consumers"),
                }];
            }
            entry.exclusive_owner = Some(conn);
        }
        if !entry.consumers.contains(&conn) {
            entry.consumers.push(conn);
        }

        let mut replies = Vec::with_capacity(entry.backlog.len() + 1);
        replies.push(BrokerFrame::Declared { exchange, queue });
        replies.extend(entry.backlog.drain(..));
        replies
    }

    fn publish(
        &mut self,
        exchange: String,
        routing_key: String,
        reply_to: Option<String>,
        payload: Vec<u8>,
    ) {
        let key = (exchange, routing_key);
        let Some(queue) = self.queues.get_mut(&key) else {
            debug!(exchange = %key.0, queue = %key.1, "Dropping message for unknown queue");
            return;
        };

        let frame = BrokerFrame::Deliver {
            exchange: key.0.clone(),
            queue: key.1.clone(),
            reply_to,
            payload,
        };
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Dropping unencodable delivery");
                return;
            }
        };

        while !queue.consumers.is_empty() {
            let slot = queue.next % queue.consumers.len();
            queue.next = slot + 1;
            let consumer = queue.consumers[slot];
            match self.connections.get(&consumer) {
                Some(tx) if tx.send(bytes.clone()).is_ok() => return,
                _ => {
                    queue.consumers.remove(slot);
                }
            }
        }
        queue.backlog.push_back(frame);
        if queue.backlog.len() > MAX_BACKLOG {
            queue.backlog.pop_front();
            warn!(
                exchange = %key.0,
                queue = %key.1,
                limit = MAX_BACKLOG,
                "Queue backlog full, dropped the oldest message"
            );
        }
    }

    fn disconnect(&mut self, conn: u64) {
        self.connections.remove(&conn);
        self.queues.retain(|_, queue| {
            queue.consumers.retain(|c| *c != conn);
            queue.exclusive_owner != Some(conn)
        });
    }
}

/// A minimal message broker with exchanges, named queues and reply-to routing.
#[derive(Clone, Default)]
pub struct Broker {
    state: Arc<Mutex<BrokerState>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `addr` and serve in a background task.
    ///
    /// Returns the resolved listen address (useful when binding port 0).
    pub async fn spawn(addr: &str) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let broker = Broker::new();
        let handle = tokio::spawn(async move { broker.serve(listener).await });
        Ok((local, handle))
    }

    /// Accept connections until the task is cancelled. Cancelling also hangs
    /// up on every connected endpoint.
    pub async fn serve(&self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, "Broker listening");
        }
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let broker = self.clone();
                        connections.spawn(async move { broker.handle_connection(stream, peer).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "Broker accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }

    /// Number of live queues.
    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let conn = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (mut sink, mut frames) = Framed::new(stream, broker_codec()).split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        self.lock().connections.insert(conn, tx.clone());
        debug!(connection = conn, peer = %peer, "Broker connection opened");

        let writer = async move {
            while let Some(bytes) = rx.recv().await {
                if sink.send(bytes).await.is_err() {
                    break;
                }
            }
        };

        let reader = async move {
            while let Some(frame) = frames.next().await {
                let decoded = frame
                    .map_err(ChannelError::from)
                    .and_then(|bytes| BrokerFrame::decode(&bytes));
                let frame = match decoded {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(connection = conn, error = %e, "Broker connection failed");
                        break;
                    }
                };

                match frame {
                    BrokerFrame::Declare {
                        exchange,
                        queue,
                        exclusive,
                    } => {
                        // Replies are queued under the lock so no delivery
                        // can overtake the acknowledgement.
                        let mut state = self.lock();
                        for reply in state.declare(conn, exchange, queue, exclusive) {
                            match reply.encode() {
                                Ok(bytes) => {
                                    let _ = tx.send(bytes);
                                }
                                Err(e) => warn!(connection = conn, error = %e, "Dropping reply"),
                            }
                        }
                    }
                    BrokerFrame::Publish {
                        exchange,
                        routing_key,
                        reply_to,
                        payload,
                    } => {
                        self.lock().publish(exchange, routing_key, reply_to, payload);
                    }
                    other => {
                        debug!(connection = conn, frame = ?other, "Ignoring unexpected frame");
                    }
                }
            }
        };

        tokio::select! {
            _ = writer => {}
            _ = reader => {}
        }

        self.lock().disconnect(conn);
        debug!(connection = conn, "Broker connection closed");
    }
}

// =============================================================================
// BrokerChannel
// =============================================================================

/// A channel endpoint on the broker-queue transport.
pub struct BrokerChannel {
    address: ChannelAddress,
    role: Role,
    identity: String,
    exchange: String,
    queue: String,
    timeout: Duration,
    connect_timeout: Duration,
    stream: Option<FramedTcp>,
    open: bool,
    last_reply_to: Option<String>,
}

impl BrokerChannel {
    /// Client role: consume an exclusive queue named `identity`.
    pub async fn connect(address: ChannelAddress, identity: &str) -> Result<Self, ChannelError> {
        Self::open(address, Role::Connected, identity).await
    }

    /// Server role: consume the queue named in `address`.
    pub async fn bind(address: ChannelAddress, identity: &str) -> Result<Self, ChannelError> {
        Self::open(address, Role::Bound, identity).await
    }

    /// The identity this endpoint was opened with.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    async fn open(address: ChannelAddress, role: Role, identity: &str) -> Result<Self, ChannelError> {
        let (exchange, queue) = match (&address, role) {
            (ChannelAddress::Broker { exchange, queue, .. }, Role::Bound) => {
                (exchange.clone(), queue.clone())
            }
            (ChannelAddress::Broker { exchange, .. }, Role::Connected) => {
                (exchange.clone(), identity.to_string())
            }
            _ => {
                return Err(ChannelError::InvalidAddress(format!(
                    "{address} is not a broker address"
                )))
            }
        };

        let mut channel = Self {
            address,
            role,
            identity: identity.to_string(),
            exchange,
            queue,
            timeout: DEFAULT_CHANNEL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stream: None,
            open: true,
            last_reply_to: None,
        };
        channel.stream = Some(channel.dial().await?);
        Ok(channel)
    }

    /// Connect to the broker and declare the queue this endpoint consumes.
    async fn dial(&self) -> Result<FramedTcp, ChannelError> {
        let ChannelAddress::Broker { host, port, .. } = &self.address else {
            return Err(ChannelError::InvalidAddress(self.address.to_string()));
        };

        let stream = connect_within(
            self.connect_timeout,
            &self.address,
            TcpStream::connect((host.as_str(), *port)),
        )
        .await?;
        stream.set_nodelay(true)?;
        let mut stream = Framed::new(stream, broker_codec());

        let declare = BrokerFrame::Declare {
            exchange: self.exchange.clone(),
            queue: self.queue.clone(),
            exclusive: self.role == Role::Connected,
        };
        stream.send(declare.encode()?).await?;

        match wait_for(self.connect_timeout, stream.next()).await {
            Some(Some(Ok(bytes))) => match BrokerFrame::decode(&bytes)? {
                BrokerFrame::Declared { .. } => Ok(stream),
                BrokerFrame::Rejected { reason } => Err(ChannelError::Transport(reason)),
                other => Err(ChannelError::Transport(format!(
                    "unexpected handshake frame {other:?}"
                ))),
            },
            Some(Some(Err(e))) => Err(e.into()),
            Some(None) => Err(ChannelError::Transport(format!(
                "{} closed during handshake",
                self.address
            ))),
            None => Err(ChannelError::Timeout(format!(
                "{} did not answer the handshake",
                self.address
            ))),
        }
    }

    /// The live broker connection, dialed again if the last one broke.
    async fn stream(&mut self) -> Result<&mut FramedTcp, ChannelError> {
        if !self.open {
            return Err(ChannelError::Closed);
        }
        if self.stream.is_none() {
            debug!(address = %self.address, identity = %self.identity, "Reconnecting to broker");
            let stream = self.dial().await?;
            self.stream = Some(stream);
        }
        self.stream.as_mut().ok_or(ChannelError::Closed)
    }
}

/// Read frames until a delivery arrives.
async fn next_delivery(
    stream: &mut FramedTcp,
) -> Result<(Option<String>, Vec<u8>), ChannelError> {
    loop {
        let bytes = match stream.next().await {
            Some(frame) => frame?,
            None => return Err(ChannelError::Transport("broker closed the connection".into())),
        };
        match BrokerFrame::decode(&bytes)? {
            BrokerFrame::Deliver {
                reply_to, payload, ..
            } => return Ok((reply_to, payload)),
            other => debug!(frame = ?other, "Skipping non-delivery frame"),
        }
    }
}

#[async_trait]
impl Channel for BrokerChannel {
    fn role(&self) -> Role {
        self.role
    }

    fn address(&self) -> &ChannelAddress {
        &self.address
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn set_connect_timeout(&mut self, timeout: Duration) {
        if !timeout.is_zero() {
            self.connect_timeout = timeout;
        }
    }

    async fn send(&mut self, message: Bytes) -> Result<(), ChannelError> {
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(ChannelError::Transport(format!(
                "message of {} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit",
                message.len()
            )));
        }

        let routing_key = match self.role {
            Role::Connected => {
                let ChannelAddress::Broker { queue, .. } = &self.address else {
                    return Err(ChannelError::InvalidAddress(self.address.to_string()));
                };
                queue.clone()
            }
            Role::Bound => self.last_reply_to.clone().ok_or(ChannelError::NoPeer)?,
        };
        let frame = BrokerFrame::Publish {
            exchange: self.exchange.clone(),
            routing_key,
            reply_to: Some(self.queue.clone()),
            payload: message.to_vec(),
        }
        .encode()?;

        let stream = self.stream().await?;
        if let Err(e) = stream.send(frame).await {
            self.stream = None;
            return Err(ChannelError::Transport(format!(
                "publish to {}: {e}",
                self.address
            )));
        }
        Ok(())
    }

    async fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Bytes>, ChannelError> {
        let stream = self.stream().await?;
        match wait_for(timeout, next_delivery(stream)).await {
            None => Ok(None),
            Some(Ok((reply_to, payload))) => {
                if self.role == Role::Bound {
                    self.last_reply_to = reply_to;
                }
                Ok(Some(Bytes::from(payload)))
            }
            Some(Err(e)) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        self.open = false;
        if let Some(mut stream) = self.stream.take() {
            let _ = SinkExt::<Bytes>::close(&mut stream).await;
        }
        self.last_reply_to = None;
    }
}
