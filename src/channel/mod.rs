//! Transport-agnostic message channels.
//!
//! A [`Channel`] moves opaque byte messages between a *bound* endpoint (the
//! server role, talking to any number of peers) and *connected* endpoints (the
//! client role, talking to one bound endpoint).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        dyn Channel                              │
//! │        send(bytes)  receive(timeout)  set_timeout(d)            │
//! └───────────────┬──────────────────────────────┬──────────────────┘
//!                 │                              │
//!                 ▼                              ▼
//! ┌───────────────────────────────┐  ┌──────────────────────────────┐
//! │        socket transport        │  │      broker transport        │
//! │  inproc://  ipc://  tcp://     │  │  broker://host/exch/queue    │
//! │  reply handle per connection   │  │  explicit reply_to queue     │
//! └───────────────────────────────┘  └──────────────────────────────┘
//! ```
//!
//! # Reply routing
//!
//! A bound channel remembers who sent the message it most recently received.
//! The next `send` goes back to that peer, so a single server loop can answer
//! many concurrent clients with nothing but `receive` and `send`.
//!
//! # Timeouts
//!
//! `receive` returns `Ok(None)` when nothing arrived in time. That is not an
//! error. A timeout of zero blocks until a message arrives.

mod address;
pub mod broker;
mod endpoint;
mod inproc;
mod socket;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ChannelError;

pub use address::{ChannelAddress, DEFAULT_BROKER_PORT};
pub use broker::{Broker, BrokerChannel};
pub use endpoint::BoundEndpoint;
pub use inproc::InprocConnection;
pub use socket::SocketConnection;

/// Largest message accepted on a stream transport (64 MiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Default receive timeout for new channels (zero blocks indefinitely).
pub const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::ZERO;

/// Default bound on dialing a peer or broker, handshake included.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Which side of the exchange an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Server role: receives from many peers, replies to the latest one
    Bound,
    /// Client role: talks to exactly one bound endpoint
    Connected,
}

/// The wire mechanism behind a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Broker,
    Inproc,
    Ipc,
    Tcp,
}

/// A byte-message endpoint.
///
/// Send and receive take `&mut self`: one logical user drives a channel at a
/// time. Concurrent clients each own their own connected channel.
#[async_trait]
pub trait Channel: Send {
    /// Server or client role.
    fn role(&self) -> Role;

    /// The wire mechanism in use.
    fn transport(&self) -> TransportKind {
        self.address().transport()
    }

    /// The resolved address (a bound `tcp://host:0` reports its real port).
    fn address(&self) -> &ChannelAddress;

    /// Default bound for [`Channel::receive`].
    fn timeout(&self) -> Duration;

    /// Change the default bound for subsequent receives.
    fn set_timeout(&mut self, timeout: Duration);

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;

    /// Bound for (re)establishing the underlying connection. Transports that
    /// have no connection to establish ignore it; zero keeps the current one.
    fn set_connect_timeout(&mut self, _timeout: Duration) {}

    /// Send one message.
    ///
    /// On a bound channel the message goes to the peer that sent the most
    /// recently received message.
    async fn send(&mut self, message: Bytes) -> Result<(), ChannelError>;

    /// Wait up to `timeout` for one message; `Ok(None)` if none arrived.
    async fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Bytes>, ChannelError>;

    /// Wait up to the channel's default timeout for one message.
    async fn receive(&mut self) -> Result<Option<Bytes>, ChannelError> {
        let timeout = self.timeout();
        self.receive_timeout(timeout).await
    }

    /// Release the endpoint. Further sends and receives fail with `Closed`.
    async fn close(&mut self);
}

/// Open a client-role channel to the endpoint at `address`.
pub async fn connect(address: &str, identity: &str) -> Result<Box<dyn Channel>, ChannelError> {
    connect_to(&ChannelAddress::parse(address)?, identity).await
}

/// Open a client-role channel to an already-parsed address.
pub async fn connect_to(
    address: &ChannelAddress,
    identity: &str,
) -> Result<Box<dyn Channel>, ChannelError> {
    let channel: Box<dyn Channel> = match address {
        ChannelAddress::Broker { .. } => {
            Box::new(BrokerChannel::connect(address.clone(), identity).await?)
        }
        ChannelAddress::Inproc { name } => Box::new(InprocConnection::connect(name, identity)?),
        ChannelAddress::Ipc { .. } | ChannelAddress::Tcp { .. } => {
            Box::new(SocketConnection::connect(address.clone(), identity).await?)
        }
    };
    tracing::debug!(address = %address, identity = identity, "Channel connected");
    Ok(channel)
}

/// Open a server-role channel at `address`.
pub async fn bind(address: &str, identity: &str) -> Result<Box<dyn Channel>, ChannelError> {
    bind_to(&ChannelAddress::parse(address)?, identity).await
}

/// Open a server-role channel at an already-parsed address.
pub async fn bind_to(
    address: &ChannelAddress,
    identity: &str,
) -> Result<Box<dyn Channel>, ChannelError> {
    let channel: Box<dyn Channel> = match address {
        ChannelAddress::Broker { .. } => {
            Box::new(BrokerChannel::bind(address.clone(), identity).await?)
        }
        ChannelAddress::Inproc { name } => Box::new(inproc::bind(name)?),
        ChannelAddress::Ipc { .. } | ChannelAddress::Tcp { .. } => {
            Box::new(socket::bind(address.clone()).await?)
        }
    };
    tracing::debug!(address = %channel.address(), identity = identity, "Channel bound");
    Ok(channel)
}

/// Run a connect future under `timeout`, mapping both failure modes onto
/// [`ChannelError`].
pub(crate) async fn connect_within<T, F>(
    timeout: Duration,
    address: &ChannelAddress,
    fut: F,
) -> Result<T, ChannelError>
where
    F: Future<Output = std::io::Result<T>>,
{
    match wait_for(timeout, fut).await {
        Some(Ok(stream)) => Ok(stream),
        Some(Err(e)) => Err(ChannelError::Transport(format!("connect {address}: {e}"))),
        None => Err(ChannelError::Timeout(format!(
            "connect {address} after {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Await `fut` for at most `timeout`; a zero timeout waits indefinitely.
pub(crate) async fn wait_for<F: Future>(timeout: Duration, fut: F) -> Option<F::Output> {
    if timeout.is_zero() {
        Some(fut.await)
    } else {
        tokio::time::timeout(timeout, fut).await.ok()
    }
}
