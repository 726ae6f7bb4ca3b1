//! Bound endpoint shared by the socket transports.
//!
//! Every inbound message carries the [`ReplyHandle`] of the connection it
//! arrived on. The endpoint keeps the handle of the latest message, and `send`
//! writes to it. That is the whole reply-routing mechanism for `inproc://`,
//! `ipc://` and `tcp://`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::ChannelError;

use super::{wait_for, Channel, ChannelAddress, Role, DEFAULT_CHANNEL_TIMEOUT};

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Return path to one connected peer.
#[derive(Debug, Clone)]
pub(crate) struct ReplyHandle {
    peer: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ReplyHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            peer: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    pub(crate) fn peer(&self) -> u64 {
        self.peer
    }
}

/// A message received by a bound endpoint, tagged with its return path.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub(crate) payload: Bytes,
    pub(crate) reply: ReplyHandle,
}

/// Server-role channel for the socket transports.
///
/// Listener tasks (or in-process peers) push [`Inbound`] messages into the
/// endpoint's queue; the endpoint owns a guard whose drop tears the listener
/// down.
pub struct BoundEndpoint {
    address: ChannelAddress,
    timeout: Duration,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    last_peer: Option<ReplyHandle>,
    guard: Option<Box<dyn Send + Sync>>,
}

impl BoundEndpoint {
    pub(crate) fn new(
        address: ChannelAddress,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        guard: Box<dyn Send + Sync>,
    ) -> Self {
        Self {
            address,
            timeout: DEFAULT_CHANNEL_TIMEOUT,
            inbound,
            last_peer: None,
            guard: Some(guard),
        }
    }
}

#[async_trait]
impl Channel for BoundEndpoint {
    fn role(&self) -> Role {
        Role::Bound
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
        self.guard.is_some()
    }

    async fn send(&mut self, message: Bytes) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        let peer = self.last_peer.as_ref().ok_or(ChannelError::NoPeer)?;
        peer.tx.send(message).map_err(|_| {
            ChannelError::Transport(format!("peer {} disconnected", peer.peer()))
        })
    }

    async fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Bytes>, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        match wait_for(timeout, self.inbound.recv()).await {
            None => Ok(None),
            Some(None) => Err(ChannelError::Transport(format!(
                "listener for {} stopped",
                self.address
            ))),
            Some(Some(inbound)) => {
                self.last_peer = Some(inbound.reply);
                Ok(Some(inbound.payload))
            }
        }
    }

    async fn close(&mut self) {
        self.guard = None;
        self.last_peer = None;
        self.inbound.close();
    }
}
