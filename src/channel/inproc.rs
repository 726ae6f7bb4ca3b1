//! In-process socket transport (`inproc://name`).
//!
//! Bound endpoints register their inbound queue under a name in a
//! process-wide table; connected endpoints look the name up and push messages
//! straight into it, tagged with their own reply queue.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::ChannelError;

use super::endpoint::{BoundEndpoint, Inbound, ReplyHandle};
use super::{wait_for, Channel, ChannelAddress, Role, DEFAULT_CHANNEL_TIMEOUT};

type Registry = Mutex<HashMap<String, mpsc::UnboundedSender<Inbound>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn lookup(name: &str) -> Option<mpsc::UnboundedSender<Inbound>> {
    let table = registry().lock().unwrap_or_else(|e| e.into_inner());
    table.get(name).filter(|tx| !tx.is_closed()).cloned()
}

/// Removes the name from the table when the bound endpoint goes away.
struct Registration {
    name: String,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut table = registry().lock().unwrap_or_else(|e| e.into_inner());
        if table
            .get(&self.name)
            .is_some_and(|current| current.same_channel(&self.tx))
        {
            table.remove(&self.name);
        }
    }
}

/// Bind an in-process endpoint under `name`.
pub(crate) fn bind(name: &str) -> Result<BoundEndpoint, ChannelError> {
    let (tx, rx) = mpsc::unbounded_channel();

    {
        let mut table = registry().lock().unwrap_or_else(|e| e.into_inner());
        if table.get(name).is_some_and(|existing| !existing.is_closed()) {
            return Err(ChannelError::AddressInUse(format!("inproc://{name}")));
        }
        table.insert(name.to_string(), tx.clone());
    }

    let guard = Registration {
        name: name.to_string(),
        tx,
    };
    Ok(BoundEndpoint::new(
        ChannelAddress::Inproc {
            name: name.to_string(),
        },
        rx,
        Box::new(guard),
    ))
}

/// Client-role endpoint of the in-process transport.
pub struct InprocConnection {
    address: ChannelAddress,
    identity: String,
    timeout: Duration,
    server: Option<mpsc::UnboundedSender<Inbound>>,
    reply: ReplyHandle,
    replies: mpsc::UnboundedReceiver<Bytes>,
}

impl InprocConnection {
    /// Connect to the endpoint bound under `name`.
    pub fn connect(name: &str, identity: &str) -> Result<Self, ChannelError> {
        let server = lookup(name).ok_or_else(|| {
            ChannelError::Transport(format!("no endpoint bound at inproc://{name}"))
        })?;
        let (tx, replies) = mpsc::unbounded_channel();

        Ok(Self {
            address: ChannelAddress::Inproc {
                name: name.to_string(),
            },
            identity: identity.to_string(),
            timeout: DEFAULT_CHANNEL_TIMEOUT,
            server: Some(server),
            reply: ReplyHandle::new(tx),
            replies,
        })
    }

    /// The identity this endpoint was connected with.
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

#[async_trait]
impl Channel for InprocConnection {
    fn role(&self) -> Role {
        Role::Connected
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
        self.server.is_some()
    }

    async fn send(&mut self, message: Bytes) -> Result<(), ChannelError> {
        let server = self.server.as_ref().ok_or(ChannelError::Closed)?;
        server
            .send(Inbound {
                payload: message,
                reply: self.reply.clone(),
            })
            .map_err(|_| ChannelError::Transport(format!("{} is no longer bound", self.address)))
    }

    async fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Bytes>, ChannelError> {
        if self.server.is_none() {
            return Err(ChannelError::Closed);
        }
        // We hold a sender ourselves, so the queue never reports closed.
        Ok(wait_for(timeout, self.replies.recv()).await.flatten())
    }

    async fn close(&mut self) {
        self.server = None;
        self.replies.close();
    }
}
