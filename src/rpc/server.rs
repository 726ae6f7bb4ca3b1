use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::{ChannelError, RemoteError, RemoteErrorKind, RpcError};

use super::envelope::{decode, encode, RpcRequest, RpcResponse};

/// Pause between receive attempts after the server's channel failed.
pub const RECONNECT_BACKOFF: Duration = Duration::from_millis(200);

/// A named service reachable through an [`RpcServer`].
#[async_trait]
pub trait RpcService: Send + Sync {
    /// Handle one call. `payload` is the encoded request message.
    async fn call(&self, method: &str, payload: Bytes) -> Result<Bytes, RemoteError>;
}

/// Serial receive/dispatch/reply loop over a bound channel.
///
/// Replies rely on the channel's reply routing: each answer is sent right
/// after the request it answers was received.
pub struct RpcServer {
    channel: Box<dyn Channel>,
    services: HashMap<String, Arc<dyn RpcService>>,
    handled: u64,
}

impl RpcServer {
    pub fn new(channel: Box<dyn Channel>) -> Self {
        Self {
            channel,
            services: HashMap::new(),
            handled: 0,
        }
    }

    /// Register `service` under `name`.
    pub fn with_service(mut self, name: impl Into<String>, service: Arc<dyn RpcService>) -> Self {
        self.services.insert(name.into(), service);
        self
    }

    /// Number of requests answered so far.
    pub fn handled(&self) -> u64 {
        self.handled
    }

    /// The bound channel this server answers on.
    pub fn channel(&self) -> &dyn Channel {
        self.channel.as_ref()
    }

    /// Receive and answer at most one request.
    ///
    /// Returns `Ok(false)` if nothing arrived within `timeout`.
    pub async fn serve_one(&mut self, timeout: Duration) -> Result<bool, RpcError> {
        let Some(bytes) = self.channel.receive_timeout(timeout).await? else {
            return Ok(false);
        };

        let request: RpcRequest = match decode(&bytes) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable RPC request");
                return Ok(true);
            }
        };

        debug!(
            id = request.id,
            client = %request.client,
            service = %request.service,
            method = %request.method,
            "RPC request"
        );

        let result = match self.services.get(&request.service) {
            Some(service) => service
                .call(&request.method, Bytes::from(request.payload))
                .await
                .map(|reply| reply.to_vec()),
            None => Err(RemoteError::new(
                RemoteErrorKind::NotFound,
                format!("no such service: {}", request.service),
            )),
        };

        let response = encode(&RpcResponse {
            id: request.id,
            service: request.service,
            result,
        })?;

        match self.channel.send(response).await {
            Ok(()) => {}
            Err(ChannelError::Closed) => return Err(ChannelError::Closed.into()),
            Err(e) => warn!(client = %request.client, error = %e, "Could not deliver RPC response"),
        }
        self.handled += 1;
        Ok(true)
    }

    /// Answer requests until none arrives for `idle`.
    pub async fn run_until_idle(&mut self, idle: Duration) -> Result<u64, RpcError> {
        let start = self.handled;
        while self.serve_one(idle).await? {}
        Ok(self.handled - start)
    }

    /// Answer requests until the channel is closed.
    ///
    /// Transport failures are logged and retried after [`RECONNECT_BACKOFF`];
    /// channels that reconnect lazily pick up where they left off.
    pub async fn serve(mut self) -> Result<(), RpcError> {
        info!(address = %self.channel.address(), "RPC server running");
        loop {
            match self.serve_one(Duration::ZERO).await {
                Ok(_) => {}
                Err(RpcError::Channel(ChannelError::Closed)) => {
                    return Err(ChannelError::Closed.into())
                }
                Err(RpcError::Channel(e)) => {
                    warn!(address = %self.channel.address(), error = %e, "RPC server channel failed");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
