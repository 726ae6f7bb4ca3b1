use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channel::{self, Channel};
use crate::error::{ChannelError, RpcError};

use super::envelope::{decode, encode, RpcRequest, RpcResponse};

// =============================================================================
// Configuration
// =============================================================================

/// Default bound on each attempt of a call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default total number of attempts per call.
pub const DEFAULT_RPC_TRIES: u32 = 5;

static NEXT_CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Derive a client identity that will not collide with other clients of the
/// same service, in this process or any other.
pub fn unique_client_id(base: &str) -> String {
    let seq = NEXT_CLIENT_SEQ.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{base}.{}.{seq}.{nanos:08x}", std::process::id())
}

// =============================================================================
// RpcClient
// =============================================================================

/// Client side of the request/response protocol, owning one connected channel.
///
/// Calls are serialized on the channel: one exchange is in flight at a time.
/// Share the client behind an `Arc` and configure it before sharing.
pub struct RpcClient {
    channel: Mutex<Box<dyn Channel>>,
    client_id: String,
    timeout: Duration,
    tries: u32,
    services: HashSet<String>,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Wrap an already-connected channel.
    pub fn new(channel: Box<dyn Channel>, client_id: impl Into<String>) -> Self {
        Self {
            channel: Mutex::new(channel),
            client_id: client_id.into(),
            timeout: DEFAULT_RPC_TIMEOUT,
            tries: DEFAULT_RPC_TRIES,
            services: HashSet::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Connect to `address` under a fresh identity derived from `base_identity`.
    pub async fn connect(address: &str, base_identity: &str) -> Result<Self, RpcError> {
        let client_id = unique_client_id(base_identity);
        let channel = channel::connect(address, &client_id).await?;
        Ok(Self::new(channel, client_id))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.set_tries(tries);
        self
    }

    /// Register a service this client may call.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.bind_service(service);
        self
    }

    /// Per-attempt bound. Zero waits indefinitely.
    ///
    /// The same bound applies to re-dialing the channel, so a dead peer cannot
    /// hold an attempt open past it.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.channel.get_mut().set_connect_timeout(timeout);
    }

    /// Total attempts per call (at least one).
    pub fn set_tries(&mut self, tries: u32) {
        self.tries = tries.max(1);
    }

    pub fn bind_service(&mut self, service: impl Into<String>) {
        self.services.insert(service.into());
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    /// Call `service.method` with a raw payload and return the raw reply.
    ///
    /// A timed-out or failed attempt is retried until `tries` attempts have
    /// been made. Replies to earlier, abandoned attempts are discarded.
    pub async fn invoke(
        &self,
        service: &str,
        method: &str,
        payload: Bytes,
    ) -> Result<Bytes, RpcError> {
        if !self.services.contains(service) {
            return Err(RpcError::UnboundService(service.to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = encode(&RpcRequest {
            id,
            client: self.client_id.clone(),
            service: service.to_string(),
            method: method.to_string(),
            payload: payload.to_vec(),
        })?;

        let mut channel = self.channel.lock().await;
        let mut last_error: Option<ChannelError> = None;

        for attempt in 1..=self.tries {
            if let Err(e) = channel.send(request.clone()).await {
                if e == ChannelError::Closed {
                    return Err(e.into());
                }
                warn!(service, method, attempt, error = %e, "RPC send failed");
                last_error = match e {
                    ChannelError::Timeout(_) => None,
                    other => Some(other),
                };
                continue;
            }

            match self.await_response(&mut **channel, id, service).await {
                Ok(Some(response)) => {
                    return response.result.map(Bytes::from).map_err(RpcError::Remote);
                }
                Ok(None) => {
                    debug!(service, method, attempt, "RPC attempt timed out");
                    last_error = None;
                }
                Err(RpcError::Channel(e)) if e != ChannelError::Closed => {
                    warn!(service, method, attempt, error = %e, "RPC receive failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(match last_error {
            Some(e) => RpcError::Channel(e),
            None => RpcError::Timeout {
                service: service.to_string(),
                method: method.to_string(),
                tries: self.tries,
            },
        })
    }

    /// Typed wrapper around [`RpcClient::invoke`].
    pub async fn call<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let reply = self.invoke(service, method, encode(request)?).await?;
        decode(&reply)
    }

    /// Close the underlying channel. Later calls fail with `Closed`.
    pub async fn close(&self) {
        self.channel.lock().await.close().await;
    }

    /// Wait for the response to `id` within one attempt's timeout.
    async fn await_response(
        &self,
        channel: &mut dyn Channel,
        id: u64,
        service: &str,
    ) -> Result<Option<RpcResponse>, RpcError> {
        let deadline = (!self.timeout.is_zero()).then(|| Instant::now() + self.timeout);

        loop {
            let wait = match deadline {
                None => Duration::ZERO,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    remaining
                }
            };

            let Some(bytes) = channel.receive_timeout(wait).await? else {
                return Ok(None);
            };

            let response: RpcResponse = match decode(&bytes) {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Discarding undecodable RPC response");
                    continue;
                }
            };
            if response.id != id {
                debug!(expected = id, got = response.id, "Discarding stale RPC response");
                continue;
            }
            if response.service != service {
                return Err(RpcError::Protocol(format!(
                    "response for service '{}' to a call on '{service}'",
                    response.service
                )));
            }
            return Ok(Some(response));
        }
    }
}
