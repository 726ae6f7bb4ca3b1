//! Stream socket transports (`tcp://host:port` and `ipc://path`).
//!
//! Messages are length-delimited frames. The bound side accepts any number of
//! connections. Each connection forwards inbound frames to the endpoint tagged
//! with the connection's reply queue, and drains that queue back onto the
//! socket. Connections live in the accept loop's task set, so closing the
//! endpoint hangs up on every peer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::error::ChannelError;

use super::endpoint::{BoundEndpoint, Inbound, ReplyHandle};
use super::{
    connect_within, wait_for, Channel, ChannelAddress, Role, DEFAULT_CHANNEL_TIMEOUT,
    DEFAULT_CONNECT_TIMEOUT, MAX_MESSAGE_SIZE,
};

/// Any bidirectional byte stream we can frame.
pub(crate) trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

type FramedStream = Framed<Box<dyn ByteStream>, LengthDelimitedCodec>;

pub(crate) fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_MESSAGE_SIZE)
        .new_codec()
}

// =============================================================================
// Bound side
// =============================================================================

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<Box<dyn ByteStream>> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Aborts the accept loop (and with it every peer connection) and removes the
/// socket file when dropped.
struct ListenerGuard {
    accept_task: JoinHandle<()>,
    socket_path: Option<PathBuf>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.accept_task.abort();
        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Bind a TCP or Unix socket endpoint.
pub(crate) async fn bind(address: ChannelAddress) -> Result<BoundEndpoint, ChannelError> {
    let (listener, resolved, socket_path) = match &address {
        ChannelAddress::Tcp { host, port } => {
            let listener = TcpListener::bind((host.as_str(), *port))
                .await
                .map_err(|e| bind_error(&address, e))?;
            let local = listener.local_addr()?;
            let resolved = ChannelAddress::Tcp {
                host: host.clone(),
                port: local.port(),
            };
            (Listener::Tcp(listener), resolved, None)
        }
        ChannelAddress::Ipc { path } => {
            remove_stale_socket(path).await;
            let listener = UnixListener::bind(path).map_err(|e| bind_error(&address, e))?;
            (Listener::Unix(listener), address.clone(), Some(path.clone()))
        }
        other => {
            return Err(ChannelError::InvalidAddress(format!(
                "{other} is not a socket address"
            )))
        }
    };

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let accept_task = tokio::spawn(accept_loop(listener, inbound_tx, resolved.to_string()));

    Ok(BoundEndpoint::new(
        resolved,
        inbound_rx,
        Box::new(ListenerGuard {
            accept_task,
            socket_path,
        }),
    ))
}

fn bind_error(address: &ChannelAddress, err: std::io::Error) -> ChannelError {
    if err.kind() == std::io::ErrorKind::AddrInUse {
        ChannelError::AddressInUse(address.to_string())
    } else {
        ChannelError::Transport(format!("bind {address}: {err}"))
    }
}

/// Remove a socket file left behind by a previous process, but only if nobody
/// is listening on it.
async fn remove_stale_socket(path: &Path) {
    if tokio::fs::metadata(path).await.is_ok() && UnixStream::connect(path).await.is_err() {
        debug!(path = %path.display(), "Removing stale socket file");
        let _ = tokio::fs::remove_file(path).await;
    }
}

async fn accept_loop(
    listener: Listener,
    inbound: mpsc::UnboundedSender<Inbound>,
    address: String,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    connections.spawn(serve_connection(stream, inbound.clone()));
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
        if inbound.is_closed() {
            break;
        }
    }
}

async fn serve_connection(stream: Box<dyn ByteStream>, inbound: mpsc::UnboundedSender<Inbound>) {
    let (mut sink, mut frames) = Framed::new(stream, codec()).split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Bytes>();
    let reply = ReplyHandle::new(reply_tx);
    let peer = reply.peer();
    debug!(peer = peer, "Peer connected");

    let writer = async move {
        while let Some(message) = reply_rx.recv().await {
            if let Err(e) = sink.send(message).await {
                debug!(peer = peer, error = %e, "Reply write failed");
                break;
            }
        }
    };

    let reader = async move {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(payload) => {
                    let message = Inbound {
                        payload: payload.freeze(),
                        reply: reply.clone(),
                    };
                    if inbound.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(peer = peer, error = %e, "Peer read failed");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }
    debug!(peer = peer, "Peer disconnected");
}

// =============================================================================
// Connected side
// =============================================================================

/// Client-role endpoint of the TCP and Unix socket transports.
///
/// The connection is dialed eagerly; after a transport failure it is dropped
/// and dialed again on the next `send`.
pub struct SocketConnection {
    address: ChannelAddress,
    identity: String,
    timeout: Duration,
    connect_timeout: Duration,
    stream: Option<FramedStream>,
    open: bool,
}

impl SocketConnection {
    /// Dial the bound endpoint at `address`.
    pub async fn connect(address: ChannelAddress, identity: &str) -> Result<Self, ChannelError> {
        let stream = dial(&address, DEFAULT_CONNECT_TIMEOUT).await?;
        Ok(Self {
            address,
            identity: identity.to_string(),
            timeout: DEFAULT_CHANNEL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stream: Some(stream),
            open: true,
        })
    }

    /// The identity this endpoint was connected with.
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

async fn dial(address: &ChannelAddress, timeout: Duration) -> Result<FramedStream, ChannelError> {
    let stream: Box<dyn ByteStream> = match address {
        ChannelAddress::Tcp { host, port } => {
            let stream =
                connect_within(timeout, address, TcpStream::connect((host.as_str(), *port))).await?;
            stream.set_nodelay(true)?;
            Box::new(stream)
        }
        ChannelAddress::Ipc { path } => {
            Box::new(connect_within(timeout, address, UnixStream::connect(path)).await?)
        }
        other => {
            return Err(ChannelError::InvalidAddress(format!(
                "{other} is not a socket address"
            )))
        }
    };
    Ok(Framed::new(stream, codec()))
}

#[async_trait]
impl Channel for SocketConnection {
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
        self.open
    }

    fn set_connect_timeout(&mut self, timeout: Duration) {
        if !timeout.is_zero() {
            self.connect_timeout = timeout;
        }
    }

    async fn send(&mut self, message: Bytes) -> Result<(), ChannelError> {
        if !self.open {
            return Err(ChannelError::Closed);
        }
        if self.stream.is_none() {
            debug!(address = %self.address, identity = %self.identity, "Reconnecting");
            self.stream = Some(dial(&self.address, self.connect_timeout).await?);
        }

        let stream = self.stream.as_mut().ok_or(ChannelError::Closed)?;
        if let Err(e) = stream.send(message).await {
            self.stream = None;
            return Err(ChannelError::Transport(format!(
                "send to {}: {e}",
                self.address
            )));
        }
        Ok(())
    }

    async fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Bytes>, ChannelError> {
        if !self.open {
            return Err(ChannelError::Closed);
        }
        let stream = self.stream.as_mut().ok_or_else(|| {
            ChannelError::Transport(format!("not connected to {}", self.address))
        })?;

        match wait_for(timeout, stream.next()).await {
            None => Ok(None),
            Some(Some(Ok(frame))) => Ok(Some(frame.freeze())),
            Some(Some(Err(e))) => {
                self.stream = None;
                Err(ChannelError::Transport(format!(
                    "receive from {}: {e}",
                    self.address
                )))
            }
            Some(None) => {
                self.stream = None;
                Err(ChannelError::Transport(format!(
                    "{} closed the connection",
                    self.address
                )))
            }
        }
    }

    async fn close(&mut self) {
        self.open = false;
        if let Some(mut stream) = self.stream.take() {
            let _ = SinkExt::<Bytes>::close(&mut stream).await;
        }
    }
}
