use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a message channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel was closed by its owner
    #[error("Channel is closed")]
    Closed,

    /// The peer or broker could not be reached, or the connection broke
    #[error("Transport error: {0}")]
    Transport(String),

    /// A bound channel was asked to send before it received anything
    #[error("No peer to reply to: a bound channel must receive before it can send")]
    NoPeer,

    /// Connecting to the peer or broker took longer than the connect timeout
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The address string could not be parsed
    #[error("Invalid channel address: {0}")]
    InvalidAddress(String),

    /// Another endpoint is already bound to this address
    #[error("Address already in use: {0}")]
    AddressInUse(String),
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Transport(err.to_string())
    }
}

/// Category of a failure reported by the remote side of an RPC call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// The requested tile has no record at the requested transaction
    TileNotFound,
    /// The named store, service or method does not exist
    NotFound,
    /// The request was malformed
    BadRequest,
    /// Anything else that went wrong on the server
    Internal,
}

/// A failure reported by the remote side of an RPC call.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Internal, message)
    }
}

/// Errors raised by the RPC client and server.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// Channel failure on the final attempt
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// No matching response arrived within the configured number of tries
    #[error("RPC timeout: {service}.{method} got no response after {tries} tries")]
    Timeout {
        service: String,
        method: String,
        tries: u32,
    },

    /// An envelope or message could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// The client has no stub bound for this service
    #[error("Service not bound on this client: {0}")]
    UnboundService(String),

    /// The server answered with an error
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    /// The server answered with something that does not match the request
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<bincode::Error> for RpcError {
    fn from(err: bincode::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

/// Errors raised when talking to the index service or a tile store.
#[derive(Debug, Clone, Error)]
pub enum IndexError {
    /// No record for the tile at the requested transaction
    #[error("Tile not found: col {col}, row {row}, level {level}, transaction {transaction}")]
    TileNotFound {
        col: u32,
        row: u32,
        level: u32,
        transaction: u64,
    },

    /// The index service does not know this store name
    #[error("Store not found: {0}")]
    StoreNotFound(String),

    /// The RPC exchange itself failed
    #[error("RPC failure: {0}")]
    Rpc(RpcError),

    /// The index service reported a failure
    #[error("Index service error: {0}")]
    Remote(String),
}

impl From<RpcError> for IndexError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote(remote) => match remote.kind {
                RemoteErrorKind::NotFound => IndexError::StoreNotFound(remote.message),
                _ => IndexError::Remote(remote.message),
            },
            other => IndexError::Rpc(other),
        }
    }
}

/// Errors raised when opening or reading blob files.
#[derive(Debug, Clone, Error)]
pub enum BlobError {
    /// Filesystem failure
    #[error("Blob I/O error: {0}")]
    Io(String),

    /// The record header at this offset is not valid
    #[error("Invalid blob record in {path} at offset {offset}: {reason}")]
    InvalidRecord {
        path: String,
        offset: u64,
        reason: String,
    },
}

impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        BlobError::Io(err.to_string())
    }
}

/// Errors surfaced by the tile read path, mapped to HTTP statuses in the server layer.
#[derive(Debug, Clone, Error)]
pub enum PlateError {
    /// Malformed path or query string
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The store id is unknown even after a resync
    #[error("No such store [id = {0}]")]
    StoreNotFound(u32),

    /// Valid request, but the tile is absent in the store
    #[error("Tile not found: col {col}, row {row}, level {level}, transaction {transaction}")]
    TileNotFound {
        col: u32,
        row: u32,
        level: u32,
        transaction: u64,
    },

    /// Remote index or blob failure, recovered
    #[error("Server error: {0}")]
    ServerError(String),

    /// Anything not anticipated by the read path
    #[error("Internal error: {0}")]
    Internal(String),
}
