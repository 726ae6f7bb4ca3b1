//! Wire envelopes for RPC requests and responses.
//!
//! Both are bincode-encoded. The payload inside is itself a bincode-encoded
//! message defined by the service being called.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RemoteError, RpcError};

/// One method invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Per-client call id, echoed back in the response
    pub id: u64,
    /// Identity of the calling client
    pub client: String,
    pub service: String,
    pub method: String,
    pub payload: Vec<u8>,
}

/// The answer to one [`RpcRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub service: String,
    pub result: Result<Vec<u8>, RemoteError>,
}

/// Encode any serde value with the wire codec.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, RpcError> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

/// Decode any serde value with the wire codec.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RpcError> {
    Ok(bincode::deserialize(bytes)?)
}
