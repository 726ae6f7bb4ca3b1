//! Request/response calls over a [`Channel`](crate::channel::Channel).
//!
//! [`RpcClient`] wraps a connected channel and turns named method calls into
//! envelope exchanges with a per-call timeout and bounded retry.
//! [`RpcServer`] is the bound-side loop that dispatches those envelopes to
//! registered [`RpcService`]s.
//!
//! Retries resend the same request id. The server does not deduplicate, so a
//! call may execute more than once; methods invoked through this layer are
//! expected to be idempotent.

mod client;
mod envelope;
mod server;

pub use client::{unique_client_id, RpcClient, DEFAULT_RPC_TIMEOUT, DEFAULT_RPC_TRIES};
pub use envelope::{decode, encode, RpcRequest, RpcResponse};
pub use server::{RpcServer, RpcService, RECONNECT_BACKOFF};
