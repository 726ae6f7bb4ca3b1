use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{IndexError, RemoteError, RemoteErrorKind};
use crate::rpc::{decode, encode, RpcService};

use super::messages::{
    CursorReply, CursorRequest, ListReply, ListRequest, OpenReply, OpenRequest, ReadReply,
    ReadRequest, CURSOR_METHOD, LIST_METHOD, OPEN_METHOD, READ_METHOD,
};
use super::{IndexService, TileStore};

/// Exposes an [`IndexService`] as the `index` RPC service.
///
/// Stores are opened on first use and kept for the life of the adapter.
pub struct IndexRpcService<I: IndexService> {
    index: I,
    stores: Mutex<HashMap<String, Arc<I::Store>>>,
}

impl<I: IndexService> IndexRpcService<I> {
    pub fn new(index: I) -> Self {
        Self {
            index,
            stores: Mutex::new(HashMap::new()),
        }
    }

    async fn store(&self, name: &str) -> Result<Arc<I::Store>, IndexError> {
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(name) {
            return Ok(Arc::clone(store));
        }
        let store = Arc::new(self.index.open_store(name).await?);
        stores.insert(name.to_string(), Arc::clone(&store));
        Ok(store)
    }

    async fn dispatch(&self, method: &str, payload: &[u8]) -> Result<Bytes, RemoteError> {
        match method {
            LIST_METHOD => {
                let _: ListRequest = parse(payload)?;
                let names = self.index.list_stores().await.map_err(to_remote)?;
                reply(&ListReply { names })
            }
            OPEN_METHOD => {
                let request: OpenRequest = parse(payload)?;
                let store = self.store(&request.name).await.map_err(to_remote)?;
                reply(&OpenReply {
                    header: store.header().clone(),
                })
            }
            READ_METHOD => {
                let request: ReadRequest = parse(payload)?;
                let store = self.store(&request.name).await.map_err(to_remote)?;
                let record = store
                    .read_request(
                        request.col,
                        request.row,
                        request.level,
                        request.transaction,
                        request.exact,
                    )
                    .await
                    .map_err(to_remote)?;
                reply(&ReadReply { record })
            }
            CURSOR_METHOD => {
                let request: CursorRequest = parse(payload)?;
                let store = self.store(&request.name).await.map_err(to_remote)?;
                let transaction = store.transaction_cursor().await.map_err(to_remote)?;
                reply(&CursorReply { transaction })
            }
            other => Err(RemoteError::new(
                RemoteErrorKind::NotFound,
                format!("no such method: index.{other}"),
            )),
        }
    }
}

#[async_trait]
impl<I: IndexService> RpcService for IndexRpcService<I> {
    async fn call(&self, method: &str, payload: Bytes) -> Result<Bytes, RemoteError> {
        let result = self.dispatch(method, &payload).await;
        if let Err(e) = &result {
            if e.kind == RemoteErrorKind::Internal {
                warn!(method, error = %e, "Index call failed");
            }
        }
        result
    }
}

fn parse<T: DeserializeOwned>(payload: &[u8]) -> Result<T, RemoteError> {
    decode(payload).map_err(|e| RemoteError::new(RemoteErrorKind::BadRequest, e.to_string()))
}

fn reply<T: Serialize>(message: &T) -> Result<Bytes, RemoteError> {
    encode(message).map_err(|e| RemoteError::internal(e.to_string()))
}

fn to_remote(err: IndexError) -> RemoteError {
    let kind = match &err {
        IndexError::TileNotFound { .. } => RemoteErrorKind::TileNotFound,
        IndexError::StoreNotFound(_) => RemoteErrorKind::NotFound,
        IndexError::Rpc(_) | IndexError::Remote(_) => RemoteErrorKind::Internal,
    };
    RemoteError::new(kind, err.to_string())
}
