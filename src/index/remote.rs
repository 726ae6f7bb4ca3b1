use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{IndexError, RemoteErrorKind, RpcError};
use crate::rpc::RpcClient;

use super::messages::{
    CursorReply, CursorRequest, ListReply, ListRequest, OpenReply, OpenRequest, ReadReply,
    ReadRequest, CURSOR_METHOD, INDEX_SERVICE, LIST_METHOD, OPEN_METHOD, READ_METHOD,
};
use super::{IndexHeader, IndexRecord, IndexService, TileStore};

/// [`IndexService`] backed by the remote `index` RPC service.
#[derive(Clone)]
pub struct RemoteIndex {
    client: Arc<RpcClient>,
}

impl RemoteIndex {
    /// Wrap a client. The `index` service is bound on it if it is not already.
    pub fn new(mut client: RpcClient) -> Self {
        client.bind_service(INDEX_SERVICE);
        Self {
            client: Arc::new(client),
        }
    }

    /// Connect to the index service at `address`.
    pub async fn connect(
        address: &str,
        base_identity: &str,
        timeout: Duration,
        tries: u32,
    ) -> Result<Self, RpcError> {
        let client = RpcClient::connect(address, base_identity)
            .await?
            .with_timeout(timeout)
            .with_tries(tries);
        debug!(address, client_id = %client.client_id(), "Connected to index service");
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }
}

#[async_trait]
impl IndexService for RemoteIndex {
    type Store = RemoteTileStore;

    async fn list_stores(&self) -> Result<Vec<String>, IndexError> {
        let reply: ListReply = self
            .client
            .call(INDEX_SERVICE, LIST_METHOD, &ListRequest {})
            .await?;
        Ok(reply.names)
    }

    async fn open_store(&self, name: &str) -> Result<RemoteTileStore, IndexError> {
        let request = OpenRequest {
            name: name.to_string(),
        };
        let reply: OpenReply = self.client.call(INDEX_SERVICE, OPEN_METHOD, &request).await?;
        Ok(RemoteTileStore {
            client: Arc::clone(&self.client),
            header: reply.header,
        })
    }
}

/// A tile store opened through [`RemoteIndex`].
pub struct RemoteTileStore {
    client: Arc<RpcClient>,
    header: IndexHeader,
}

#[async_trait]
impl TileStore for RemoteTileStore {
    fn header(&self) -> &IndexHeader {
        &self.header
    }

    async fn transaction_cursor(&self) -> Result<u64, IndexError> {
        let request = CursorRequest {
            name: self.header.name.clone(),
        };
        let reply: CursorReply = self
            .client
            .call(INDEX_SERVICE, CURSOR_METHOD, &request)
            .await?;
        Ok(reply.transaction)
    }

    async fn read_request(
        &self,
        col: u32,
        row: u32,
        level: u32,
        transaction: u64,
        exact: bool,
    ) -> Result<IndexRecord, IndexError> {
        let request = ReadRequest {
            name: self.header.name.clone(),
            col,
            row,
            level,
            transaction,
            exact,
        };
        match self
            .client
            .call::<_, ReadReply>(INDEX_SERVICE, READ_METHOD, &request)
            .await
        {
            Ok(reply) => Ok(reply.record),
            Err(RpcError::Remote(remote)) if remote.kind == RemoteErrorKind::TileNotFound => {
                Err(IndexError::TileNotFound {
                    col,
                    row,
                    level,
                    transaction,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}
