//! Request and reply messages of the `index` RPC service.

use serde::{Deserialize, Serialize};

use super::{IndexHeader, IndexRecord};

/// Service name the index registers under.
pub const INDEX_SERVICE: &str = "index";

pub const LIST_METHOD: &str = "ListRequest";
pub const OPEN_METHOD: &str = "OpenRequest";
pub const READ_METHOD: &str = "ReadRequest";
pub const CURSOR_METHOD: &str = "TransactionCursor";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListReply {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenReply {
    pub header: IndexHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub name: String,
    pub col: u32,
    pub row: u32,
    pub level: u32,
    pub transaction: u64,
    pub exact: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReply {
    pub record: IndexRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorReply {
    pub transaction: u64,
}
