//! Sharding error types

use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShardError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("shard record codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("instance is not registered")]
    NotRegistered,
    #[error("invalid shard key: {0}")]
    InvalidKey(String),
}
