use bucket_storage::StorageError;
use thiserror::Error;

use crate::{cache::CacheError, key::KeyError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to synchronize the watch cache: {0}")]
    Synchronization(String),
    #[error("transient failure: {0}")]
    Transient(StorageError),
    #[error("permanent failure: {0}")]
    Permanent(StorageError),
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Cache(_))
    }
}

pub type Result<T, E = Error> = ::core::result::Result<T, E>;
