use std::time::Duration;

use thiserror::Error;

use crate::BucketState;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid bucket name: {0:?}")]
    InvalidBucketName(String),
    #[error("no such bucket: {0}")]
    NoSuchBucket(String),
    #[error("bucket is already owned by you: {0}")]
    AlreadyOwnedByYou(String),
    #[error("bucket name is already taken by another account: {0}")]
    AlreadyExists(String),
    #[error("access denied ({code}): {message}")]
    AccessDenied { code: String, message: String },
    #[error("timed out after {timeout:?} waiting for bucket {bucket:?} to be {state}")]
    WaitTimeout {
        bucket: String,
        state: BucketState,
        timeout: Duration,
    },
    #[error("storage request failed: {0}")]
    Request(::anyhow::Error),
}

impl StorageError {
    /// Returns `false` for failures that cannot heal without a change to the
    /// resource or to the credentials.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidBucketName(_) | Self::AlreadyExists(_) | Self::AccessDenied { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoSuchBucket(_))
    }
}
