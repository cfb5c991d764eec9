use std::{fmt, time::Duration};

use async_trait::async_trait;
use bucket_api::bucket::BucketSpec;
use bucket_storage::{BucketState, ObjectStorage, StorageError};
use tracing::{info, instrument, Level};

#[derive(Debug)]
pub enum LifecycleOutcome {
    Created,
    AlreadyExists,
    Deleted,
    SkippedNoForceDelete,
    TransientFailure(StorageError),
    PermanentFailure(StorageError),
}

impl fmt::Display for LifecycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("Created"),
            Self::AlreadyExists => f.write_str("AlreadyExists"),
            Self::Deleted => f.write_str("Deleted"),
            Self::SkippedNoForceDelete => f.write_str("SkippedNoForceDelete"),
            Self::TransientFailure(error) => write!(f, "TransientFailure({error})"),
            Self::PermanentFailure(error) => write!(f, "PermanentFailure({error})"),
        }
    }
}

impl LifecycleOutcome {
    fn from_error(error: StorageError) -> Self {
        if error.is_retryable() {
            Self::TransientFailure(error)
        } else {
            Self::PermanentFailure(error)
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::TransientFailure(_) | Self::PermanentFailure(_))
    }
}

/// Turns a desired bucket spec into storage calls.
///
/// Every storage error is classified here; callers only ever see a
/// [`LifecycleOutcome`].
#[async_trait]
pub trait LifecycleHandler
where
    Self: Send + Sync,
{
    async fn provision(&self, spec: &BucketSpec) -> LifecycleOutcome;

    async fn teardown(&self, spec: &BucketSpec) -> LifecycleOutcome;
}

pub struct BucketLifecycle<S> {
    storage: S,
    wait_timeout: Duration,
}

impl<S> BucketLifecycle<S> {
    pub const fn new(storage: S, wait_timeout: Duration) -> Self {
        Self {
            storage,
            wait_timeout,
        }
    }

    pub const fn storage(&self) -> &S {
        &self.storage
    }
}

impl<S> BucketLifecycle<S>
where
    S: ObjectStorage,
{
    async fn try_provision(
        &self,
        name: &str,
        region: Option<&str>,
    ) -> Result<LifecycleOutcome, StorageError> {
        match self.storage.head_bucket(name).await? {
            BucketState::Exists => {
                info!("bucket already exists: {name}");
                Ok(LifecycleOutcome::AlreadyExists)
            }
            BucketState::NotFound => {
                match self.storage.create_bucket(name, region).await {
                    Ok(()) => {}
                    Err(StorageError::AlreadyOwnedByYou(_)) => {
                        info!("bucket has been created concurrently: {name}");
                        return Ok(LifecycleOutcome::AlreadyExists);
                    }
                    Err(error) => return Err(error),
                }

                self.storage
                    .wait_until_exists(name, self.wait_timeout)
                    .await?;
                info!("created bucket: {name}");
                Ok(LifecycleOutcome::Created)
            }
        }
    }

    async fn try_teardown(&self, name: &str) -> Result<LifecycleOutcome, StorageError> {
        let mut continuation_token = None;
        let mut purged = 0usize;

        loop {
            let page = self.storage.list_objects(name, continuation_token).await?;
            if page.keys.is_empty() {
                break;
            }

            let has_more = page.has_more();
            purged += page.keys.len();
            self.storage.delete_objects(name, page.keys).await?;

            if !has_more {
                break;
            }
            continuation_token = page.next_continuation_token;
        }
        info!("purged {purged} objects from bucket: {name}");

        self.storage.delete_bucket(name).await?;
        self.storage
            .wait_until_not_exists(name, self.wait_timeout)
            .await?;
        info!("deleted bucket: {name}");
        Ok(LifecycleOutcome::Deleted)
    }
}

#[async_trait]
impl<S> LifecycleHandler for BucketLifecycle<S>
where
    S: ObjectStorage,
{
    #[instrument(level = Level::INFO, skip_all, fields(bucket = %spec.bucket_name))]
    async fn provision(&self, spec: &BucketSpec) -> LifecycleOutcome {
        let name = spec.bucket_name.as_str();
        if name.is_empty() {
            return LifecycleOutcome::from_error(StorageError::InvalidBucketName(name.into()));
        }

        self.try_provision(name, spec.region())
            .await
            .unwrap_or_else(LifecycleOutcome::from_error)
    }

    #[instrument(level = Level::INFO, skip_all, fields(bucket = %spec.bucket_name))]
    async fn teardown(&self, spec: &BucketSpec) -> LifecycleOutcome {
        if !spec.force_delete {
            info!(
                "leaving bucket behind (forceDelete is disabled): {name}",
                name = &spec.bucket_name,
            );
            return LifecycleOutcome::SkippedNoForceDelete;
        }

        let name = spec.bucket_name.as_str();
        if name.is_empty() {
            return LifecycleOutcome::from_error(StorageError::InvalidBucketName(name.into()));
        }

        match self.try_teardown(name).await {
            Ok(outcome) => outcome,
            Err(error) if error.is_not_found() => {
                info!("bucket is already gone: {name}");
                LifecycleOutcome::Deleted
            }
            Err(error) => LifecycleOutcome::from_error(error),
        }
    }
}
