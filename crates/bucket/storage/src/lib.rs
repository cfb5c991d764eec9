mod error;
#[cfg(feature = "s3")]
pub mod s3;

use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, Level};

pub use self::error::StorageError;

pub type Result<T, E = StorageError> = ::core::result::Result<T, E>;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum BucketState {
    Exists,
    NotFound,
}

/// One page of a bucket listing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectPage {
    pub keys: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

impl ObjectPage {
    pub fn has_more(&self) -> bool {
        self.is_truncated
    }
}

#[async_trait]
pub trait ObjectStorage
where
    Self: Send + Sync,
{
    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }

    async fn head_bucket(&self, name: &str) -> Result<BucketState>;

    async fn create_bucket(&self, name: &str, region: Option<&str>) -> Result<()>;

    async fn wait_until_exists(&self, name: &str, timeout: Duration) -> Result<()> {
        wait_until(self, name, BucketState::Exists, timeout).await
    }

    async fn list_objects(
        &self,
        name: &str,
        continuation_token: Option<String>,
    ) -> Result<ObjectPage>;

    async fn delete_objects(&self, name: &str, keys: Vec<String>) -> Result<()>;

    async fn delete_bucket(&self, name: &str) -> Result<()>;

    async fn wait_until_not_exists(&self, name: &str, timeout: Duration) -> Result<()> {
        wait_until(self, name, BucketState::NotFound, timeout).await
    }
}

/// Polls [`ObjectStorage::head_bucket`] every `poll_interval` until the bucket
/// reaches `state`, giving up once `timeout` has elapsed.
#[instrument(level = Level::INFO, skip(storage), err(Display))]
pub async fn wait_until<S>(
    storage: &S,
    name: &str,
    state: BucketState,
    timeout: Duration,
) -> Result<()>
where
    S: ?Sized + ObjectStorage,
{
    let interval = storage.poll_interval();
    let deadline = Instant::now() + timeout;

    loop {
        let current = storage.head_bucket(name).await?;
        if current == state {
            return Ok(());
        }

        if Instant::now() + interval > deadline {
            return Err(StorageError::WaitTimeout {
                bucket: name.into(),
                state,
                timeout,
            });
        }
        debug!("waiting for bucket {name:?} to be {state} (currently {current})");
        sleep(interval).await;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Parser)]
pub struct WaitArgs {
    #[arg(
        long,
        env = "BUCKET_WAIT_INTERVAL_MS",
        value_name = "MS",
        default_value_t = 5_000
    )]
    pub wait_interval_ms: u64,

    #[arg(
        long,
        env = "BUCKET_WAIT_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 100_000
    )]
    pub wait_timeout_ms: u64,
}

impl Default for WaitArgs {
    fn default() -> Self {
        Self {
            wait_interval_ms: 5_000,
            wait_timeout_ms: 100_000,
        }
    }
}

impl WaitArgs {
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}
