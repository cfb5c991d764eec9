mod kubernetes;

use std::sync::Arc;

use async_trait::async_trait;
use bucket_core::signal::ShutdownSignal;
use thiserror::Error;

use crate::key::ReconcileKey;

pub use self::kubernetes::KubeWatchCache;

/// Callbacks invoked on the cache's delivery task.
///
/// Implementations must not block: translate the object and hand it off.
#[async_trait]
pub trait EventHandler<K>
where
    Self: Send + Sync,
{
    async fn on_add(&self, object: &K);

    async fn on_update(&self, old: &K, new: &K);

    async fn on_delete(&self, object: &K);
}

/// An eventually-consistent local mirror of one resource type.
#[async_trait]
pub trait WatchCache
where
    Self: Send + Sync,
{
    type Object: 'static + Send + Sync;

    async fn add_event_handler(&self, handler: Arc<dyn EventHandler<Self::Object>>);

    /// Returns `true` once at least one full list has been observed.
    fn has_synced(&self) -> bool;

    fn get_by_key(&self, key: &ReconcileKey) -> Result<Option<Arc<Self::Object>>, CacheError>;

    /// Lists and watches until `signal` is terminated.
    async fn run(&self, signal: ShutdownSignal) -> Result<(), CacheError>;
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("watch cache is already running")]
    AlreadyRunning,
    #[error("watch stream has been closed unexpectedly")]
    Closed,
    #[error("failed to look up {key}: {message}")]
    Lookup { key: ReconcileKey, message: String },
}
