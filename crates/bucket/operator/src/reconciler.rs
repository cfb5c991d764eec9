use std::sync::Arc;

use bucket_api::bucket::BucketCrd;
use tracing::{error, info, instrument, warn, Level};

use crate::{
    cache::WatchCache,
    error::{Error, Result},
    key::Notification,
    lifecycle::{LifecycleHandler, LifecycleOutcome},
    queue::WorkQueue,
};

pub const DEFAULT_MAX_RETRIES: usize = 5;

pub struct Reconciler<C> {
    cache: Arc<C>,
    handler: Arc<dyn LifecycleHandler>,
    max_retries: usize,
    queue: Arc<WorkQueue<Notification>>,
}

impl<C> Reconciler<C>
where
    C: WatchCache<Object = BucketCrd>,
{
    pub fn new(
        cache: Arc<C>,
        queue: Arc<WorkQueue<Notification>>,
        handler: Arc<dyn LifecycleHandler>,
        max_retries: usize,
    ) -> Self {
        Self {
            cache,
            handler,
            max_retries,
            queue,
        }
    }

    /// Processes one queued notification.
    ///
    /// Returns `false` only when the queue is shutting down.
    pub async fn process_next_item(&self) -> bool {
        let notification = match self.queue.get().await {
            Some(notification) => notification,
            None => return false,
        };
        let key = notification.key.clone();

        let result = self.reconcile(&notification).await;
        self.handle_result(notification, result).await;

        self.queue.done(&key).await;
        true
    }

    #[instrument(level = Level::INFO, skip_all, fields(key = %notification.key))]
    async fn reconcile(&self, notification: &Notification) -> Result<Option<LifecycleOutcome>> {
        let live = self.cache.get_by_key(&notification.key)?;
        let live_bucket = live.as_ref().map(|object| object.spec.bucket_name.as_str());

        // buckets of deleted incarnations go first, unless the live one reuses them
        let mut outcome = None;
        for last_known in notification.tombstones() {
            if live_bucket == Some(last_known.bucket_name.as_str()) {
                continue;
            }
            let torn_down = Self::check(self.handler.teardown(last_known).await)?;
            info!(bucket = %last_known.bucket_name, outcome = %torn_down, "tore down");
            outcome = Some(torn_down);
        }

        match live {
            Some(object) => Self::check(self.handler.provision(&object.spec).await).map(Some),
            None if notification.tombstones().is_empty() => {
                info!("resource no longer exists; nothing to reconcile");
                Ok(None)
            }
            None => Ok(outcome),
        }
    }

    fn check(outcome: LifecycleOutcome) -> Result<LifecycleOutcome> {
        match outcome {
            LifecycleOutcome::TransientFailure(error) => Err(Error::Transient(error)),
            LifecycleOutcome::PermanentFailure(error) => Err(Error::Permanent(error)),
            outcome => Ok(outcome),
        }
    }

    async fn handle_result(
        &self,
        notification: Notification,
        result: Result<Option<LifecycleOutcome>>,
    ) {
        let key = &notification.key;
        match result {
            Ok(outcome) => {
                if let Some(outcome) = outcome {
                    info!(%key, %outcome, "reconciled");
                }
                self.queue.forget(key).await;
            }
            Err(error) if error.is_retryable() => {
                let requeues = self.queue.num_requeues(key).await;
                if requeues < self.max_retries {
                    warn!(%key, requeues, "failed to process item, retrying: {error}");
                    self.queue.add_rate_limited(notification).await;
                } else {
                    error!(%key, requeues, "failed to process item, no more retries: {error}");
                    self.queue.forget(key).await;
                }
            }
            Err(error) => {
                error!(%key, "failed to process item, not retryable: {error}");
                self.queue.forget(key).await;
            }
        }
    }
}
