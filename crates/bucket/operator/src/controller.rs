use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bucket_api::bucket::BucketCrd;
use bucket_core::signal::ShutdownSignal;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::{
    sync::watch,
    time::{sleep, Instant},
};
use tracing::{error, info, instrument, warn, Level};

use crate::{
    cache::{EventHandler, WatchCache},
    error::{Error, Result},
    key::{Notification, ReconcileKey},
    lifecycle::LifecycleHandler,
    queue::WorkQueue,
    reconciler::{Reconciler, DEFAULT_MAX_RETRIES},
};

const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerPhase {
    Created,
    Watching,
    CacheSyncing,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControllerOptions {
    pub workers: usize,
    pub max_retries: usize,
    /// Gives up on the initial list after this long; waits forever if `None`.
    pub sync_timeout: Option<Duration>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            max_retries: DEFAULT_MAX_RETRIES,
            sync_timeout: None,
        }
    }
}

/// Translates watch callbacks into queued notifications.
struct QueueEventHandler {
    queue: Arc<WorkQueue<Notification>>,
}

impl QueueEventHandler {
    fn key_of(object: &BucketCrd) -> Option<ReconcileKey> {
        match ReconcileKey::try_from_object(object).map_err(Error::from) {
            Ok(key) => Some(key),
            Err(error) => {
                error!("dropping bucket event: {error}");
                None
            }
        }
    }
}

#[async_trait]
impl EventHandler<BucketCrd> for QueueEventHandler {
    async fn on_add(&self, object: &BucketCrd) {
        if let Some(key) = Self::key_of(object) {
            self.queue.add(Notification::applied(key)).await
        }
    }

    async fn on_update(&self, _old: &BucketCrd, new: &BucketCrd) {
        if let Some(key) = Self::key_of(new) {
            self.queue.add(Notification::applied(key)).await
        }
    }

    async fn on_delete(&self, object: &BucketCrd) {
        if let Some(key) = Self::key_of(object) {
            self.queue
                .add(Notification::deleted(key, object.spec.clone()))
                .await
        }
    }
}

pub struct Controller<C> {
    cache: Arc<C>,
    options: ControllerOptions,
    phase: watch::Sender<ControllerPhase>,
    queue: Arc<WorkQueue<Notification>>,
    reconciler: Arc<Reconciler<C>>,
}

impl<C> Controller<C>
where
    C: 'static + WatchCache<Object = BucketCrd>,
{
    pub async fn new(
        cache: Arc<C>,
        handler: Arc<dyn LifecycleHandler>,
        queue: Arc<WorkQueue<Notification>>,
        options: ControllerOptions,
    ) -> Self {
        cache
            .add_event_handler(Arc::new(QueueEventHandler {
                queue: queue.clone(),
            }))
            .await;

        let reconciler = Arc::new(Reconciler::new(
            cache.clone(),
            queue.clone(),
            handler,
            options.max_retries,
        ));
        let (phase, _) = watch::channel(ControllerPhase::Created);

        Self {
            cache,
            options,
            phase,
            queue,
            reconciler,
        }
    }

    pub fn phase(&self) -> ControllerPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ControllerPhase> {
        self.phase.subscribe()
    }

    fn transit(&self, phase: ControllerPhase) {
        info!("controller phase: {phase}");
        self.phase.send_replace(phase);
    }

    /// Runs until `signal` is terminated, draining the workers on the way out.
    #[instrument(level = Level::INFO, skip_all, err(Display))]
    pub async fn run(&self, signal: ShutdownSignal) -> Result<()> {
        self.transit(ControllerPhase::Watching);
        let cache_task = {
            let cache = self.cache.clone();
            let signal = signal.clone();
            ::tokio::spawn(async move { cache.run(signal).await })
        };

        self.transit(ControllerPhase::CacheSyncing);
        if let Err(error) = self.wait_for_cache_sync(&signal).await {
            cache_task.abort();
            self.queue.shut_down().await;
            self.transit(ControllerPhase::Stopped);
            return Err(error);
        }

        self.transit(ControllerPhase::Running);
        let workers: Vec<_> = (0..self.options.workers.max(1))
            .map(|id| {
                let reconciler = self.reconciler.clone();
                ::tokio::spawn(async move {
                    while reconciler.process_next_item().await {}
                    info!("worker {id} has been stopped");
                })
            })
            .collect();

        signal.wait_to_terminate().await;
        self.transit(ControllerPhase::ShuttingDown);

        // in-flight items are completed; nothing new is handed out
        self.queue.shut_down().await;
        for result in join_all(workers).await {
            if let Err(error) = result {
                error!("failed to join a worker: {error}");
            }
        }

        match cache_task.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!("failed to stop the watch cache cleanly: {error}"),
            Err(error) => error!("failed to join the watch cache: {error}"),
        }

        self.transit(ControllerPhase::Stopped);
        Ok(())
    }

    async fn wait_for_cache_sync(&self, signal: &ShutdownSignal) -> Result<()> {
        let deadline = self.options.sync_timeout.map(|timeout| Instant::now() + timeout);

        loop {
            if self.cache.has_synced() {
                info!("watch cache has been synced");
                return Ok(());
            }
            if signal.is_terminating() {
                return Err(Error::Synchronization(
                    "terminated before the initial list".into(),
                ));
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(Error::Synchronization(format!(
                        "timed out after {:?}",
                        self.options.sync_timeout.unwrap_or_default(),
                    )));
                }
            }
            sleep(SYNC_POLL_INTERVAL).await;
        }
    }
}
