use std::{
    collections::HashMap,
    fmt,
    pin::pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bucket_core::signal::ShutdownSignal;
use futures::{future, StreamExt};
use kube::{
    runtime::{
        reflector::{self, store::Writer, ObjectRef, Store},
        watcher::{self, watcher, Config, Event},
        WatchStreamExt,
    },
    Api, Resource,
};
use serde::de::DeserializeOwned;
use tokio::{
    select,
    sync::{Mutex, RwLock},
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, instrument, warn, Level};

use super::{CacheError, EventHandler, WatchCache};
use crate::key::ReconcileKey;

/// The reflector store plus the handlers fed from it.
///
/// Tells adds from updates by looking the object up before the writer applies
/// the event, and turns objects missing from a relist into deletes.
struct Mirror<K>
where
    K: 'static + Clone + Resource<DynamicType = ()>,
{
    handlers: RwLock<Vec<Arc<dyn EventHandler<K>>>>,
    has_synced: AtomicBool,
    store: Store<K>,
}

impl<K> Mirror<K>
where
    K: 'static + Clone + fmt::Debug + Resource<DynamicType = ()> + Send + Sync,
{
    fn new(store: Store<K>) -> Self {
        Self {
            handlers: RwLock::default(),
            has_synced: AtomicBool::new(false),
            store,
        }
    }

    async fn apply(&self, writer: &mut Writer<K>, event: Event<K>) {
        let handlers = self.handlers.read().await;

        match &event {
            Event::Applied(object) => {
                let old = self.store.get(&ObjectRef::from_obj(object));
                writer.apply_watcher_event(&event);

                for handler in handlers.iter() {
                    match &old {
                        Some(old) => handler.on_update(old, object).await,
                        None => handler.on_add(object).await,
                    }
                }
            }
            Event::Deleted(object) => {
                writer.apply_watcher_event(&event);

                for handler in handlers.iter() {
                    handler.on_delete(object).await;
                }
            }
            Event::Restarted(objects) => {
                let mut stale: HashMap<_, _> = self
                    .store
                    .state()
                    .into_iter()
                    .map(|object| (ObjectRef::from_obj(object.as_ref()), object))
                    .collect();
                writer.apply_watcher_event(&event);

                for object in objects {
                    let old = stale.remove(&ObjectRef::from_obj(object));
                    for handler in handlers.iter() {
                        match &old {
                            Some(old) => handler.on_update(old, object).await,
                            None => handler.on_add(object).await,
                        }
                    }
                }

                // objects deleted while the watch was down
                for object in stale.into_values() {
                    for handler in handlers.iter() {
                        handler.on_delete(&object).await;
                    }
                }

                if !self.has_synced.swap(true, Ordering::SeqCst) {
                    info!(
                        "initial list of {kind} completed ({count} objects)",
                        kind = K::kind(&()),
                        count = objects.len(),
                    );
                }
            }
        }
    }

    async fn resync(&self) {
        let objects = self.store.state();
        debug!(
            "resyncing {count} {kind} objects",
            count = objects.len(),
            kind = K::kind(&()),
        );

        let handlers = self.handlers.read().await;
        for object in objects {
            for handler in handlers.iter() {
                handler.on_update(&object, &object).await;
            }
        }
    }
}

/// A [`WatchCache`] backed by a `kube` watcher and reflector store.
pub struct KubeWatchCache<K>
where
    K: 'static + Clone + Resource<DynamicType = ()>,
{
    api: Api<K>,
    config: Config,
    mirror: Mirror<K>,
    resync_period: Option<Duration>,
    writer: Mutex<Option<Writer<K>>>,
}

impl<K> KubeWatchCache<K>
where
    K: 'static + Clone + fmt::Debug + DeserializeOwned + Resource<DynamicType = ()> + Send + Sync,
{
    pub fn new(api: Api<K>, resync_period: Option<Duration>) -> Self {
        let (store, writer) = reflector::store();
        Self {
            api,
            config: Config::default(),
            mirror: Mirror::new(store),
            resync_period: resync_period.filter(|period| !period.is_zero()),
            writer: Mutex::new(Some(writer)),
        }
    }
}

#[async_trait]
impl<K> WatchCache for KubeWatchCache<K>
where
    K: 'static + Clone + fmt::Debug + DeserializeOwned + Resource<DynamicType = ()> + Send + Sync,
{
    type Object = K;

    async fn add_event_handler(&self, handler: Arc<dyn EventHandler<Self::Object>>) {
        self.mirror.handlers.write().await.push(handler);
    }

    fn has_synced(&self) -> bool {
        self.mirror.has_synced.load(Ordering::SeqCst)
    }

    fn get_by_key(&self, key: &ReconcileKey) -> Result<Option<Arc<Self::Object>>, CacheError> {
        let object_ref = match key.namespace() {
            Some(namespace) => ObjectRef::new(key.name()).within(namespace),
            None => ObjectRef::new(key.name()),
        };
        Ok(self.mirror.store.get(&object_ref))
    }

    #[instrument(level = Level::INFO, skip_all, fields(kind = %K::kind(&())), err(Display))]
    async fn run(&self, signal: ShutdownSignal) -> Result<(), CacheError> {
        let mut writer = self
            .writer
            .lock()
            .await
            .take()
            .ok_or(CacheError::AlreadyRunning)?;

        enum Step<K> {
            Event(Option<Result<Event<K>, watcher::Error>>),
            Resync,
            Terminate,
        }

        async fn tick(resync: &mut Option<Interval>) {
            match resync {
                Some(interval) => {
                    interval.tick().await;
                }
                None => future::pending().await,
            }
        }

        let mut resync = self.resync_period.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut stream = pin!(watcher(self.api.clone(), self.config.clone()).default_backoff());

        info!("watching {kind}", kind = K::kind(&()));
        let result = loop {
            let step = select! {
                () = signal.wait_to_terminate() => Step::Terminate,
                () = tick(&mut resync) => Step::Resync,
                event = stream.next() => Step::Event(event),
            };

            match step {
                Step::Event(Some(Ok(event))) => self.mirror.apply(&mut writer, event).await,
                Step::Event(Some(Err(error))) => {
                    warn!("failed to watch {kind}: {error}", kind = K::kind(&()));
                }
                Step::Event(None) => break Err(CacheError::Closed),
                Step::Resync => self.mirror.resync().await,
                Step::Terminate => break Ok(()),
            }
        };

        info!("stopped watching {kind}", kind = K::kind(&()));
        *self.writer.lock().await = Some(writer);
        result
    }
}
