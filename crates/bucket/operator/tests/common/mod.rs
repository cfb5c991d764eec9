#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use bucket_api::bucket::{BucketCrd, BucketSpec};
use bucket_core::signal::ShutdownSignal;
use bucket_operator::{
    cache::{CacheError, EventHandler, WatchCache},
    key::ReconcileKey,
    lifecycle::{LifecycleHandler, LifecycleOutcome},
    queue::{ItemExponentialFailureRateLimiter, RateLimiter},
};
use bucket_storage::{BucketState, ObjectPage, ObjectStorage, Result, StorageError};
use tokio::time::sleep;

pub const NAMESPACE: &str = "default";

pub fn spec(bucket_name: &str, force_delete: bool) -> BucketSpec {
    BucketSpec {
        bucket_name: bucket_name.into(),
        region: String::new(),
        force_delete,
    }
}

pub fn bucket(name: &str, spec: BucketSpec) -> BucketCrd {
    let mut object = BucketCrd::new(name, spec);
    object.metadata.namespace = Some(NAMESPACE.into());
    object
}

pub fn key(name: &str) -> ReconcileKey {
    ReconcileKey::new(Some(NAMESPACE.into()), name)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    HeadBucket(String),
    CreateBucket(String),
    WaitUntilExists(String),
    ListObjects(String, Option<String>),
    DeleteObjects(String, usize),
    DeleteBucket(String),
    WaitUntilNotExists(String),
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::CreateBucket(_) | Self::DeleteObjects(..) | Self::DeleteBucket(_)
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    HeadBucket,
    CreateBucket,
    ListObjects,
    DeleteObjects,
    DeleteBucket,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    Network,
    AccessDenied,
    NoSuchBucket,
    AlreadyOwnedByYou,
}

impl Fault {
    fn into_error(self, bucket: &str) -> StorageError {
        match self {
            Self::Network => StorageError::Request(anyhow!("connection reset by peer")),
            Self::AccessDenied => StorageError::AccessDenied {
                code: "AccessDenied".into(),
                message: "Access Denied".into(),
            },
            Self::NoSuchBucket => StorageError::NoSuchBucket(bucket.into()),
            Self::AlreadyOwnedByYou => StorageError::AlreadyOwnedByYou(bucket.into()),
        }
    }
}

#[derive(Default)]
struct StorageState {
    buckets: BTreeMap<String, BTreeSet<String>>,
    calls: Vec<Call>,
    faults: HashMap<Op, (Fault, usize)>,
}

/// A strongly-consistent in-memory object storage that records every call.
pub struct FakeStorage {
    page_size: usize,
    state: Mutex<StorageState>,
}

impl Default for FakeStorage {
    fn default() -> Self {
        Self::with_page_size(1_000)
    }
}

impl FakeStorage {
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            state: Mutex::default(),
        }
    }

    pub fn with_bucket(self, name: &str, objects: usize) -> Self {
        self.state.lock().unwrap().buckets.insert(
            name.into(),
            (0..objects).map(|index| format!("obj-{index:06}")).collect(),
        );
        self
    }

    /// Fails the next `times` calls of `op`.
    pub fn fail(&self, op: Op, fault: Fault, times: usize) {
        self.state.lock().unwrap().faults.insert(op, (fault, times));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn has_bucket(&self, name: &str) -> bool {
        self.state.lock().unwrap().buckets.contains_key(name)
    }

    pub fn num_objects(&self, name: &str) -> Option<usize> {
        self.state
            .lock()
            .unwrap()
            .buckets
            .get(name)
            .map(BTreeSet::len)
    }

    fn begin(&self, op: Op, call: Call, bucket: &str) -> Result<MutexGuard<'_, StorageState>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);

        if let Some((fault, times)) = state.faults.get_mut(&op) {
            if *times > 0 {
                *times -= 1;
                return Err(fault.into_error(bucket));
            }
        }
        Ok(state)
    }

    fn wait(&self, call: Call, name: &str, expected: BucketState) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);

        let current = if state.buckets.contains_key(name) {
            BucketState::Exists
        } else {
            BucketState::NotFound
        };
        if current == expected {
            Ok(())
        } else {
            Err(StorageError::WaitTimeout {
                bucket: name.into(),
                state: expected,
                timeout: Duration::ZERO,
            })
        }
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn head_bucket(&self, name: &str) -> Result<BucketState> {
        let state = self.begin(Op::HeadBucket, Call::HeadBucket(name.into()), name)?;
        if state.buckets.contains_key(name) {
            Ok(BucketState::Exists)
        } else {
            Ok(BucketState::NotFound)
        }
    }

    async fn create_bucket(&self, name: &str, _region: Option<&str>) -> Result<()> {
        let mut state = self.begin(Op::CreateBucket, Call::CreateBucket(name.into()), name)?;
        if state.buckets.contains_key(name) {
            return Err(StorageError::AlreadyOwnedByYou(name.into()));
        }
        state.buckets.insert(name.into(), BTreeSet::default());
        Ok(())
    }

    async fn wait_until_exists(&self, name: &str, _timeout: Duration) -> Result<()> {
        self.wait(Call::WaitUntilExists(name.into()), name, BucketState::Exists)
    }

    async fn list_objects(
        &self,
        name: &str,
        continuation_token: Option<String>,
    ) -> Result<ObjectPage> {
        let state = self.begin(
            Op::ListObjects,
            Call::ListObjects(name.into(), continuation_token.clone()),
            name,
        )?;
        let objects = state
            .buckets
            .get(name)
            .ok_or_else(|| StorageError::NoSuchBucket(name.into()))?;

        let mut remaining = objects
            .iter()
            .filter(|key| match &continuation_token {
                Some(token) => key.as_str() > token.as_str(),
                None => true,
            })
            .cloned();
        let keys: Vec<_> = remaining.by_ref().take(self.page_size).collect();
        let is_truncated = remaining.next().is_some();

        Ok(ObjectPage {
            next_continuation_token: if is_truncated { keys.last().cloned() } else { None },
            keys,
            is_truncated,
        })
    }

    async fn delete_objects(&self, name: &str, keys: Vec<String>) -> Result<()> {
        let mut state = self.begin(
            Op::DeleteObjects,
            Call::DeleteObjects(name.into(), keys.len()),
            name,
        )?;
        let objects = state
            .buckets
            .get_mut(name)
            .ok_or_else(|| StorageError::NoSuchBucket(name.into()))?;
        for key in &keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn delete_bucket(&self, name: &str) -> Result<()> {
        let mut state = self.begin(Op::DeleteBucket, Call::DeleteBucket(name.into()), name)?;
        match state.buckets.remove(name) {
            Some(_) => Ok(()),
            None => Err(StorageError::NoSuchBucket(name.into())),
        }
    }

    async fn wait_until_not_exists(&self, name: &str, _timeout: Duration) -> Result<()> {
        self.wait(
            Call::WaitUntilNotExists(name.into()),
            name,
            BucketState::NotFound,
        )
    }
}

/// An in-memory watch cache whose content is driven by the test.
#[derive(Default)]
pub struct FakeCache {
    handlers: Mutex<Vec<Arc<dyn EventHandler<BucketCrd>>>>,
    objects: Mutex<HashMap<ReconcileKey, Arc<BucketCrd>>>,
    /// Never completes the initial list when `true`.
    stuck: bool,
    synced: AtomicBool,
}

impl FakeCache {
    pub fn stuck() -> Self {
        Self {
            stuck: true,
            ..Default::default()
        }
    }

    /// Stores `object` without notifying anyone.
    pub fn insert(&self, object: BucketCrd) {
        let key = ReconcileKey::try_from_object(&object).unwrap();
        self.objects.lock().unwrap().insert(key, Arc::new(object));
    }

    pub fn remove(&self, key: &ReconcileKey) -> Option<Arc<BucketCrd>> {
        self.objects.lock().unwrap().remove(key)
    }

    pub async fn apply(&self, object: BucketCrd) {
        let key = ReconcileKey::try_from_object(&object).unwrap();
        let object = Arc::new(object);
        let old = self
            .objects
            .lock()
            .unwrap()
            .insert(key, object.clone());

        for handler in self.handlers() {
            match &old {
                Some(old) => handler.on_update(old, &object).await,
                None => handler.on_add(&object).await,
            }
        }
    }

    pub async fn delete(&self, key: &ReconcileKey) {
        if let Some(object) = self.remove(key) {
            for handler in self.handlers() {
                handler.on_delete(&object).await;
            }
        }
    }

    /// Notifies the handlers of `object` without storing it.
    pub async fn notify_add(&self, object: &BucketCrd) {
        for handler in self.handlers() {
            handler.on_add(object).await;
        }
    }

    fn handlers(&self) -> Vec<Arc<dyn EventHandler<BucketCrd>>> {
        self.handlers.lock().unwrap().clone()
    }
}

#[async_trait]
impl WatchCache for FakeCache {
    type Object = BucketCrd;

    async fn add_event_handler(&self, handler: Arc<dyn EventHandler<Self::Object>>) {
        self.handlers.lock().unwrap().push(handler);
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn get_by_key(&self, key: &ReconcileKey) -> Result<Option<Arc<BucketCrd>>, CacheError> {
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    async fn run(&self, signal: ShutdownSignal) -> Result<(), CacheError> {
        if !self.stuck {
            self.synced.store(true, Ordering::SeqCst);
        }
        signal.wait_to_terminate().await;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerCall {
    Provision(BucketSpec),
    Teardown(BucketSpec),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Script {
    Succeed,
    Transient,
    Permanent,
}

#[derive(Default)]
struct HandlerState {
    active: BTreeMap<String, usize>,
    calls: Vec<HandlerCall>,
    max_active_per_bucket: usize,
    max_active: usize,
}

/// A lifecycle handler with a fixed behavior that tracks its concurrency.
pub struct ScriptedHandler {
    latency: Duration,
    script: Script,
    state: Mutex<HandlerState>,
}

impl ScriptedHandler {
    pub fn new(script: Script) -> Self {
        Self {
            latency: Duration::ZERO,
            script,
            state: Mutex::default(),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<HandlerCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn max_active_per_bucket(&self) -> usize {
        self.state.lock().unwrap().max_active_per_bucket
    }

    pub fn max_active(&self) -> usize {
        self.state.lock().unwrap().max_active
    }

    async fn handle(&self, call: HandlerCall, success: LifecycleOutcome) -> LifecycleOutcome {
        let (HandlerCall::Provision(spec) | HandlerCall::Teardown(spec)) = &call;
        let bucket = spec.bucket_name.clone();

        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call);

            let active = state.active.entry(bucket.clone()).or_default();
            *active += 1;
            let active = *active;
            state.max_active_per_bucket = state.max_active_per_bucket.max(active);

            let total: usize = state.active.values().sum();
            state.max_active = state.max_active.max(total);
        }

        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        if let Some(active) = self.state.lock().unwrap().active.get_mut(&bucket) {
            *active -= 1;
        }

        match self.script {
            Script::Succeed => success,
            Script::Transient => {
                LifecycleOutcome::TransientFailure(Fault::Network.into_error(&bucket))
            }
            Script::Permanent => {
                LifecycleOutcome::PermanentFailure(Fault::AccessDenied.into_error(&bucket))
            }
        }
    }
}

#[async_trait]
impl LifecycleHandler for ScriptedHandler {
    async fn provision(&self, spec: &BucketSpec) -> LifecycleOutcome {
        self.handle(HandlerCall::Provision(spec.clone()), LifecycleOutcome::Created)
            .await
    }

    async fn teardown(&self, spec: &BucketSpec) -> LifecycleOutcome {
        self.handle(HandlerCall::Teardown(spec.clone()), LifecycleOutcome::Deleted)
            .await
    }
}

/// Per-item exponential backoff that also counts how often keys are forgotten.
pub struct CountingRateLimiter {
    forgets: Arc<AtomicUsize>,
    inner: ItemExponentialFailureRateLimiter<ReconcileKey>,
}

impl Default for CountingRateLimiter {
    fn default() -> Self {
        Self {
            forgets: Arc::default(),
            inner: ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(5),
                Duration::from_secs(1_000),
            ),
        }
    }
}

impl CountingRateLimiter {
    /// Shares the number of forgotten keys, which outlives the queue owning `self`.
    pub fn forgets(&self) -> Arc<AtomicUsize> {
        self.forgets.clone()
    }
}

#[async_trait]
impl RateLimiter<ReconcileKey> for CountingRateLimiter {
    async fn when(&self, key: &ReconcileKey) -> Duration {
        self.inner.when(key).await
    }

    async fn forget(&self, key: &ReconcileKey) {
        self.forgets.fetch_add(1, Ordering::SeqCst);
        self.inner.forget(key).await
    }

    async fn num_requeues(&self, key: &ReconcileKey) -> usize {
        self.inner.num_requeues(key).await
    }
}

/// Polls `condition` until it holds, failing the test after a while.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition has not been met in time");
}
