use std::fmt;

use bucket_api::bucket::BucketSpec;
use kube::{Resource, ResourceExt};
use thiserror::Error;

/// Stable identity of one resource: `namespace/name`, or `name` for
/// cluster-scoped resources.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReconcileKey {
    namespace: Option<String>,
    name: String,
}

impl ReconcileKey {
    pub fn new(namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    pub fn try_from_object<K>(object: &K) -> Result<Self, KeyError>
    where
        K: Resource,
    {
        match object.meta().name.as_deref() {
            Some(name) if !name.is_empty() => Ok(Self::new(object.namespace(), name)),
            _ => Err(KeyError::MissingName),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ReconcileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{name}", name = &self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("object has no name")]
    MissingName,
}

/// A value built by a watch callback and handed to the queue.
///
/// Notifications of one key are merged while pending: the specs of deleted
/// incarnations are kept as tombstones, so a quick delete and re-create
/// still tears the old bucket down.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub key: ReconcileKey,
    tombstones: Vec<BucketSpec>,
}

impl Notification {
    pub fn applied(key: ReconcileKey) -> Self {
        Self {
            key,
            tombstones: Vec::default(),
        }
    }

    pub fn deleted(key: ReconcileKey, last_known: BucketSpec) -> Self {
        Self {
            key,
            tombstones: vec![last_known],
        }
    }

    /// Returns the final specs of the deleted incarnations, oldest first.
    pub fn tombstones(&self) -> &[BucketSpec] {
        &self.tombstones
    }

    /// Appends `tombstones`, keeping one spec per bucket name.
    fn bury(&mut self, tombstones: Vec<BucketSpec>) {
        for spec in tombstones {
            self.tombstones
                .retain(|buried| buried.bucket_name != spec.bucket_name);
            self.tombstones.push(spec);
        }
    }
}

impl crate::queue::Keyed for Notification {
    type Key = ReconcileKey;

    fn key(&self) -> &Self::Key {
        &self.key
    }

    fn merge(&mut self, mut other: Self, newer: bool) {
        if newer {
            self.bury(other.tombstones);
        } else {
            other.bury(::std::mem::take(&mut self.tombstones));
            self.tombstones = other.tombstones;
        }
    }
}
