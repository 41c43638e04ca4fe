//! kinformer core types: tracked objects, change records and the object store contract.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod config;
mod error;
mod filter;
mod store;

pub use config::{BackoffPolicy, InformerConfig};
pub use error::{ConfigError, StoreError};
pub use filter::WatchFilter;
pub use store::{ListPage, ObjectStore, WatchEvent, WatchStream};

pub type Uid = [u8; 16];

pub mod prelude {
    pub use super::{
        ChangeRecord, InformerConfig, ListPage, Metadata, Notification, ObjectKey, ObjectStore, ResourceVersion,
        StoreError, SyncBatch, TrackedObject, WatchEvent, WatchFilter,
    };
}

/// Composite identity of a tracked object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
    pub kind: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str, kind: &str) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.to_string(),
            kind: kind.to_string(),
        }
    }

    /// `namespace/name`, or just `name` for cluster-scoped objects.
    pub fn cache_key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Opaque, monotonically advancing token assigned by the object store.
///
/// Numeric tokens (etcd revisions) are ordered numerically. Anything else only
/// compares for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(v: impl Into<String>) -> Self { Self(v.into()) }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn numeric(&self) -> Option<u64> { self.0.parse::<u64>().ok() }

    /// Ordering between two tokens, if they are comparable at all.
    pub fn compare(&self, other: &ResourceVersion) -> Option<Ordering> {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ if self.0 == other.0 => Some(Ordering::Equal),
            _ => None,
        }
    }

    /// True only when `self` is provably older than `other`.
    pub fn is_older_than(&self, other: &ResourceVersion) -> bool {
        matches!(self.compare(other), Some(Ordering::Less))
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<u64> for ResourceVersion {
    fn from(v: u64) -> Self { Self(v.to_string()) }
}

impl From<&str> for ResourceVersion {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

/// Object metadata carried by the mirror. Never the full object body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub uid: Option<Uid>,
    /// Seconds since epoch; 0 when the store did not report it.
    pub creation_ts: i64,
    pub deletion_ts: Option<i64>,
    pub generation: Option<i64>,
    pub labels: SmallVec<[(String, String); 8]>,
    pub annotations: SmallVec<[(String, String); 4]>,
}

impl Metadata {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub key: ObjectKey,
    pub version: ResourceVersion,
    pub meta: Metadata,
}

impl TrackedObject {
    pub fn new(key: ObjectKey, version: impl Into<ResourceVersion>) -> Self {
        Self { key, version: version.into(), meta: Metadata::default() }
    }

    pub fn with_meta(mut self, meta: Metadata) -> Self {
        self.meta = meta;
        self
    }
}

/// Full list result handed from the reflector to the processing loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncBatch {
    pub objects: Vec<TrackedObject>,
    /// Cursor the watch resumes from after this batch.
    pub cursor: ResourceVersion,
}

/// One unit of work in the queue between reflector and processing loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChangeRecord {
    Added(TrackedObject),
    Updated(TrackedObject),
    Deleted { key: ObjectKey, last: Option<TrackedObject> },
    Synced(SyncBatch),
}

impl ChangeRecord {
    pub fn kind_str(&self) -> &'static str {
        match self {
            ChangeRecord::Added(_) => "added",
            ChangeRecord::Updated(_) => "updated",
            ChangeRecord::Deleted { .. } => "deleted",
            ChangeRecord::Synced(_) => "synced",
        }
    }

    /// Key of the affected object; `None` for a whole-list batch.
    pub fn key(&self) -> Option<&ObjectKey> {
        match self {
            ChangeRecord::Added(o) | ChangeRecord::Updated(o) => Some(&o.key),
            ChangeRecord::Deleted { key, .. } => Some(key),
            ChangeRecord::Synced(_) => None,
        }
    }
}

/// What handlers observe after a record has been applied to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Added { new: Arc<TrackedObject> },
    /// `old == new` on periodic resync.
    Updated { old: Arc<TrackedObject>, new: Arc<TrackedObject> },
    Deleted { key: ObjectKey, last: Option<Arc<TrackedObject>> },
}

impl Notification {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Notification::Added { new } => &new.key,
            Notification::Updated { new, .. } => &new.key,
            Notification::Deleted { key, .. } => key,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Notification::Added { .. } => "add",
            Notification::Updated { .. } => "update",
            Notification::Deleted { .. } => "delete",
        }
    }

    /// Latest known version for the affected key, if any.
    pub fn version(&self) -> Option<&ResourceVersion> {
        match self {
            Notification::Added { new } | Notification::Updated { new, .. } => Some(&new.version),
            Notification::Deleted { last, .. } => last.as_ref().map(|o| &o.version),
        }
    }
}
