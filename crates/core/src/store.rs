use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{ResourceVersion, StoreError, TrackedObject, WatchFilter};

/// Result of a full list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPage {
    pub objects: Vec<TrackedObject>,
    /// Snapshot point of the list; the watch resumes from here.
    pub cursor: ResourceVersion,
}

/// Incremental change as delivered by the store's watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEvent {
    Added(TrackedObject),
    Modified(TrackedObject),
    /// Final state of the deleted object, at the deletion version.
    Deleted(TrackedObject),
    /// Cursor advance without an object change.
    Bookmark(ResourceVersion),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// Remote authoritative collection with list and watch-since-cursor.
///
/// A watch stream may end at any time (server-side timeout); callers resume
/// from the last cursor they observed.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, filter: &WatchFilter) -> Result<ListPage, StoreError>;

    async fn watch(&self, filter: &WatchFilter, cursor: &ResourceVersion) -> Result<WatchStream, StoreError>;
}
