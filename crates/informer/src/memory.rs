//! In-memory [`ObjectStore`] with a change history and fault injection.
//! Used by tests and demos in place of a real API server.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use kinformer_core::{
    ListPage, Metadata, ObjectKey, ObjectStore, ResourceVersion, StoreError, TrackedObject, WatchEvent, WatchFilter,
    WatchStream,
};
use tokio::sync::watch;

#[derive(Default)]
struct Inner {
    rv: u64,
    objects: BTreeMap<ObjectKey, TrackedObject>,
    history: Vec<Entry>,
    /// Watches from a cursor below this fail as expired.
    compacted: u64,
    /// Bumped to sever every open watch.
    session: u64,
    connected: bool,
    list_faults: VecDeque<StoreError>,
    watch_faults: VecDeque<StoreError>,
    list_calls: u64,
    watch_calls: u64,
}

/// One change-feed entry. `prev` is the object's state before a modification,
/// so label-selector watches can see it enter or leave their selection.
struct Entry {
    rv: u64,
    ev: WatchEvent,
    prev: Option<TrackedObject>,
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.rv += 1;
        self.rv
    }
}

struct Shared {
    inner: Mutex<Inner>,
    changed: watch::Sender<u64>,
}

impl Shared {
    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Mutate, then wake every open watch.
    fn mutate<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let out = self.with(f);
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
        out
    }
}

/// Cloneable handle to one in-memory collection. Clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0u64);
        let inner = Inner { connected: true, ..Default::default() };
        Self { shared: Arc::new(Shared { inner: Mutex::new(inner), changed }) }
    }

    /// Create or update `kind` `namespace/name`; returns the stored object.
    pub fn put(&self, namespace: Option<&str>, name: &str, kind: &str) -> TrackedObject {
        self.put_with(ObjectKey::new(namespace, name, kind), Metadata::default())
    }

    /// Create or update with explicit metadata. A UID is assigned on creation
    /// and kept across updates.
    pub fn put_with(&self, key: ObjectKey, mut meta: Metadata) -> TrackedObject {
        self.shared.mutate(|inner| {
            let rv = inner.bump();
            let prev = inner.objects.get(&key).cloned();
            meta.uid = prev.as_ref().and_then(|o| o.meta.uid).or_else(|| Some(uid_for(rv)));
            let obj = TrackedObject { key: key.clone(), version: rv.into(), meta };
            let ev = match prev {
                Some(_) => WatchEvent::Modified(obj.clone()),
                None => WatchEvent::Added(obj.clone()),
            };
            inner.objects.insert(key, obj.clone());
            inner.history.push(Entry { rv, ev, prev });
            obj
        })
    }

    /// Delete a key; the watch sees the final state at the deletion version.
    pub fn delete(&self, key: &ObjectKey) -> Option<TrackedObject> {
        self.shared.mutate(|inner| {
            let mut gone = inner.objects.remove(key)?;
            let rv = inner.bump();
            gone.version = rv.into();
            inner.history.push(Entry { rv, ev: WatchEvent::Deleted(gone.clone()), prev: None });
            Some(gone)
        })
    }

    /// Append a raw event to the change feed without touching stored state.
    pub fn inject(&self, ev: WatchEvent) {
        self.shared.mutate(|inner| {
            let rv = inner.bump();
            inner.history.push(Entry { rv, ev, prev: None });
        });
    }

    /// Emit a bookmark at the current version.
    pub fn bookmark(&self) {
        self.shared.mutate(|inner| {
            let rv = inner.bump();
            inner.history.push(Entry { rv, ev: WatchEvent::Bookmark(rv.into()), prev: None });
        });
    }

    /// Forget the change history; every cursor older than now expires.
    pub fn compact(&self) {
        self.shared.mutate(|inner| {
            inner.history.clear();
            inner.compacted = inner.rv;
        });
    }

    /// Sever open watches and fail every call until [`MemoryStore::reconnect`].
    pub fn disconnect(&self) {
        self.shared.mutate(|inner| {
            inner.connected = false;
            inner.session += 1;
        });
    }

    pub fn reconnect(&self) {
        self.shared.mutate(|inner| inner.connected = true);
    }

    /// Sever open watches; new watches succeed.
    pub fn drop_watches(&self) {
        self.shared.mutate(|inner| inner.session += 1);
    }

    pub fn fail_next_list(&self, e: StoreError) {
        self.shared.with(|inner| inner.list_faults.push_back(e));
    }

    pub fn fail_next_watch(&self, e: StoreError) {
        self.shared.with(|inner| inner.watch_faults.push_back(e));
    }

    /// Current state restricted to `filter`, ordered by key.
    pub fn objects(&self, filter: &WatchFilter) -> Vec<TrackedObject> {
        self.shared.with(|inner| inner.objects.values().filter(|o| selects(filter, o)).cloned().collect())
    }

    pub fn current_version(&self) -> ResourceVersion {
        self.shared.with(|inner| inner.rv.into())
    }

    pub fn list_calls(&self) -> u64 { self.shared.with(|inner| inner.list_calls) }

    pub fn watch_calls(&self) -> u64 { self.shared.with(|inner| inner.watch_calls) }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, filter: &WatchFilter) -> Result<ListPage, StoreError> {
        self.shared.with(|inner| {
            inner.list_calls += 1;
            if let Some(e) = inner.list_faults.pop_front() {
                return Err(e);
            }
            if !inner.connected {
                return Err(StoreError::Connection("store unreachable".into()));
            }
            let objects = inner.objects.values().filter(|o| selects(filter, o)).cloned().collect();
            Ok(ListPage { objects, cursor: inner.rv.into() })
        })
    }

    async fn watch(&self, filter: &WatchFilter, cursor: &ResourceVersion) -> Result<WatchStream, StoreError> {
        let pos = cursor.numeric().ok_or_else(|| StoreError::Malformed(format!("cursor {:?} is not numeric", cursor.as_str())))?;
        let session = self.shared.with(|inner| {
            inner.watch_calls += 1;
            if let Some(e) = inner.watch_faults.pop_front() {
                return Err(e);
            }
            if !inner.connected {
                return Err(StoreError::Connection("store unreachable".into()));
            }
            if pos < inner.compacted {
                return Err(StoreError::Expired(format!("cursor {} is older than {}", pos, inner.compacted)));
            }
            Ok(inner.session)
        })?;
        let state = WatchState {
            shared: Arc::clone(&self.shared),
            rx: self.shared.changed.subscribe(),
            filter: filter.clone(),
            pos,
            session,
            done: false,
        };
        Ok(futures::stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            loop {
                st.rx.borrow_and_update();
                match st.poll_history() {
                    Ready::Event(ev) => return Some((Ok(ev), st)),
                    Ready::Failed(e) => {
                        st.done = true;
                        return Some((Err(e), st));
                    }
                    Ready::Idle => {
                        if st.rx.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        })
        .boxed())
    }
}

struct WatchState {
    shared: Arc<Shared>,
    rx: watch::Receiver<u64>,
    filter: WatchFilter,
    pos: u64,
    session: u64,
    done: bool,
}

enum Ready {
    Event(WatchEvent),
    Failed(StoreError),
    Idle,
}

impl WatchState {
    fn poll_history(&mut self) -> Ready {
        let (pos, session) = (self.pos, self.session);
        let filter = &self.filter;
        let (next_pos, out) = self.shared.with(|inner| {
            if inner.session != session {
                return (pos, Ready::Failed(StoreError::Connection("watch connection reset".into())));
            }
            if pos < inner.compacted {
                return (pos, Ready::Failed(StoreError::Expired(format!("cursor {} compacted", pos))));
            }
            let start = inner.history.partition_point(|e| e.rv <= pos);
            let mut at = pos;
            for entry in &inner.history[start..] {
                at = entry.rv;
                if let Some(ev) = as_seen_by(filter, entry) {
                    return (at, Ready::Event(ev));
                }
            }
            (at, Ready::Idle)
        });
        self.pos = next_pos;
        out
    }
}

/// The event a watch with `filter` receives for `entry`, if any. A modification
/// that moves an object into or out of the selection arrives as an add or a delete.
fn as_seen_by(filter: &WatchFilter, entry: &Entry) -> Option<WatchEvent> {
    match &entry.ev {
        WatchEvent::Bookmark(_) => Some(entry.ev.clone()),
        WatchEvent::Added(o) | WatchEvent::Deleted(o) => selects(filter, o).then(|| entry.ev.clone()),
        WatchEvent::Modified(o) => {
            let now = selects(filter, o);
            let was = entry.prev.as_ref().map_or(now, |p| selects(filter, p));
            match (was, now) {
                (true, true) => Some(WatchEvent::Modified(o.clone())),
                (false, true) => Some(WatchEvent::Added(o.clone())),
                (true, false) => Some(WatchEvent::Deleted(o.clone())),
                (false, false) => None,
            }
        }
    }
}

/// Kind/namespace scope plus `k=v` / `k` label selector terms.
fn selects(filter: &WatchFilter, o: &TrackedObject) -> bool {
    if !filter.matches(o) {
        return false;
    }
    let Some(sel) = filter.label_selector.as_deref() else { return true };
    sel.split(',').map(str::trim).filter(|t| !t.is_empty()).all(|term| match term.split_once("!=") {
        Some((k, v)) => o.meta.label(k.trim()) != Some(v.trim()),
        None => match term.split_once('=') {
            Some((k, v)) => o.meta.label(k.trim()) == Some(v.trim_start_matches('=').trim()),
            None => o.meta.label(term).is_some(),
        },
    })
}

fn uid_for(rv: u64) -> kinformer_core::Uid {
    let mut uid = [0u8; 16];
    uid[8..].copy_from_slice(&rv.to_be_bytes());
    uid
}
