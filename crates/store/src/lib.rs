//! kinformer store: the local indexer mirroring one watched collection.
//!
//! [`Indexer`] is the single writer and is owned by the processing loop.
//! [`CacheHandle`] is the cloneable read side; every read returns a snapshot
//! that may be stale as soon as it is returned. No lock is handed out.

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock};

use arc_swap::ArcSwap;
use kinformer_core::{ObjectKey, ResourceVersion, TrackedObject};
use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Frozen, key-ordered view of the cache at one epoch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheSnapshot {
    pub epoch: u64,
    pub items: Vec<Arc<TrackedObject>>,
}

/// Result of inserting or replacing one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    Inserted(Arc<TrackedObject>),
    Replaced { old: Arc<TrackedObject>, new: Arc<TrackedObject> },
    /// Same key, different UID: the object was deleted and created again.
    Recreated { old: Arc<TrackedObject>, new: Arc<TrackedObject> },
    /// Same version already cached; nothing changed.
    Unchanged(Arc<TrackedObject>),
    /// Incoming version is older than the cached one; ignored.
    Stale { current: Arc<TrackedObject>, incoming: ResourceVersion },
}

/// Result of removing one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    Removed(Arc<TrackedObject>),
    Missing,
    /// The deletion is older than what is cached (the key was recreated since).
    Stale { current: Arc<TrackedObject> },
}

/// Changes produced by replacing the whole cache with a list result.
#[derive(Debug, Clone, Default)]
pub struct Replaced {
    /// One entry per batch member, in batch order.
    pub upserts: Vec<Upsert>,
    /// Cached objects absent from the batch, ordered by key.
    pub removed: Vec<Arc<TrackedObject>>,
}

impl Upsert {
    /// Whether the cache content changed.
    pub fn is_change(&self) -> bool {
        matches!(self, Upsert::Inserted(_) | Upsert::Replaced { .. } | Upsert::Recreated { .. })
    }
}

#[derive(Default)]
struct State {
    epoch: u64,
    items: FxHashMap<ObjectKey, Arc<TrackedObject>>,
    by_namespace: FxHashMap<Option<String>, FxHashSet<ObjectKey>>,
}

impl State {
    fn insert(&mut self, obj: Arc<TrackedObject>) -> Option<Arc<TrackedObject>> {
        let key = obj.key.clone();
        self.by_namespace.entry(key.namespace.clone()).or_default().insert(key.clone());
        self.items.insert(key, obj)
    }

    fn remove(&mut self, key: &ObjectKey) -> Option<Arc<TrackedObject>> {
        let out = self.items.remove(key)?;
        if let Some(set) = self.by_namespace.get_mut(&key.namespace) {
            set.remove(key);
            if set.is_empty() {
                self.by_namespace.remove(&key.namespace);
            }
        }
        Some(out)
    }

    fn upsert(&mut self, obj: TrackedObject) -> Upsert {
        match self.items.get(&obj.key).cloned() {
            None => {
                let new = Arc::new(obj);
                self.insert(Arc::clone(&new));
                Upsert::Inserted(new)
            }
            Some(current) if obj.version.is_older_than(&current.version) => {
                Upsert::Stale { incoming: obj.version, current }
            }
            Some(current) if obj.version == current.version && *current == obj => Upsert::Unchanged(current),
            Some(old) => {
                let recreated = matches!((old.meta.uid, obj.meta.uid), (Some(a), Some(b)) if a != b);
                let new = Arc::new(obj);
                self.insert(Arc::clone(&new));
                if recreated {
                    Upsert::Recreated { old, new }
                } else {
                    Upsert::Replaced { old, new }
                }
            }
        }
    }
}

struct Shared {
    state: RwLock<State>,
    frozen: ArcSwap<CacheSnapshot>,
    epoch_tx: watch::Sender<u64>,
}

impl Shared {
    fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

/// Writer side of the cache. Not `Clone`: whoever owns it is the only mutator.
pub struct Indexer {
    shared: Arc<Shared>,
}

/// Read side of the cache, cheap to clone and safe to use from handlers.
#[derive(Clone)]
pub struct CacheHandle {
    shared: Arc<Shared>,
}

impl Indexer {
    pub fn new() -> (Indexer, CacheHandle) {
        let (epoch_tx, _) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            state: RwLock::new(State::default()),
            frozen: ArcSwap::from_pointee(CacheSnapshot::default()),
            epoch_tx,
        });
        (Indexer { shared: Arc::clone(&shared) }, CacheHandle { shared })
    }

    pub fn handle(&self) -> CacheHandle {
        CacheHandle { shared: Arc::clone(&self.shared) }
    }

    /// Insert or replace by key; never moves a key back to an older version.
    pub fn upsert(&mut self, obj: TrackedObject) -> Upsert {
        let (res, epoch) = self.shared.write(|st| {
            let res = st.upsert(obj);
            if res.is_change() {
                st.epoch += 1;
            }
            (res, st.epoch)
        });
        if let Upsert::Stale { current, incoming } = &res {
            debug!(key = %current.key, cached = %current.version, incoming = %incoming, "ignoring stale object version");
        }
        self.publish(epoch);
        res
    }

    /// Remove a key. `version` is the deletion's version when known; a deletion
    /// older than the cached object is ignored.
    pub fn delete(&mut self, key: &ObjectKey, version: Option<&ResourceVersion>) -> Removal {
        let (res, epoch) = self.shared.write(|st| {
            let res = match st.items.get(key).cloned() {
                None => Removal::Missing,
                Some(current) if version.map(|v| v.is_older_than(&current.version)).unwrap_or(false) => {
                    Removal::Stale { current }
                }
                Some(_) => match st.remove(key) {
                    Some(old) => {
                        st.epoch += 1;
                        Removal::Removed(old)
                    }
                    None => Removal::Missing,
                },
            };
            (res, st.epoch)
        });
        match &res {
            Removal::Missing => trace!(key = %key, "delete for uncached key"),
            Removal::Stale { current } => debug!(key = %key, cached = %current.version, "ignoring stale deletion"),
            Removal::Removed(_) => {}
        }
        self.publish(epoch);
        res
    }

    /// Make the cache equal to `objects`: upsert each, drop every cached key not present.
    pub fn replace(&mut self, objects: Vec<TrackedObject>) -> Replaced {
        let (out, epoch) = self.shared.write(|st| {
            let keep: FxHashSet<ObjectKey> = objects.iter().map(|o| o.key.clone()).collect();
            let mut out = Replaced { upserts: Vec::with_capacity(objects.len()), removed: Vec::new() };
            let mut changed = false;
            for obj in objects {
                let res = st.upsert(obj);
                changed |= res.is_change();
                out.upserts.push(res);
            }
            let mut gone: Vec<ObjectKey> = st.items.keys().filter(|k| !keep.contains(*k)).cloned().collect();
            gone.sort_unstable();
            for key in gone {
                if let Some(old) = st.remove(&key) {
                    out.removed.push(old);
                }
            }
            if changed || !out.removed.is_empty() {
                st.epoch += 1;
            }
            (out, st.epoch)
        });
        debug!(upserts = out.upserts.len(), removed = out.removed.len(), epoch, "cache replaced");
        self.publish(epoch);
        out
    }

    fn publish(&self, epoch: u64) {
        self.shared.epoch_tx.send_if_modified(|cur| {
            if *cur != epoch {
                *cur = epoch;
                true
            } else {
                false
            }
        });
        gauge!("kinformer_cache_objects", self.shared.read(|st| st.items.len()) as f64);
    }
}

impl CacheHandle {
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<TrackedObject>> {
        self.shared.read(|st| st.items.get(key).cloned())
    }

    /// Lookup by `namespace/name` (or `name`) within this cache.
    pub fn get_by_cache_key(&self, cache_key: &str) -> Option<Arc<TrackedObject>> {
        let (ns, name) = match cache_key.split_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, cache_key),
        };
        self.shared.read(|st| {
            st.by_namespace
                .get(&ns.map(str::to_string))
                .and_then(|keys| keys.iter().find(|k| k.name == name))
                .and_then(|k| st.items.get(k).cloned())
        })
    }

    pub fn len(&self) -> usize { self.shared.read(|st| st.items.len()) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn epoch(&self) -> u64 { self.shared.read(|st| st.epoch) }

    /// Cached keys, ordered.
    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self.shared.read(|st| st.items.keys().cloned().collect());
        keys.sort_unstable();
        keys
    }

    /// Objects in one namespace (`None` = cluster-scoped), ordered by key.
    pub fn list_namespace(&self, namespace: Option<&str>) -> Vec<Arc<TrackedObject>> {
        let mut out: Vec<_> = self.shared.read(|st| {
            st.by_namespace
                .get(&namespace.map(str::to_string))
                .map(|keys| keys.iter().filter_map(|k| st.items.get(k).cloned()).collect())
                .unwrap_or_default()
        });
        out.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Namespaces with at least one cached object.
    pub fn namespaces(&self) -> Vec<String> {
        let mut out: Vec<String> = self.shared.read(|st| st.by_namespace.keys().flatten().cloned().collect());
        out.sort_unstable();
        out
    }

    /// Key-ordered frozen view; reused across calls while the cache is unchanged.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        let cur = self.shared.frozen.load_full();
        if cur.epoch == self.epoch() {
            return cur;
        }
        let next = self.shared.read(|st| {
            let mut items: Vec<_> = st.items.values().cloned().collect();
            items.sort_unstable_by(|a, b| a.key.cmp(&b.key));
            Arc::new(CacheSnapshot { epoch: st.epoch, items })
        });
        self.shared.frozen.store(Arc::clone(&next));
        next
    }

    /// Epoch notifications; the value changes on every effective mutation.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.shared.epoch_tx.subscribe() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(ns: Option<&str>, name: &str, rv: u64) -> TrackedObject {
        TrackedObject::new(ObjectKey::new(ns, name, "v1/Secret"), rv)
    }

    #[test]
    fn upsert_inserts_replaces_and_rejects_stale() {
        let (mut ix, cache) = Indexer::new();
        assert!(matches!(ix.upsert(obj(Some("ns"), "a", 1)), Upsert::Inserted(_)));
        assert!(matches!(ix.upsert(obj(Some("ns"), "a", 3)), Upsert::Replaced { .. }));
        match ix.upsert(obj(Some("ns"), "a", 2)) {
            Upsert::Stale { current, incoming } => {
                assert_eq!(current.version, ResourceVersion::from(3));
                assert_eq!(incoming, ResourceVersion::from(2));
            }
            other => panic!("expected stale, got {:?}", other),
        }
        assert!(matches!(ix.upsert(obj(Some("ns"), "a", 3)), Upsert::Unchanged(_)));
        let got = cache.get(&ObjectKey::new(Some("ns"), "a", "v1/Secret")).unwrap();
        assert_eq!(got.version, ResourceVersion::from(3));
        assert_eq!(cache.epoch(), 2);
    }

    #[test]
    fn differing_uid_is_reported_as_recreation() {
        let (mut ix, _cache) = Indexer::new();
        let mut first = obj(Some("ns"), "a", 1);
        first.meta.uid = Some([1u8; 16]);
        let mut second = obj(Some("ns"), "a", 9);
        second.meta.uid = Some([2u8; 16]);
        ix.upsert(first);
        assert!(matches!(ix.upsert(second), Upsert::Recreated { .. }));
    }

    #[test]
    fn delete_honours_versions() {
        let (mut ix, cache) = Indexer::new();
        ix.upsert(obj(Some("ns"), "a", 5));
        let key = ObjectKey::new(Some("ns"), "a", "v1/Secret");
        assert!(matches!(ix.delete(&key, Some(&ResourceVersion::from(4))), Removal::Stale { .. }));
        assert_eq!(cache.len(), 1);
        assert!(matches!(ix.delete(&key, Some(&ResourceVersion::from(6))), Removal::Removed(_)));
        assert!(cache.is_empty());
        assert_eq!(ix.delete(&key, None), Removal::Missing);
    }

    #[test]
    fn replace_reports_removed_keys_in_order() {
        let (mut ix, cache) = Indexer::new();
        ix.upsert(obj(Some("ns"), "c", 1));
        ix.upsert(obj(Some("ns"), "b", 1));
        ix.upsert(obj(Some("ns"), "a", 1));
        let out = ix.replace(vec![obj(Some("ns"), "a", 2)]);
        assert_eq!(out.upserts.len(), 1);
        assert!(matches!(out.upserts[0], Upsert::Replaced { .. }));
        let removed: Vec<_> = out.removed.iter().map(|o| o.key.name.clone()).collect();
        assert_eq!(removed, vec!["b", "c"]);
        assert_eq!(cache.keys(), vec![ObjectKey::new(Some("ns"), "a", "v1/Secret")]);
    }

    #[test]
    fn namespace_index_tracks_membership() {
        let (mut ix, cache) = Indexer::new();
        ix.upsert(obj(Some("prod"), "a", 1));
        ix.upsert(obj(Some("prod"), "b", 1));
        ix.upsert(obj(Some("dev"), "a", 1));
        ix.upsert(obj(None, "node", 1));
        assert_eq!(cache.namespaces(), vec!["dev".to_string(), "prod".to_string()]);
        assert_eq!(cache.list_namespace(Some("prod")).len(), 2);
        assert_eq!(cache.list_namespace(None).len(), 1);
        ix.delete(&ObjectKey::new(Some("dev"), "a", "v1/Secret"), None);
        assert_eq!(cache.namespaces(), vec!["prod".to_string()]);
        assert_eq!(cache.get_by_cache_key("prod/b").map(|o| o.key.name.clone()), Some("b".into()));
        assert!(cache.get_by_cache_key("node").is_some());
        assert!(cache.get_by_cache_key("dev/a").is_none());
    }

    #[test]
    fn snapshot_is_reused_until_mutation() {
        let (mut ix, cache) = Indexer::new();
        ix.upsert(obj(Some("ns"), "b", 1));
        ix.upsert(obj(Some("ns"), "a", 1));
        let s1 = cache.snapshot();
        let s2 = cache.snapshot();
        assert!(Arc::ptr_eq(&s1, &s2));
        assert_eq!(s1.items[0].key.name, "a");
        ix.upsert(obj(Some("ns"), "a", 2));
        let s3 = cache.snapshot();
        assert!(s3.epoch > s1.epoch);
        assert_eq!(s3.items[0].version, ResourceVersion::from(2));
    }
}
