//! List-then-watch against an [`ObjectStore`], feeding the work queue.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use kinformer_core::{BackoffPolicy, ChangeRecord, ObjectStore, ResourceVersion, StoreError, SyncBatch, TrackedObject, WatchEvent, WatchFilter};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::InformerError;

/// Item carried by the bounded queue between reflector and processing loop.
#[derive(Debug)]
pub(crate) enum QueueItem {
    Record(ChangeRecord),
    /// The reflector hit a non-retryable failure and stopped.
    Fatal(InformerError),
}

enum Flow {
    Proceed,
    Stop,
}

pub(crate) struct Reflector {
    store: Arc<dyn ObjectStore>,
    filter: WatchFilter,
    backoff: BackoffPolicy,
    tx: mpsc::Sender<QueueItem>,
    cursor: Option<ResourceVersion>,
    failures: u32,
    /// Consecutive expired cursors without a watch event in between.
    expiries: u32,
    synced_once: bool,
}

impl Reflector {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, filter: WatchFilter, backoff: BackoffPolicy, tx: mpsc::Sender<QueueItem>) -> Self {
        Self { store, filter, backoff, tx, cursor: None, failures: 0, expiries: 0, synced_once: false }
    }

    /// Runs until cancelled, the queue is closed, or a fatal error. A fatal
    /// error is also pushed into the queue so the processing loop sees it.
    pub(crate) async fn run(mut self, cancel: CancellationToken) -> Result<(), InformerError> {
        info!(kind = %self.filter.kind, ns = ?self.filter.namespace, "reflector started");
        let res = self.run_inner(&cancel).await;
        match &res {
            Ok(()) => debug!(kind = %self.filter.kind, "reflector stopped"),
            Err(e) => {
                error!(kind = %self.filter.kind, error = %e, "reflector failed");
                let _ = self.tx.send(QueueItem::Fatal(e.clone())).await;
            }
        }
        res
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> Result<(), InformerError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let flow = match self.cursor.clone() {
                None => self.relist(cancel).await?,
                Some(cursor) => self.watch(cursor, cancel).await?,
            };
            if let Flow::Stop = flow {
                return Ok(());
            }
        }
    }

    async fn relist(&mut self, cancel: &CancellationToken) -> Result<Flow, InformerError> {
        let started = Instant::now();
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Flow::Stop),
            r = self.store.list(&self.filter) => r,
        };
        let page = match res {
            Ok(page) => page,
            Err(e) => return self.on_failure(e, cancel).await,
        };
        let listed = page.objects.len();
        let objects: Vec<TrackedObject> = page.objects.into_iter().filter(|o| self.in_scope(o)).collect();
        if page.cursor.is_empty() {
            warn!(kind = %self.filter.kind, "list returned no resource version; watch will start from now");
        }
        histogram!("kinformer_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("kinformer_relists_total", 1u64);
        info!(kind = %self.filter.kind, listed, kept = objects.len(), cursor = %page.cursor, relist = self.synced_once, "listed objects");
        self.failures = 0;
        self.synced_once = true;
        self.cursor = Some(page.cursor.clone());
        self.emit(ChangeRecord::Synced(SyncBatch { objects, cursor: page.cursor }), cancel).await
    }

    async fn watch(&mut self, cursor: ResourceVersion, cancel: &CancellationToken) -> Result<Flow, InformerError> {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Flow::Stop),
            r = self.store.watch(&self.filter, &cursor) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => return self.on_failure(e, cancel).await,
        };
        debug!(kind = %self.filter.kind, cursor = %cursor, "watch opened");
        let mut received = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Flow::Stop),
                n = stream.next() => n,
            };
            match next {
                None => break,
                Some(Err(e)) => return self.on_failure(e, cancel).await,
                Some(Ok(ev)) => {
                    received += 1;
                    self.failures = 0;
                    self.expiries = 0;
                    if let Flow::Stop = self.handle_event(ev, cancel).await? {
                        return Ok(Flow::Stop);
                    }
                }
            }
        }
        counter!("kinformer_watch_restarts_total", 1u64);
        debug!(kind = %self.filter.kind, received, cursor = ?self.cursor, "watch stream ended; resuming");
        if received == 0 {
            // empty watch windows would otherwise spin against the store
            return Ok(self.pause(self.backoff.initial, cancel).await);
        }
        Ok(Flow::Proceed)
    }

    async fn handle_event(&mut self, ev: WatchEvent, cancel: &CancellationToken) -> Result<Flow, InformerError> {
        let record = match ev {
            WatchEvent::Bookmark(rv) => {
                trace!(cursor = %rv, "bookmark");
                self.cursor = Some(rv);
                return Ok(Flow::Proceed);
            }
            WatchEvent::Added(o) => self.advance(o).map(ChangeRecord::Added),
            WatchEvent::Modified(o) => self.advance(o).map(ChangeRecord::Updated),
            WatchEvent::Deleted(o) => self.advance(o).map(|o| ChangeRecord::Deleted { key: o.key.clone(), last: Some(o) }),
        };
        match record {
            Some(r) => self.emit(r, cancel).await,
            None => Ok(Flow::Proceed),
        }
    }

    /// Move the cursor past `o`; hand it back only when it is in scope.
    /// The cursor never moves backwards.
    fn advance(&mut self, o: TrackedObject) -> Option<TrackedObject> {
        let behind = self.cursor.as_ref().is_some_and(|c| o.version.is_older_than(c));
        if !behind {
            self.cursor = Some(o.version.clone());
        }
        self.in_scope(&o).then_some(o)
    }

    fn in_scope(&self, o: &TrackedObject) -> bool {
        let ok = self.filter.matches(o);
        if !ok {
            debug!(key = %o.key, kind = %o.key.kind, "dropping object outside filter");
        }
        ok
    }

    async fn emit(&self, record: ChangeRecord, cancel: &CancellationToken) -> Result<Flow, InformerError> {
        trace!(record = record.kind_str(), key = ?record.key().map(|k| k.cache_key()), "enqueue");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(Flow::Stop),
            r = self.tx.send(QueueItem::Record(record)) => match r {
                Ok(()) => Ok(Flow::Proceed),
                Err(_) => {
                    debug!("work queue closed; stopping reflector");
                    Ok(Flow::Stop)
                }
            },
        }
    }

    async fn on_failure(&mut self, e: StoreError, cancel: &CancellationToken) -> Result<Flow, InformerError> {
        counter!("kinformer_store_errors_total", 1u64, "kind" => e.kind_str());
        if !e.is_retryable() {
            return Err(InformerError::Rejected(e));
        }
        if e.is_expired() && self.cursor.is_some() {
            self.cursor = None;
            self.expiries += 1;
            counter!("kinformer_cursor_expiries_total", 1u64);
            if self.expiries == 1 {
                info!(kind = %self.filter.kind, "watch cursor expired; relisting");
                return Ok(Flow::Proceed);
            }
            let delay = self.backoff.delay(self.expiries - 1);
            warn!(kind = %self.filter.kind, expiries = self.expiries, delay_ms = delay.as_millis() as u64, "watch cursor keeps expiring; delaying relist");
            return Ok(self.pause(delay, cancel).await);
        }
        self.failures += 1;
        if self.backoff.exhausted(self.failures, self.synced_once) {
            return Err(InformerError::Exhausted { attempts: self.failures, last: e });
        }
        let delay = self.backoff.delay(self.failures);
        warn!(kind = %self.filter.kind, error = %e, attempt = self.failures, delay_ms = delay.as_millis() as u64, "object store call failed; backing off");
        Ok(self.pause(delay, cancel).await)
    }

    async fn pause(&self, delay: std::time::Duration, cancel: &CancellationToken) -> Flow {
        tokio::select! {
            _ = cancel.cancelled() => Flow::Stop,
            _ = tokio::time::sleep(delay) => Flow::Proceed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use kinformer_core::{ListPage, ObjectKey, WatchStream};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Store that replays scripted list and watch results.
    struct Scripted {
        lists: Mutex<VecDeque<Result<ListPage, StoreError>>>,
        watches: Mutex<VecDeque<Result<Vec<Result<WatchEvent, StoreError>>, StoreError>>>,
        watch_cursors: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ObjectStore for Scripted {
        async fn list(&self, _filter: &WatchFilter) -> Result<ListPage, StoreError> {
            self.lists.lock().unwrap().pop_front().unwrap_or_else(|| Err(StoreError::Rejected("script exhausted".into())))
        }

        async fn watch(&self, _filter: &WatchFilter, cursor: &ResourceVersion) -> Result<WatchStream, StoreError> {
            self.watch_cursors.lock().unwrap().push(cursor.to_string());
            match self.watches.lock().unwrap().pop_front() {
                Some(Ok(events)) => Ok(stream::iter(events).boxed()),
                Some(Err(e)) => Err(e),
                None => Err(StoreError::Rejected("script exhausted".into())),
            }
        }
    }

    fn secret(ns: &str, name: &str, rv: u64) -> TrackedObject {
        TrackedObject::new(ObjectKey::new(Some(ns), name, "v1/Secret"), rv)
    }

    fn fast() -> BackoffPolicy {
        BackoffPolicy { initial: Duration::from_millis(1), max: Duration::from_millis(5), ..Default::default() }
    }

    async fn drain(mut rx: mpsc::Receiver<QueueItem>) -> Vec<QueueItem> {
        let mut out = Vec::new();
        while let Ok(Some(item)) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn lists_watches_and_relists_on_expiry() {
        let store = Scripted {
            lists: Mutex::new(VecDeque::from(vec![
                Ok(ListPage { objects: vec![secret("ns", "a", 1), secret("ns", "b", 1)], cursor: 1u64.into() }),
                Ok(ListPage { objects: vec![secret("ns", "a", 5)], cursor: 5u64.into() }),
            ])),
            watches: Mutex::new(VecDeque::from(vec![
                Ok(vec![
                    Ok(WatchEvent::Modified(secret("ns", "a", 2))),
                    Ok(WatchEvent::Bookmark(3u64.into())),
                    Err(StoreError::Connection("reset".into())),
                ]),
                Err(StoreError::Expired("too old".into())),
            ])),
            watch_cursors: Mutex::new(Vec::new()),
        };
        let store = Arc::new(store);
        let (tx, rx) = mpsc::channel(16);
        let filter = WatchFilter::new("v1/Secret");
        let res = Reflector::new(store.clone(), filter, fast(), tx).run(CancellationToken::new()).await;
        // the script ends with a rejected watch
        assert!(matches!(res, Err(InformerError::Rejected(_))));

        let items = drain(rx).await;
        let kinds: Vec<_> = items
            .iter()
            .map(|i| match i {
                QueueItem::Record(r) => r.kind_str(),
                QueueItem::Fatal(_) => "fatal",
            })
            .collect();
        assert_eq!(kinds, vec!["synced", "updated", "synced", "fatal"]);
        // resumed from the bookmark after the reset, from the relist cursor afterwards
        assert_eq!(*store.watch_cursors.lock().unwrap(), vec!["1", "3", "5"]);
    }

    #[tokio::test]
    async fn unreachable_store_exhausts_initial_retries() {
        let store = Scripted {
            lists: Mutex::new((0..5).map(|_| Err(StoreError::Connection("refused".into()))).collect()),
            watches: Mutex::new(VecDeque::new()),
            watch_cursors: Mutex::new(Vec::new()),
        };
        let (tx, rx) = mpsc::channel(4);
        let backoff = BackoffPolicy { max_initial_retries: Some(2), ..fast() };
        let res = Reflector::new(Arc::new(store), WatchFilter::new("v1/Secret"), backoff, tx).run(CancellationToken::new()).await;
        match res {
            Err(InformerError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, StoreError::Connection("refused".into()));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        let items = drain(rx).await;
        assert!(matches!(items.as_slice(), [QueueItem::Fatal(InformerError::Exhausted { .. })]));
    }

    #[tokio::test]
    async fn out_of_scope_objects_are_dropped() {
        let store = Scripted {
            lists: Mutex::new(VecDeque::from(vec![Ok(ListPage {
                objects: vec![secret("prod", "a", 1), secret("dev", "b", 1)],
                cursor: 1u64.into(),
            })])),
            watches: Mutex::new(VecDeque::from(vec![Ok(vec![
                Ok(WatchEvent::Added(secret("dev", "c", 2))),
                Ok(WatchEvent::Added(secret("prod", "d", 3))),
            ])])),
            watch_cursors: Mutex::new(Vec::new()),
        };
        let store = Arc::new(store);
        let (tx, rx) = mpsc::channel(16);
        let filter = WatchFilter::new("v1/Secret").namespace(Some("prod"));
        let _ = Reflector::new(store.clone(), filter, fast(), tx).run(CancellationToken::new()).await;
        let items = drain(rx).await;
        match &items[0] {
            QueueItem::Record(ChangeRecord::Synced(b)) => {
                assert_eq!(b.objects.len(), 1);
                assert_eq!(b.objects[0].key.name, "a");
            }
            other => panic!("unexpected {:?}", other),
        }
        match &items[1] {
            QueueItem::Record(ChangeRecord::Added(o)) => assert_eq!(o.key.name, "d"),
            other => panic!("unexpected {:?}", other),
        }
        // cursor still advanced past the dropped event
        assert_eq!(store.watch_cursors.lock().unwrap().last().map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn cancellation_stops_backoff() {
        let store = Scripted {
            lists: Mutex::new((0..100).map(|_| Err(StoreError::Connection("refused".into()))).collect()),
            watches: Mutex::new(VecDeque::new()),
            watch_cursors: Mutex::new(Vec::new()),
        };
        let (tx, _rx) = mpsc::channel(4);
        let backoff = BackoffPolicy { initial: Duration::from_secs(30), max: Duration::from_secs(30), max_initial_retries: None, ..Default::default() };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Reflector::new(Arc::new(store), WatchFilter::new("v1/Secret"), backoff, tx).run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), task).await.expect("reflector did not stop").unwrap();
        assert!(res.is_ok());
    }

    /// Lists succeed, every watch reports an expired cursor.
    struct AlwaysExpired {
        lists: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl ObjectStore for AlwaysExpired {
        async fn list(&self, _filter: &WatchFilter) -> Result<ListPage, StoreError> {
            *self.lists.lock().unwrap() += 1;
            Ok(ListPage { objects: Vec::new(), cursor: 1u64.into() })
        }

        async fn watch(&self, _filter: &WatchFilter, _cursor: &ResourceVersion) -> Result<WatchStream, StoreError> {
            Err(StoreError::Expired("compacted".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_expiry_backs_off_between_relists() {
        let store = Arc::new(AlwaysExpired { lists: Mutex::new(0) });
        let (tx, mut rx) = mpsc::channel(1024);
        let backoff = BackoffPolicy { initial: Duration::from_millis(5), max: Duration::from_millis(20), ..Default::default() };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Reflector::new(store.clone(), WatchFilter::new("v1/Secret"), backoff, tx).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        assert!(task.await.unwrap().is_ok());

        // first expiry relists at once, later ones wait 5, 10, then 20ms each
        let lists = *store.lists.lock().unwrap();
        assert!((5..=20).contains(&lists), "relisted {} times in 200ms", lists);
        let mut batches = 0;
        while let Ok(QueueItem::Record(ChangeRecord::Synced(_))) = rx.try_recv() {
            batches += 1;
        }
        assert_eq!(batches, lists);
    }
}
