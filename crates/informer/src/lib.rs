//! kinformer informer: keeps a local cache in step with an [`ObjectStore`]
//! and tells registered handlers about every change.
//!
//! One reflector task lists and then watches the store, pushing change
//! records into a bounded queue. One processing loop drains that queue,
//! applies each record to the cache and then calls the handlers, in order.
//! The [`SyncBarrier`] opens once the first full list has gone through.
//!
//! ```no_run
//! # async fn demo() -> Result<(), kinformer_informer::InformerError> {
//! use std::sync::Arc;
//! use kinformer_core::{InformerConfig, Notification, WatchFilter};
//! use kinformer_informer::{Informer, MemoryStore};
//! use tokio_util::sync::CancellationToken;
//!
//! let store = Arc::new(MemoryStore::new());
//! let mut informer = Informer::new(store, WatchFilter::new("v1/Secret"), InformerConfig::default())?;
//! informer.add_handler("log", |ev: &Notification| -> anyhow::Result<()> {
//!     tracing::info!(name = %ev.key(), "{}", ev.kind_str());
//!     Ok(())
//! });
//! let barrier = informer.barrier();
//! let cancel = CancellationToken::new();
//! let task = tokio::spawn(informer.run(cancel.clone()));
//! barrier.wait_for_sync(&cancel).await;
//! cancel.cancel();
//! task.await.ok();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

use std::sync::Arc;

use kinformer_core::{ConfigError, InformerConfig, ObjectStore, StoreError, WatchFilter};
use kinformer_store::{CacheHandle, Indexer};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod barrier;
mod handler;
mod memory;
mod processor;
mod reflector;

pub use barrier::SyncBarrier;
pub use handler::{Handler, HandlerRegistry};
pub use memory::MemoryStore;

use processor::ProcessingLoop;
use reflector::Reflector;

/// Terminal failures of an informer run. Everything else is retried or logged.
#[derive(Debug, Clone, Error)]
pub enum InformerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("object store rejected the request: {0}")]
    Rejected(StoreError),
    #[error("object store unreachable after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: StoreError },
    #[error("reflector stopped without reporting an error")]
    ReflectorGone,
}

/// One watched collection: reflector, processing loop, cache, barrier and handlers.
pub struct Informer {
    store: Arc<dyn ObjectStore>,
    filter: WatchFilter,
    config: InformerConfig,
    indexer: Indexer,
    cache: CacheHandle,
    barrier: SyncBarrier,
    handlers: HandlerRegistry,
}

impl Informer {
    /// Validates filter and config; nothing runs until [`Informer::run`].
    pub fn new(store: Arc<dyn ObjectStore>, filter: WatchFilter, config: InformerConfig) -> Result<Self, InformerError> {
        filter.validate()?;
        config.validate()?;
        let (indexer, cache) = Indexer::new();
        Ok(Self { store, filter, config, indexer, cache, barrier: SyncBarrier::new(), handlers: HandlerRegistry::new() })
    }

    /// Register a handler. Only possible before `run`, which consumes the informer.
    pub fn add_handler(&mut self, name: impl Into<String>, handler: impl Handler + 'static) -> &mut Self {
        self.handlers.register(name, handler);
        self
    }

    /// Read side of the cache; stays valid after `run` ends.
    pub fn cache(&self) -> CacheHandle { self.cache.clone() }

    pub fn barrier(&self) -> SyncBarrier { self.barrier.clone() }

    pub fn filter(&self) -> &WatchFilter { &self.filter }

    /// Run until `cancel` fires (`Ok`) or a terminal error occurs (`Err`).
    ///
    /// On return the barrier is closed, so pending waiters observe "not synced"
    /// unless the cache had already synced.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), InformerError> {
        let Informer { store, filter, config, indexer, cache: _, barrier, handlers } = self;
        info!(kind = %filter.kind, ns = ?filter.namespace, handlers = handlers.len(), queue = config.queue_capacity, "informer starting");

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let child = cancel.child_token();
        let reflector = Reflector::new(store, filter, config.backoff.clone(), tx);
        let reflector_task = tokio::spawn(reflector.run(child.clone()));

        let res = ProcessingLoop::new(indexer, handlers, barrier.clone(), rx, config.resync_period).run(child.clone()).await;

        child.cancel();
        barrier.close();
        if let Err(e) = reflector_task.await {
            warn!(error = %e, "reflector task aborted");
        }
        match &res {
            Ok(()) => info!("informer stopped"),
            Err(e) => warn!(error = %e, "informer terminated"),
        }
        res
    }
}
