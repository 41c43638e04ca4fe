//! kinformer kubehub: Kubernetes API server as an [`ObjectStore`].
//!
//! Lists and watches object metadata only (`PartialObjectMeta`), so the
//! mirror never holds object bodies or secret payloads.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, WatchEvent as KubeEvent},
    discovery::{self, verbs, ApiCapabilities, Discovery, Scope},
    Client,
};
use kinformer_core::{
    ListPage, Metadata, ObjectKey, ObjectStore, ResourceVersion, StoreError, TrackedObject, Uid, WatchEvent, WatchFilter,
    WatchStream,
};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: u32 = 500;
/// Server-side watch timeout; must stay below the API server's 295s cap.
pub const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 290;

/// `v1/Kind` for the core group, `group/v1/Kind` otherwise.
pub fn gvk_key(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() {
        format!("{}/{}", version, kind)
    } else {
        format!("{}/{}/{}", group, version, kind)
    }
}

/// A watchable resource as reported by API discovery.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredResource {
    /// Usable as `WatchFilter::kind`.
    pub key: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    fn from_discovery(ar: &ApiResource, caps: &ApiCapabilities) -> Self {
        Self {
            key: gvk_key(&ar.group, &ar.version, &ar.kind),
            plural: ar.plural.clone(),
            namespaced: matches!(caps.scope, Scope::Namespaced),
        }
    }
}

/// Served resources that support watch, preferred versions only, sorted by key.
pub async fn discover() -> Result<Vec<DiscoveredResource>> {
    let client = Client::try_default().await.context("building kube client")?;
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    let mut out: Vec<_> = discovery
        .groups()
        .flat_map(|g| g.recommended_resources())
        .filter(|(_, caps)| caps.supports_operation(verbs::WATCH))
        .map(|(ar, caps)| DiscoveredResource::from_discovery(&ar, &caps))
        .collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(out)
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve one kind by querying only its API group.
async fn resolve(client: &Client, key: &str) -> Result<(ApiResource, ApiCapabilities)> {
    let gvk = parse_gvk_key(key)?;
    let (ar, caps) = discovery::pinned_kind(client, &gvk).await.with_context(|| format!("resolving {}", key))?;
    if !caps.supports_operation(verbs::WATCH) {
        bail!("{} does not support watch", key);
    }
    Ok((ar, caps))
}

/// Metadata-only list/watch access to one resource type.
#[derive(Clone)]
pub struct KubeStore {
    api: Api<DynamicObject>,
    kind: String,
    page_size: u32,
    watch_timeout: u32,
}

impl KubeStore {
    /// Resolve `filter.kind` through discovery and bind to the default client.
    pub async fn connect(filter: &WatchFilter) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Self::connect_with(client, filter).await
    }

    pub async fn connect_with(client: Client, filter: &WatchFilter) -> Result<Self> {
        let (ar, caps) = resolve(&client, &filter.kind).await?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        let api: Api<DynamicObject> = match (&filter.namespace, namespaced) {
            (Some(ns), true) => Api::namespaced_with(client, ns, &ar),
            (Some(ns), false) => bail!("{} is cluster-scoped; namespace {:?} cannot apply", filter.kind, ns),
            (None, _) => Api::all_with(client, &ar),
        };
        info!(gvk = %filter.kind, ns = ?filter.namespace, namespaced, "kube store ready");
        Ok(Self { api, kind: filter.kind.clone(), page_size: DEFAULT_PAGE_SIZE, watch_timeout: DEFAULT_WATCH_TIMEOUT_SECS })
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout = secs.clamp(1, 294);
        self
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn list(&self, filter: &WatchFilter) -> Result<ListPage, StoreError> {
        let started = Instant::now();
        let mut objects = Vec::new();
        let mut continue_token: Option<String> = None;
        let mut pages = 0u32;
        let cursor = loop {
            let mut lp = ListParams::default().limit(self.page_size);
            if let Some(sel) = filter.label_selector.as_deref() {
                lp = lp.labels(sel);
            }
            if let Some(tok) = continue_token.as_deref() {
                lp = lp.continue_token(tok);
            }
            let page = self.api.list_metadata(&lp).await.map_err(map_kube_error)?;
            pages += 1;
            for item in page.items {
                objects.push(to_tracked(item.metadata, &self.kind)?);
            }
            match page.metadata.continue_.filter(|t| !t.is_empty()) {
                Some(tok) => continue_token = Some(tok),
                None => break page.metadata.resource_version.unwrap_or_default(),
            }
        };
        histogram!("kinformer_kube_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(gvk = %self.kind, pages, items = objects.len(), rv = %cursor, "listed metadata");
        Ok(ListPage { objects, cursor: ResourceVersion::new(cursor) })
    }

    async fn watch(&self, filter: &WatchFilter, cursor: &ResourceVersion) -> Result<WatchStream, StoreError> {
        let mut wp = WatchParams::default().timeout(self.watch_timeout);
        if let Some(sel) = filter.label_selector.as_deref() {
            wp = wp.labels(sel);
        }
        let stream = self.api.watch_metadata(&wp, cursor.as_str()).await.map_err(map_kube_error)?;
        let kind = self.kind.clone();
        Ok(stream
            .map(move |res| match res {
                Ok(ev) => from_kube_event(ev, &kind),
                Err(e) => Err(map_kube_error(e)),
            })
            .boxed())
    }
}

fn from_kube_event(ev: KubeEvent<kube::core::PartialObjectMeta<DynamicObject>>, kind: &str) -> Result<WatchEvent, StoreError> {
    match ev {
        KubeEvent::Added(o) => Ok(WatchEvent::Added(to_tracked(o.metadata, kind)?)),
        KubeEvent::Modified(o) => Ok(WatchEvent::Modified(to_tracked(o.metadata, kind)?)),
        KubeEvent::Deleted(o) => Ok(WatchEvent::Deleted(to_tracked(o.metadata, kind)?)),
        KubeEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(ResourceVersion::new(b.metadata.resource_version))),
        KubeEvent::Error(resp) => {
            counter!("kinformer_kube_watch_errors_total", 1u64);
            Err(map_status(resp.code, format!("{}: {}", resp.reason, resp.message)))
        }
    }
}

fn map_status(code: u16, msg: String) -> StoreError {
    match code {
        410 => StoreError::Expired(msg),
        401 | 403 | 404 => StoreError::Rejected(msg),
        _ => StoreError::Connection(format!("{} ({})", msg, code)),
    }
}

pub fn map_kube_error(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(resp) => map_status(resp.code, format!("{}: {}", resp.reason, resp.message)),
        kube::Error::SerdeError(e) => StoreError::Malformed(e.to_string()),
        other => StoreError::Connection(other.to_string()),
    }
}

fn to_uid(uid_str: &str) -> Result<Uid> {
    let u = Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(*u.as_bytes())
}

/// Project Kubernetes object metadata onto a [`TrackedObject`] of `kind`.
pub fn to_tracked(meta: ObjectMeta, kind: &str) -> Result<TrackedObject, StoreError> {
    let name = meta.name.filter(|n| !n.is_empty()).ok_or_else(|| StoreError::Malformed("object missing metadata.name".into()))?;
    let uid = match meta.uid.as_deref().map(to_uid) {
        Some(Ok(uid)) => Some(uid),
        Some(Err(e)) => {
            warn!(name = %name, error = %e, "ignoring unparsable uid");
            None
        }
        None => None,
    };
    let key = ObjectKey::new(meta.namespace.as_deref(), &name, kind);
    let out = Metadata {
        uid,
        creation_ts: meta.creation_timestamp.map(|t| t.0.timestamp()).unwrap_or(0),
        deletion_ts: meta.deletion_timestamp.map(|t| t.0.timestamp()),
        generation: meta.generation,
        labels: meta.labels.unwrap_or_default().into_iter().collect(),
        annotations: meta.annotations.unwrap_or_default().into_iter().collect(),
    };
    Ok(TrackedObject::new(key, ResourceVersion::new(meta.resource_version.unwrap_or_default())).with_meta(out))
}
