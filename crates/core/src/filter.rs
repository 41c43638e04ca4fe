use serde::{Deserialize, Serialize};

use crate::{ConfigError, TrackedObject};

/// Scope of one watched collection: a kind and an optional namespace.
///
/// `kind` is a GVK key (`v1/Secret`, `apps/v1/Deployment`); objects produced by
/// a store for this filter carry the same string as their key kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchFilter {
    pub kind: String,
    /// `None` watches all namespaces.
    pub namespace: Option<String>,
    /// Passed through to the store untouched.
    pub label_selector: Option<String>,
}

impl WatchFilter {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: None, label_selector: None }
    }

    pub fn namespace(mut self, ns: Option<&str>) -> Self {
        self.namespace = ns.filter(|s| !s.is_empty()).map(str::to_string);
        self
    }

    pub fn labels(mut self, selector: Option<&str>) -> Self {
        self.label_selector = selector.filter(|s| !s.is_empty()).map(str::to_string);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind.trim().is_empty() {
            return Err(ConfigError::EmptyKind);
        }
        if let Some(ns) = &self.namespace {
            if !is_dns_label(ns) {
                return Err(ConfigError::InvalidNamespace(ns.clone()));
            }
        }
        Ok(())
    }

    /// Kind and namespace scope check. Label selectors are the store's job.
    pub fn matches(&self, obj: &TrackedObject) -> bool {
        if obj.key.kind != self.kind {
            return false;
        }
        match &self.namespace {
            Some(ns) => obj.key.namespace.as_deref() == Some(ns.as_str()),
            None => true,
        }
    }
}

fn is_dns_label(s: &str) -> bool {
    let b = s.as_bytes();
    if b.is_empty() || b.len() > 63 {
        return false;
    }
    let ok = |c: &u8| c.is_ascii_lowercase() || c.is_ascii_digit();
    ok(&b[0]) && ok(&b[b.len() - 1]) && b.iter().all(|c| ok(c) || *c == b'-')
}
