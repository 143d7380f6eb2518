//! Exclusion Management Module
//!
//! Hosts and URL prefixes that bypass capture and interception entirely.
//! Readers take an immutable snapshot; writers swap in a new one.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Excluded hosts and URL prefixes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusionSet {
    /// Hostnames, lowercased. `*.example.com` also matches subdomains.
    pub hosts: BTreeSet<String>,

    /// URL prefixes, lowercased
    pub url_prefixes: BTreeSet<String>,
}

impl ExclusionSet {
    pub fn new<H, P>(hosts: H, url_prefixes: P) -> Self
    where
        H: IntoIterator,
        H::Item: AsRef<str>,
        P: IntoIterator,
        P::Item: AsRef<str>,
    {
        Self {
            hosts: hosts.into_iter().map(|h| normalize(h.as_ref())).collect(),
            url_prefixes: url_prefixes.into_iter().map(|p| normalize(p.as_ref())).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.url_prefixes.is_empty()
    }

    /// Whether traffic to `host` is excluded regardless of URL
    pub fn excludes_host(&self, host: &str) -> bool {
        let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
        self.hosts.iter().any(|pattern| match pattern.strip_prefix("*.") {
            Some(domain) => host == domain || host.ends_with(&format!(".{}", domain)),
            None => *pattern == host,
        })
    }

    /// Whether `url` starts with an excluded prefix
    pub fn excludes_url(&self, url: &str) -> bool {
        if self.url_prefixes.is_empty() {
            return false;
        }
        let url = url.to_ascii_lowercase();
        self.url_prefixes.iter().any(|prefix| url.starts_with(prefix.as_str()))
    }

    pub fn excludes(&self, host: &str, url: &str) -> bool {
        self.excludes_host(host) || self.excludes_url(url)
    }

    /// Short description for status output
    pub fn summary(&self) -> String {
        format!("{} hosts, {} URL prefixes", self.hosts.len(), self.url_prefixes.len())
    }
}

fn normalize(entry: &str) -> String {
    entry.trim().to_ascii_lowercase()
}

/// Shared, hot-swappable exclusion set
#[derive(Default)]
pub struct Exclusions {
    current: RwLock<Arc<ExclusionSet>>,
}

impl Exclusions {
    pub fn new(set: ExclusionSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    pub fn snapshot(&self) -> Arc<ExclusionSet> {
        self.current.read().clone()
    }

    fn update(&self, f: impl FnOnce(&mut ExclusionSet) -> bool) -> bool {
        let mut guard = self.current.write();
        let mut next = guard.as_ref().clone();
        let changed = f(&mut next);
        if changed {
            *guard = Arc::new(next);
        }
        changed
    }

    /// Returns false if the host was already excluded
    pub fn add_host(&self, host: &str) -> bool {
        let host = normalize(host);
        if host.is_empty() {
            return false;
        }
        tracing::info!("Excluding host {}", host);
        self.update(|set| set.hosts.insert(host))
    }

    pub fn remove_host(&self, host: &str) -> bool {
        let host = normalize(host);
        self.update(|set| set.hosts.remove(&host))
    }

    pub fn add_url_prefix(&self, prefix: &str) -> bool {
        let prefix = normalize(prefix);
        if prefix.is_empty() {
            return false;
        }
        tracing::info!("Excluding URL prefix {}", prefix);
        self.update(|set| set.url_prefixes.insert(prefix))
    }

    pub fn remove_url_prefix(&self, prefix: &str) -> bool {
        let prefix = normalize(prefix);
        self.update(|set| set.url_prefixes.remove(&prefix))
    }
}
