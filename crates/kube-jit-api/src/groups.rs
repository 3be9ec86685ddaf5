//! Group/namespace mapping cache
//!
//! Per-cluster copy of the `JitGroupCache` singleton with a fixed TTL. Loads
//! go through a caller-supplied loader so the cache stays independent of the
//! Kubernetes client.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use kube_jit_common::clock::SharedClock;
use kube_jit_common::crd::GroupEntry;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};

/// How long a fetched JitGroupCache is served before refetching
pub const GROUP_CACHE_TTL_MINUTES: i64 = 10;

/// Group attached to a namespace at submission time
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceGroup {
    /// Directory group id
    #[serde(rename = "groupID")]
    pub group_id: String,
    /// Directory group name
    pub group_name: String,
}

struct CachedGroups {
    groups: Arc<Vec<GroupEntry>>,
    expires_at: DateTime<Utc>,
}

/// TTL cache of per-cluster group mappings
pub struct GroupMappingCache {
    entries: DashMap<String, CachedGroups>,
    generations: DashMap<String, u64>,
    ttl: Duration,
    clock: SharedClock,
}

impl GroupMappingCache {
    /// Create a cache with the standard TTL
    pub fn new(clock: SharedClock) -> Self {
        Self::with_ttl(clock, Duration::minutes(GROUP_CACHE_TTL_MINUTES))
    }

    /// Create a cache with a custom TTL
    pub fn with_ttl(clock: SharedClock, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            generations: DashMap::new(),
            ttl,
            clock,
        }
    }

    /// Fresh cached groups for `cluster`, if any
    pub fn cached(&self, cluster: &str) -> Option<Arc<Vec<GroupEntry>>> {
        let now = self.clock.now();
        self.entries
            .get(cluster)
            .filter(|e| e.expires_at > now)
            .map(|e| e.groups.clone())
    }

    /// Serve groups for `cluster` from cache, or load and cache them.
    ///
    /// A load that races with [`GroupMappingCache::invalidate`] is returned to
    /// the caller but not cached.
    pub async fn groups_for<F, Fut>(&self, cluster: &str, load: F) -> Result<Arc<Vec<GroupEntry>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<GroupEntry>>>,
    {
        if let Some(groups) = self.cached(cluster) {
            return Ok(groups);
        }

        let generation = self.generation(cluster);
        let groups = Arc::new(load().await?);

        if self.generation(cluster) == generation {
            debug!(cluster, entries = groups.len(), "group mapping cached");
            self.entries.insert(
                cluster.to_string(),
                CachedGroups {
                    groups: groups.clone(),
                    expires_at: self.clock.now() + self.ttl,
                },
            );
        }
        Ok(groups)
    }

    /// Drop the cached entry for `cluster`
    pub fn invalidate(&self, cluster: &str) {
        *self.generations.entry(cluster.to_string()).or_insert(0) += 1;
        if self.entries.remove(cluster).is_some() {
            debug!(cluster, "group mapping invalidated");
        }
    }

    fn generation(&self, cluster: &str) -> u64 {
        self.generations.get(cluster).map(|g| *g).unwrap_or(0)
    }
}

/// Resolve each submitted namespace to its unique group entry.
pub fn validate_namespaces(
    groups: &[GroupEntry],
    namespaces: &[String],
) -> Result<BTreeMap<String, NamespaceGroup>> {
    let mut out = BTreeMap::new();
    for ns in namespaces {
        let mut matches = groups.iter().filter(|g| &g.namespace == ns);
        let entry = match (matches.next(), matches.next()) {
            (Some(entry), None) => entry,
            _ => return Err(Error::InvalidNamespace(ns.clone())),
        };
        out.insert(
            ns.clone(),
            NamespaceGroup {
                group_id: entry.group_id.clone(),
                group_name: entry.group_name.clone(),
            },
        );
    }
    Ok(out)
}
