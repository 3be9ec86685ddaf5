//! Cluster client registry
//!
//! [`ClientCache`] keeps one kube client per target cluster together with the
//! instant its token expires. [`ClusterAccess`] composes it with the
//! [`GroupMappingCache`] so a client rebuild always drops that cluster's group
//! mapping before the new client is published.

pub mod credentials;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client};
use kube_jit_common::clock::SharedClock;
use kube_jit_common::crd::{GroupEntry, JitGroupCache, JitRequest};
use kube_jit_common::kube_utils::{is_already_exists, is_not_found};
use kube_jit_common::GROUP_CACHE_NAME;
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::groups::GroupMappingCache;
pub use credentials::{ClusterCredentials, CredentialSource};

/// Result of creating a JitRequest on a target cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new object was created
    Created,
    /// An object with the same name already existed and was left untouched
    AlreadyExists,
}

/// Everything the access service needs from target clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Names of configured clusters, sorted
    fn cluster_names(&self) -> Vec<String>;

    /// Whether `cluster` is configured
    fn has_cluster(&self, cluster: &str) -> bool;

    /// JitGroupCache entries of `cluster`, served from the mapping cache
    async fn groups_for(&self, cluster: &str) -> Result<Arc<Vec<GroupEntry>>>;

    /// Drop the cached group mapping of `cluster`
    fn invalidate_groups(&self, cluster: &str);

    /// Create `request` on `cluster`
    async fn create_jit_request(&self, cluster: &str, request: &JitRequest)
        -> Result<CreateOutcome>;

    /// Delete the JitRequest `name` on `cluster`; a missing object is success
    async fn delete_jit_request(&self, cluster: &str, name: &str) -> Result<()>;
}

#[derive(Clone)]
struct CachedClient {
    client: Client,
    expires_at: DateTime<Utc>,
}

/// Expiry-aware cache of per-cluster kube clients
pub struct ClientCache {
    sources: BTreeMap<String, Arc<dyn CredentialSource>>,
    entries: DashMap<String, CachedClient>,
    build_locks: DashMap<String, Arc<Mutex<()>>>,
    clock: SharedClock,
}

impl ClientCache {
    /// Create a cache over the given credential sources
    pub fn new(sources: BTreeMap<String, Arc<dyn CredentialSource>>, clock: SharedClock) -> Self {
        Self {
            sources,
            entries: DashMap::new(),
            build_locks: DashMap::new(),
            clock,
        }
    }

    /// Configured cluster names
    pub fn cluster_names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    /// Whether `cluster` has a credential source
    pub fn contains(&self, cluster: &str) -> bool {
        self.sources.contains_key(cluster)
    }

    fn fresh(&self, cluster: &str) -> Option<Client> {
        let now = self.clock.now();
        self.entries
            .get(cluster)
            .filter(|e| now < e.expires_at)
            .map(|e| e.client.clone())
    }

    /// Return a client whose token is valid now, rebuilding it if needed.
    ///
    /// `on_rebuild` runs after new credentials are minted and before the new
    /// client becomes visible to other callers.
    pub async fn get<F>(&self, cluster: &str, on_rebuild: F) -> Result<Client>
    where
        F: FnOnce() + Send,
    {
        if let Some(client) = self.fresh(cluster) {
            return Ok(client);
        }

        let source = self
            .sources
            .get(cluster)
            .ok_or_else(|| Error::ClusterUnknown(cluster.to_string()))?;

        let lock = self
            .build_locks
            .entry(cluster.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        if let Some(client) = self.fresh(cluster) {
            return Ok(client);
        }

        let now = self.clock.now();
        let creds = source.fetch(now).await?;
        if creds.expires_at <= now {
            return Err(Error::cluster(
                cluster,
                format!("{} issued an already expired token", source.provider()),
            ));
        }
        let client = creds.client(cluster).await?;

        on_rebuild();
        self.entries.insert(
            cluster.to_string(),
            CachedClient {
                client: client.clone(),
                expires_at: creds.expires_at,
            },
        );
        info!(
            cluster,
            provider = %source.provider(),
            expires_at = %creds.expires_at,
            "cluster client built"
        );
        Ok(client)
    }

    /// Drop the cached client, e.g. after the API server refused its token
    pub fn evict(&self, cluster: &str) {
        self.entries.remove(cluster);
    }
}

/// Façade over the client and group caches
pub struct ClusterAccess {
    clients: ClientCache,
    groups: GroupMappingCache,
}

impl ClusterAccess {
    /// Compose the two caches
    pub fn new(clients: ClientCache, groups: GroupMappingCache) -> Self {
        Self { clients, groups }
    }

    async fn client(&self, cluster: &str) -> Result<Client> {
        self.clients
            .get(cluster, || self.groups.invalidate(cluster))
            .await
    }

    fn kube_error(&self, cluster: &str, err: kube::Error) -> Error {
        if matches!(&err, kube::Error::Api(ae) if ae.code == 401) {
            warn!(cluster, "token rejected, evicting client");
            self.clients.evict(cluster);
        }
        let message = err.to_string();
        if kube_jit_common::Error::from(err).is_retryable() {
            Error::cluster(cluster, message)
        } else {
            Error::cluster_permanent(cluster, message)
        }
    }
}

#[async_trait]
impl ClusterGateway for ClusterAccess {
    fn cluster_names(&self) -> Vec<String> {
        self.clients.cluster_names()
    }

    fn has_cluster(&self, cluster: &str) -> bool {
        self.clients.contains(cluster)
    }

    #[instrument(skip(self))]
    async fn groups_for(&self, cluster: &str) -> Result<Arc<Vec<GroupEntry>>> {
        if let Some(groups) = self.groups.cached(cluster) {
            return Ok(groups);
        }
        let client = self.client(cluster).await?;
        self.groups
            .groups_for(cluster, || async {
                let api: Api<JitGroupCache> = Api::all(client);
                let found = api
                    .get_opt(GROUP_CACHE_NAME)
                    .await
                    .map_err(|e| self.kube_error(cluster, e))?;
                Ok(found.map(|c| c.spec.groups).unwrap_or_default())
            })
            .await
    }

    fn invalidate_groups(&self, cluster: &str) {
        self.groups.invalidate(cluster);
    }

    #[instrument(skip(self, request), fields(name = ?request.metadata.name))]
    async fn create_jit_request(
        &self,
        cluster: &str,
        request: &JitRequest,
    ) -> Result<CreateOutcome> {
        let client = self.client(cluster).await?;
        let api: Api<JitRequest> = Api::all(client);
        match api.create(&PostParams::default(), request).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e) if is_already_exists(&e) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(self.kube_error(cluster, e)),
        }
    }

    #[instrument(skip(self))]
    async fn delete_jit_request(&self, cluster: &str, name: &str) -> Result<()> {
        let client = self.client(cluster).await?;
        let api: Api<JitRequest> = Api::all(client);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(cluster, name, "JitRequest deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(self.kube_error(cluster, e)),
        }
    }
}
