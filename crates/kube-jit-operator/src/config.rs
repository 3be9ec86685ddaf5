//! KubeJitConfig handling
//!
//! The operator reads its policy (allowed cluster roles, namespace pattern)
//! from the `KubeJitConfig` singleton. The config reconciler validates every
//! revision and publishes it into a [`ConfigCache`]; the request reconciler
//! takes a snapshot from the cache at the start of each reconcile.
//!
//! The cache is mirrored to a JSON file so a restarted operator keeps
//! enforcing the last good policy even before the watch catches up.
//! Deleting the singleton does not clear the cache: the last good policy
//! stays in force until a new object is created.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, Resource, ResourceExt};
use kube_jit_common::crd::{KubeJitConfig, KubeJitConfigSpec};
use kube_jit_common::events::{actions, reasons, EventPublisher};
use parking_lot::RwLock;
use regex::Regex;
use tracing::{error, info, instrument, warn};

use crate::error::{ReconcileError, Result};

/// Policy snapshot with the namespace pattern compiled
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    spec: KubeJitConfigSpec,
    namespace_regex: Option<Regex>,
}

impl ValidatedConfig {
    /// Validate `spec`, compiling the namespace pattern if one is set.
    pub fn new(spec: KubeJitConfigSpec) -> Result<Self> {
        let namespace_regex = match spec.namespace_allowed_regex.as_deref() {
            Some(pattern) if !pattern.is_empty() => Some(Regex::new(pattern).map_err(|e| {
                ReconcileError::Config(format!(
                    "namespaceAllowedRegex '{}' does not compile: {}",
                    pattern, e
                ))
            })?),
            _ => None,
        };
        Ok(Self {
            spec,
            namespace_regex,
        })
    }

    /// The validated spec
    pub fn spec(&self) -> &KubeJitConfigSpec {
        &self.spec
    }

    /// Whether `role` is listed in `allowedClusterRoles`
    pub fn role_allowed(&self, role: &str) -> bool {
        self.spec.allowed_cluster_roles.iter().any(|r| r == role)
    }

    /// Whether `namespace` matches the pattern. No pattern allows everything.
    pub fn namespace_allowed(&self, namespace: &str) -> bool {
        self.namespace_regex
            .as_ref()
            .map_or(true, |re| re.is_match(namespace))
    }

    /// The namespace pattern, if any
    pub fn namespace_pattern(&self) -> Option<&str> {
        self.namespace_regex.as_ref().map(Regex::as_str)
    }
}

/// Last good policy, shared between reconcilers and mirrored on disk
pub struct ConfigCache {
    path: PathBuf,
    current: RwLock<Option<Arc<ValidatedConfig>>>,
}

impl ConfigCache {
    /// Empty cache persisting to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(None),
        }
    }

    /// Cache already holding `config`
    pub fn with_config(path: impl Into<PathBuf>, config: ValidatedConfig) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Some(Arc::new(config))),
        }
    }

    /// Open the cache, seeding it from `path` when the file exists.
    ///
    /// A file holding an invalid pattern is an error, not an empty cache.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let cache = Self::new(path);
        match tokio::fs::read(&cache.path).await {
            Ok(bytes) => {
                let spec: KubeJitConfigSpec =
                    serde_json::from_slice(&bytes).map_err(|e| cache.io_error(e))?;
                let config = ValidatedConfig::new(spec)?;
                *cache.current.write() = Some(Arc::new(config));
                info!(path = %cache.path.display(), "Loaded cached KubeJitConfig");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(cache.io_error(e)),
        }
        Ok(cache)
    }

    /// Cache file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current policy snapshot
    pub fn current(&self) -> Option<Arc<ValidatedConfig>> {
        self.current.read().clone()
    }

    /// Publish `config`. Returns false when it equals the cached policy.
    ///
    /// The file is written before the in-memory swap and the lock is never
    /// held across the write.
    pub async fn store(&self, config: ValidatedConfig) -> Result<bool> {
        if self
            .current()
            .is_some_and(|c| c.spec() == config.spec())
        {
            return Ok(false);
        }

        let bytes = serde_json::to_vec_pretty(config.spec()).map_err(|e| self.io_error(e))?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| self.io_error(e))?;

        *self.current.write() = Some(Arc::new(config));
        Ok(true)
    }

    fn io_error(&self, e: impl std::fmt::Display) -> ReconcileError {
        ReconcileError::ConfigCache {
            path: self.path.display().to_string(),
            message: e.to_string(),
        }
    }
}

/// Context for the KubeJitConfig reconciler
pub struct ConfigContext {
    /// Name of the singleton to follow
    pub config_name: String,
    /// Cache shared with the request reconciler
    pub cache: Arc<ConfigCache>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
}

/// Reconcile the KubeJitConfig singleton into the cache.
///
/// An invalid revision is reported through a Warning event and the previous
/// policy stays in force.
#[instrument(skip(config, ctx), fields(config = %config.name_any()))]
pub async fn reconcile(config: Arc<KubeJitConfig>, ctx: Arc<ConfigContext>) -> Result<Action> {
    let name = config.name_any();
    if name != ctx.config_name {
        return Ok(Action::await_change());
    }

    match ValidatedConfig::new(config.spec.clone()) {
        Ok(validated) => {
            if ctx.cache.store(validated).await? {
                info!(
                    roles = ?config.spec.allowed_cluster_roles,
                    regex = ?config.spec.namespace_allowed_regex,
                    "KubeJitConfig updated"
                );
            }
        }
        Err(e) => {
            warn!(error = %e, "Rejecting KubeJitConfig revision, keeping previous policy");
            ctx.events
                .publish(
                    &config_ref(&config),
                    EventType::Warning,
                    reasons::CONFIG_INVALID,
                    actions::VALIDATE,
                    Some(e.to_string()),
                )
                .await;
        }
    }
    Ok(Action::await_change())
}

/// Record the deletion of a KubeJitConfig.
///
/// Returns whether a cached policy is still being enforced.
pub fn config_deleted(config: &KubeJitConfig, ctx: &ConfigContext) -> bool {
    if config.name_any() != ctx.config_name {
        return false;
    }
    match ctx.cache.current() {
        Some(current) => {
            warn!(
                config = %ctx.config_name,
                roles = ?current.spec().allowed_cluster_roles,
                regex = ?current.namespace_pattern(),
                cache = %ctx.cache.path().display(),
                "KubeJitConfig deleted, keeping the last cached policy until it is recreated"
            );
            true
        }
        None => {
            warn!(
                config = %ctx.config_name,
                "KubeJitConfig deleted and no policy is cached, JitRequests will wait for a config"
            );
            false
        }
    }
}

/// Watch the singleton for deletions until the stream ends.
///
/// The controller only sees applied objects, so deletions are observed here.
pub async fn watch_deletions(client: Client, ctx: Arc<ConfigContext>, watch_timeout_secs: u32) {
    let configs: Api<KubeJitConfig> = Api::all(client);
    let selector = format!("metadata.name={}", ctx.config_name);
    let config = watcher::Config::default()
        .fields(&selector)
        .timeout(watch_timeout_secs);
    let mut events = std::pin::pin!(watcher::watcher(configs, config));

    while let Some(event) = events.next().await {
        match event {
            Ok(Event::Delete(deleted)) => {
                config_deleted(&deleted, &ctx);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "KubeJitConfig watch error, will retry");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
    info!("KubeJitConfig watch ended");
}

/// Requeue after a failed config reconcile
pub fn error_policy(
    config: Arc<KubeJitConfig>,
    error: &ReconcileError,
    _ctx: Arc<ConfigContext>,
) -> Action {
    error!(?error, config = %config.name_any(), "KubeJitConfig reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}

fn config_ref(config: &KubeJitConfig) -> ObjectReference {
    config.object_ref(&())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube_jit_common::events::NoopEventPublisher;

    fn spec(roles: &[&str], regex: Option<&str>) -> KubeJitConfigSpec {
        KubeJitConfigSpec {
            allowed_cluster_roles: roles.iter().map(|r| r.to_string()).collect(),
            namespace_allowed_regex: regex.map(String::from),
        }
    }

    fn named(name: &str, spec: KubeJitConfigSpec) -> Arc<KubeJitConfig> {
        Arc::new(KubeJitConfig::new(name, spec))
    }

    fn context(dir: &tempfile::TempDir) -> Arc<ConfigContext> {
        Arc::new(ConfigContext {
            config_name: "kube-jit-config".into(),
            cache: Arc::new(ConfigCache::new(dir.path().join("config.json"))),
            events: Arc::new(NoopEventPublisher),
        })
    }

    #[test]
    fn roles_and_namespaces_follow_policy() {
        let config = ValidatedConfig::new(spec(&["edit", "view"], Some("^app-"))).unwrap();
        assert!(config.role_allowed("edit"));
        assert!(!config.role_allowed("cluster-admin"));
        assert!(config.namespace_allowed("app-a"));
        assert!(!config.namespace_allowed("kube-system"));
        assert_eq!(config.namespace_pattern(), Some("^app-"));
    }

    #[test]
    fn missing_or_empty_pattern_allows_every_namespace() {
        for regex in [None, Some("")] {
            let config = ValidatedConfig::new(spec(&["edit"], regex)).unwrap();
            assert!(config.namespace_allowed("anything"));
            assert_eq!(config.namespace_pattern(), None);
        }
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = ValidatedConfig::new(spec(&["edit"], Some("(unclosed"))).unwrap_err();
        assert!(matches!(err, ReconcileError::Config(_)));
        assert!(err.to_string().contains("(unclosed"));
    }

    /// Story: the operator restarts and picks up the last good policy
    #[tokio::test]
    async fn story_policy_survives_restart_through_the_file_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let cache = ConfigCache::new(&path);
        assert!(cache.current().is_none());
        let changed = cache
            .store(ValidatedConfig::new(spec(&["edit"], Some("^app-"))).unwrap())
            .await
            .unwrap();
        assert!(changed);

        let reopened = ConfigCache::open(&path).await.unwrap();
        let config = reopened.current().unwrap();
        assert!(config.role_allowed("edit"));
        assert!(!config.namespace_allowed("default"));
    }

    #[tokio::test]
    async fn storing_the_same_policy_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConfigCache::new(dir.path().join("config.json"));
        let first = ValidatedConfig::new(spec(&["view"], None)).unwrap();
        assert!(cache.store(first.clone()).await.unwrap());
        assert!(!cache.store(first).await.unwrap());
    }

    #[tokio::test]
    async fn open_without_a_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConfigCache::open(dir.path().join("absent.json")).await.unwrap();
        assert!(cache.current().is_none());
    }

    #[tokio::test]
    async fn open_refuses_a_cached_invalid_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"allowedClusterRoles":["edit"],"namespaceAllowedRegex":"[z-a]"}"#,
        )
        .unwrap();
        assert!(ConfigCache::open(&path).await.is_err());
    }

    /// Story: an admin pushes a broken regex
    ///
    /// The reconciler keeps enforcing the previous policy rather than
    /// dropping the namespace restriction.
    #[tokio::test]
    async fn story_invalid_revision_keeps_previous_policy() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);

        reconcile(named("kube-jit-config", spec(&["edit"], Some("^app-"))), ctx.clone())
            .await
            .unwrap();
        reconcile(named("kube-jit-config", spec(&["admin"], Some("(("))), ctx.clone())
            .await
            .unwrap();

        let current = ctx.cache.current().unwrap();
        assert!(current.role_allowed("edit"));
        assert!(!current.role_allowed("admin"));
        assert_eq!(current.namespace_pattern(), Some("^app-"));
    }

    #[tokio::test]
    async fn deletion_keeps_the_cached_policy() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        let config = named("kube-jit-config", spec(&["edit"], Some("^app-")));
        assert!(!config_deleted(&config, &ctx));

        reconcile(config.clone(), ctx.clone()).await.unwrap();
        assert!(config_deleted(&config, &ctx));

        let current = ctx.cache.current().unwrap();
        assert!(current.role_allowed("edit"));
        assert_eq!(current.namespace_pattern(), Some("^app-"));
        let reopened = ConfigCache::open(ctx.cache.path()).await.unwrap();
        assert!(reopened.current().is_some());

        assert!(!config_deleted(&named("other", spec(&[], None)), &ctx));
    }

    #[tokio::test]
    async fn other_config_objects_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        reconcile(named("someone-elses-config", spec(&["edit"], None)), ctx.clone())
            .await
            .unwrap();
        assert!(ctx.cache.current().is_none());
    }
}
