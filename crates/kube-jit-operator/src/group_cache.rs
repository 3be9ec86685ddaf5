//! JitGroupCache maintenance
//!
//! Adopted namespaces name the directory group that approves access to them.
//! The API reads that mapping from a single `JitGroupCache` object instead of
//! listing namespaces on every cluster, so this loop keeps the singleton in
//! step with the namespaces:
//!
//! 1. Immediately rebuilds it when an adopted namespace changes (watch-triggered)
//! 2. Periodically rebuilds it as a safety net (recreates a deleted singleton)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams, PostParams};
use kube::runtime::events::EventType;
use kube::runtime::watcher::{self, Event};
use kube::{Client, Resource, ResourceExt};
use kube_jit_common::crd::{GroupEntry, JitGroupCache, JitGroupCacheSpec};
use kube_jit_common::events::{actions, reasons, EventPublisher};
use kube_jit_common::kube_utils::{is_already_exists, is_conflict};
use kube_jit_common::retry::{retry_with_backoff_if, RetryConfig};
use kube_jit_common::{
    Error, ADOPT_LABEL, ADOPT_LABEL_SELECTOR, GROUP_CACHE_NAME, GROUP_ID_ANNOTATION,
    GROUP_NAME_ANNOTATION,
};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

/// Full resync period
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Kubernetes operations needed to maintain the cache
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GroupCacheStore: Send + Sync {
    /// Namespaces carrying the adoption label
    async fn list_adopted_namespaces(&self) -> Result<Vec<Namespace>, Error>;

    /// The singleton, if it exists
    async fn get_cache(&self) -> Result<Option<JitGroupCache>, Error>;

    /// Create the singleton
    async fn create_cache(&self, cache: &JitGroupCache) -> Result<(), Error>;

    /// Replace the singleton. The object's resourceVersion guards the write.
    async fn replace_cache(&self, cache: &JitGroupCache) -> Result<(), Error>;
}

/// [`GroupCacheStore`] backed by the cluster
pub struct KubeGroupCacheStore {
    client: Client,
}

impl KubeGroupCacheStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GroupCacheStore for KubeGroupCacheStore {
    async fn list_adopted_namespaces(&self) -> Result<Vec<Namespace>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default().labels(ADOPT_LABEL_SELECTOR))
            .await?;
        Ok(list.items)
    }

    async fn get_cache(&self) -> Result<Option<JitGroupCache>, Error> {
        let api: Api<JitGroupCache> = Api::all(self.client.clone());
        Ok(api.get_opt(GROUP_CACHE_NAME).await?)
    }

    async fn create_cache(&self, cache: &JitGroupCache) -> Result<(), Error> {
        let api: Api<JitGroupCache> = Api::all(self.client.clone());
        api.create(&PostParams::default(), cache).await?;
        Ok(())
    }

    async fn replace_cache(&self, cache: &JitGroupCache) -> Result<(), Error> {
        let api: Api<JitGroupCache> = Api::all(self.client.clone());
        api.replace(GROUP_CACHE_NAME, &PostParams::default(), cache)
            .await?;
        Ok(())
    }
}

/// Context for the group cache loop
pub struct GroupCacheContext {
    /// Cluster access
    pub store: Arc<dyn GroupCacheStore>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Backoff for lost write races
    pub retry: RetryConfig,
}

impl GroupCacheContext {
    /// Context using the cluster behind `client`
    pub fn new(client: Client, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            store: Arc::new(KubeGroupCacheStore::new(client)),
            events,
            retry: default_retry(),
        }
    }
}

fn default_retry() -> RetryConfig {
    RetryConfig::with_max_attempts(5)
        .initial_delay(Duration::from_millis(200))
        .max_delay(Duration::from_secs(5))
}

/// What a sync did to the singleton
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The singleton did not exist and was created
    Created(usize),
    /// The group set changed
    Updated(usize),
    /// Nothing to write
    Unchanged,
}

/// Group entries for every namespace that is adopted and fully annotated.
///
/// Sorted, so equal namespace sets always produce equal specs.
pub fn group_entries(namespaces: &[Namespace]) -> Vec<GroupEntry> {
    let mut entries: Vec<GroupEntry> = namespaces
        .iter()
        .filter(|ns| {
            ns.labels()
                .get(ADOPT_LABEL)
                .is_some_and(|v| v == "true")
        })
        .filter_map(|ns| {
            let annotations = ns.annotations();
            let group_id = annotations.get(GROUP_ID_ANNOTATION).filter(|v| !v.is_empty())?;
            let group_name = annotations
                .get(GROUP_NAME_ANNOTATION)
                .filter(|v| !v.is_empty())?;
            Some(GroupEntry {
                group_id: group_id.clone(),
                namespace: ns.name_any(),
                group_name: group_name.clone(),
            })
        })
        .collect();
    entries.sort();
    entries
}

fn lost_race(e: &Error) -> bool {
    matches!(e, Error::Kube { source } if is_conflict(source) || is_already_exists(source))
}

/// Rebuild the singleton from the adopted namespaces.
///
/// Write conflicts (and a concurrent create) are retried with backoff, each
/// attempt starting from a fresh read.
#[instrument(skip(ctx))]
pub async fn sync(ctx: &GroupCacheContext) -> Result<SyncOutcome, Error> {
    let outcome = retry_with_backoff_if(&ctx.retry, "sync_group_cache", lost_race, || {
        sync_once(ctx.store.as_ref())
    })
    .await?;

    match &outcome {
        SyncOutcome::Created(n) | SyncOutcome::Updated(n) => {
            info!(groups = *n, ?outcome, "JitGroupCache rebuilt");
            let cache = JitGroupCache::new(GROUP_CACHE_NAME, JitGroupCacheSpec::default());
            ctx.events
                .publish(
                    &cache.object_ref(&()),
                    EventType::Normal,
                    reasons::GROUP_CACHE_UPDATED,
                    actions::RECONCILE,
                    Some(format!("{} adopted namespace(s)", n)),
                )
                .await;
        }
        SyncOutcome::Unchanged => debug!("JitGroupCache already up to date"),
    }
    Ok(outcome)
}

async fn sync_once(store: &dyn GroupCacheStore) -> Result<SyncOutcome, Error> {
    let namespaces = store.list_adopted_namespaces().await?;
    let groups = group_entries(&namespaces);
    let count = groups.len();

    match store.get_cache().await? {
        None => {
            let cache = JitGroupCache::new(GROUP_CACHE_NAME, JitGroupCacheSpec { groups });
            store.create_cache(&cache).await?;
            Ok(SyncOutcome::Created(count))
        }
        Some(existing) if existing.spec.groups == groups => Ok(SyncOutcome::Unchanged),
        Some(mut existing) => {
            existing.spec.groups = groups;
            store.replace_cache(&existing).await?;
            Ok(SyncOutcome::Updated(count))
        }
    }
}

/// Watch adopted namespaces and keep the singleton current until the stream ends.
pub async fn run(client: Client, ctx: Arc<GroupCacheContext>, watch_timeout_secs: u32) {
    let namespaces: Api<Namespace> = Api::all(client);
    let config = watcher::Config::default()
        .labels(ADOPT_LABEL_SELECTOR)
        .timeout(watch_timeout_secs);
    let mut events = std::pin::pin!(watcher::watcher(namespaces, config));

    let mut resync = tokio::time::interval(RESYNC_INTERVAL);
    resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!("JitGroupCache sync started");

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    info!("Namespace watch ended, stopping JitGroupCache sync");
                    return;
                };
                handle_event(&ctx, event).await;
            }
            _ = resync.tick() => {
                debug!("Running periodic JitGroupCache sync");
                if let Err(e) = sync(&ctx).await {
                    warn!(error = %e, "Periodic JitGroupCache sync failed");
                }
            }
        }
    }
}

async fn handle_event(ctx: &GroupCacheContext, event: Result<Event<Namespace>, watcher::Error>) {
    let trigger = match event {
        Ok(Event::Apply(ns)) | Ok(Event::Delete(ns)) => Some(ns.name_any()),
        Ok(Event::InitDone) => Some("initial list".to_string()),
        Ok(Event::Init) | Ok(Event::InitApply(_)) => None,
        Err(e) => {
            warn!(error = %e, "Namespace watch error, will retry");
            tokio::time::sleep(Duration::from_secs(5)).await;
            None
        }
    };

    if let Some(namespace) = trigger {
        debug!(%namespace, "Adopted namespace changed");
        if let Err(e) = sync(ctx).await {
            warn!(error = %e, %namespace, "JitGroupCache sync failed");
        }
    }
}
