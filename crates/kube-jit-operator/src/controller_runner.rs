//! Controller runner - builds the operator's controller futures
//!
//! Each `build_*` function returns a Vec of boxed futures that the binary
//! joins. Construction stays separate from `main` so the wiring reads in one
//! place.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use kube_jit_common::crd::{JitRequest, KubeJitConfig};

use crate::config::{self as config_ctrl, ConfigContext};
use crate::group_cache::{self, GroupCacheContext};
use crate::request::{self as request_ctrl, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the JitRequest controller
///
/// Reconciles of distinct requests run in parallel up to `workers`.
pub fn build_request_controllers(
    client: Client,
    ctx: Arc<Context>,
    workers: u16,
) -> Vec<ControllerFuture> {
    let requests: Api<JitRequest> = Api::all(client);

    tracing::info!(workers, "- JitRequest controller");

    vec![Box::pin(
        Controller::new(requests, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .with_config(ControllerConfig::default().concurrency(workers))
            .shutdown_on_signal()
            .run(request_ctrl::reconcile, request_ctrl::error_policy, ctx)
            .for_each(log_reconcile_result("JitRequest")),
    )]
}

/// Build the KubeJitConfig controller and the JitGroupCache sync loop
pub fn build_support_controllers(
    client: Client,
    config_ctx: Arc<ConfigContext>,
    group_ctx: Arc<GroupCacheContext>,
) -> Vec<ControllerFuture> {
    let configs: Api<KubeJitConfig> = Api::all(client.clone());
    let selector = format!("metadata.name={}", config_ctx.config_name);
    let config_ctrl = Controller::new(
        configs,
        WatcherConfig::default()
            .fields(&selector)
            .timeout(WATCH_TIMEOUT_SECS),
    )
    .shutdown_on_signal()
    .run(config_ctrl::reconcile, config_ctrl::error_policy, config_ctx.clone())
    .for_each(log_reconcile_result("KubeJitConfig"));

    let config_deletions =
        config_ctrl::watch_deletions(client.clone(), config_ctx, WATCH_TIMEOUT_SECS);
    let group_sync = group_cache::run(client, group_ctx, WATCH_TIMEOUT_SECS);

    tracing::info!("- KubeJitConfig controller");
    tracing::info!("- JitGroupCache sync");

    vec![
        Box::pin(config_ctrl),
        Box::pin(config_deletions),
        Box::pin(group_sync),
    ]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
