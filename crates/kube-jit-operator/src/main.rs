//! kube-jit operator - time-boxed RBAC grants for approved JitRequests

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::{Api, Client};
use kube_jit_common::crd::{all_crds, KubeJitConfig};
use kube_jit_common::events::{EventPublisher, KubeEventPublisher};
use kube_jit_common::kube_utils::{apply_crd, create_client};
use kube_jit_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use kube_jit_common::DEFAULT_CONFIG_NAME;

use kube_jit_operator::callback::HttpCallbackClient;
use kube_jit_operator::config::{ConfigCache, ConfigContext, ValidatedConfig};
use kube_jit_operator::controller_runner::{build_request_controllers, build_support_controllers};
use kube_jit_operator::group_cache::GroupCacheContext;
use kube_jit_operator::request::Context;
use kube_jit_operator::CONTROLLER_NAME;

/// kube-jit operator - grant and revoke just-in-time cluster access
#[derive(Parser, Debug)]
#[command(name = "kube-jit-operator", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Name of the KubeJitConfig singleton to follow
    #[arg(long, env = "KUBE_JIT_CONFIG_NAME", default_value = DEFAULT_CONFIG_NAME)]
    config_name: String,

    /// File mirroring the last valid KubeJitConfig
    #[arg(
        long,
        env = "KUBE_JIT_CONFIG_CACHE_PATH",
        default_value = "/tmp/kube-jit-config.json"
    )]
    config_cache_path: PathBuf,

    /// JitRequests reconciled in parallel
    #[arg(long, env = "KUBE_JIT_WORKERS", default_value_t = 4)]
    workers: u16,

    /// Timeout for a single callback attempt in seconds
    #[arg(long, env = "KUBE_JIT_CALLBACK_TIMEOUT_SECS", default_value_t = 60)]
    callback_timeout_secs: u64,

    /// Log output format (json or pretty)
    #[arg(long, env = "KUBE_JIT_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        for crd in all_crds() {
            println!("---");
            print!("{}", serde_yaml::to_string(&crd)?);
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: CONTROLLER_NAME.to_string(),
        format: cli.log_format,
    })?;

    if let Err(e) = run(cli).await {
        tracing::error!(error = %format!("{:#}", e), "kube-jit-operator failed");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = create_client(None).await?;

    tracing::info!("Installing CRDs...");
    for crd in all_crds() {
        apply_crd(&client, &crd).await?;
    }

    let cache = Arc::new(load_config(&client, &cli.config_name, &cli.config_cache_path).await?);

    let callbacks = Arc::new(HttpCallbackClient::new(
        Duration::from_secs(cli.callback_timeout_secs),
        HttpCallbackClient::default_retry(),
    )?);
    let events: Arc<dyn EventPublisher> =
        Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));

    let request_ctx = Arc::new(
        Context::builder(client.clone(), cache.clone(), callbacks)
            .events(events.clone())
            .build(),
    );
    let config_ctx = Arc::new(ConfigContext {
        config_name: cli.config_name.clone(),
        cache,
        events: events.clone(),
    });
    let group_ctx = Arc::new(GroupCacheContext::new(client.clone(), events));

    tracing::info!("Starting controllers:");
    let mut controllers =
        build_request_controllers(client.clone(), request_ctx, cli.workers.max(1));
    controllers.extend(build_support_controllers(client, config_ctx, group_ctx));

    let _ = futures::future::select_all(controllers).await;
    tracing::info!("kube-jit-operator shutting down");
    Ok(())
}

/// Seed the config cache before any request is reconciled.
///
/// The live object wins over the file cache. An invalid namespace pattern in
/// whichever one is used is fatal.
async fn load_config(
    client: &Client,
    name: &str,
    cache_path: &Path,
) -> anyhow::Result<ConfigCache> {
    let configs: Api<KubeJitConfig> = Api::all(client.clone());
    if let Some(config) = configs.get_opt(name).await? {
        let validated = ValidatedConfig::new(config.spec)
            .with_context(|| format!("KubeJitConfig {} is invalid", name))?;
        let cache = ConfigCache::new(cache_path);
        cache.store(validated).await?;
        tracing::info!(config = %name, "KubeJitConfig loaded");
        return Ok(cache);
    }

    let cache = ConfigCache::open(cache_path)
        .await
        .context("loading cached KubeJitConfig")?;
    if cache.current().is_some() {
        tracing::warn!(
            config = %name,
            path = %cache.path().display(),
            "KubeJitConfig not found, using cached copy"
        );
    } else {
        tracing::warn!(
            config = %name,
            "KubeJitConfig not found, new requests wait until it exists"
        );
    }
    Ok(cache)
}
