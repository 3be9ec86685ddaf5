//! kube-jit API server

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::Parser;
use kube_jit_common::clock::{system_clock, SharedClock};
use kube_jit_common::kube_utils::create_client;
use kube_jit_common::retry::RetryConfig;
use kube_jit_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use kube_jit_api::clusters::credentials::{http_client, read_token_secret, source_for};
use kube_jit_api::clusters::{ClientCache, ClusterAccess, ClusterGateway, CredentialSource};
use kube_jit_api::config::{parse_origins, ApiConfig, SameSite};
use kube_jit_api::groups::GroupMappingCache;
use kube_jit_api::identity::{OidcIdentityProvider, OidcSettings};
use kube_jit_api::notify::LogNotifier;
use kube_jit_api::server::{self, AppState, ServerSettings};
use kube_jit_api::service::{AccessService, RejectionPolicy, ServiceSettings};
use kube_jit_api::session::SessionCodec;
use kube_jit_api::signed_url::UrlSigner;
use kube_jit_api::store::{open_store, SqliteSettings, StoreDsn};
use kube_jit_api::{API_PREFIX, CALLBACK_PATH};

/// kube-jit API - request and approve just-in-time Kubernetes access
#[derive(Parser, Debug)]
#[command(name = "kube-jit-api", version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "KUBE_JIT_LISTEN", default_value = "0.0.0.0:8589")]
    listen: SocketAddr,

    /// Key signing operator callback URLs
    #[arg(long, env = "KUBE_JIT_HMAC_SECRET", hide_env_values = true, default_value = "")]
    hmac_secret: String,

    /// Key signing session cookies
    #[arg(long, env = "KUBE_JIT_COOKIE_SECRET", hide_env_values = true, default_value = "")]
    cookie_secret: String,

    /// JSON array of origins allowed to call the API with credentials
    #[arg(long, env = "KUBE_JIT_ALLOW_ORIGINS", default_value = "")]
    allow_origins: String,

    /// Cluster and team configuration file
    #[arg(long, env = "KUBE_JIT_API_CONFIG", default_value = "/etc/kube-jit/api-config.yaml")]
    api_config: PathBuf,

    /// Public base URL of this API, used in callback URLs
    #[arg(long, env = "KUBE_JIT_CALLBACK_HOST")]
    callback_host: String,

    /// SameSite attribute of session cookies
    #[arg(long, env = "KUBE_JIT_COOKIE_SAME_SITE", default_value = "Lax")]
    cookie_same_site: SameSite,

    /// Session lifetime in seconds
    #[arg(long, env = "KUBE_JIT_SESSION_TTL_SECS", default_value_t = 43200)]
    session_ttl_secs: i64,

    /// Identity provider name used in the login route
    #[arg(long, env = "KUBE_JIT_OAUTH_PROVIDER", default_value = "oidc")]
    oauth_provider: String,

    /// OAuth client id
    #[arg(long, env = "KUBE_JIT_OAUTH_CLIENT_ID", default_value = "")]
    oauth_client_id: String,

    /// OAuth client secret
    #[arg(long, env = "KUBE_JIT_OAUTH_CLIENT_SECRET", hide_env_values = true, default_value = "")]
    oauth_client_secret: String,

    /// Redirect URI registered with the provider
    #[arg(long, env = "KUBE_JIT_OAUTH_REDIRECT_URI", default_value = "")]
    oauth_redirect_uri: String,

    /// Authorization endpoint
    #[arg(long, env = "KUBE_JIT_OAUTH_AUTH_URL", default_value = "")]
    oauth_auth_url: String,

    /// Token endpoint
    #[arg(long, env = "KUBE_JIT_OAUTH_TOKEN_URL", default_value = "")]
    oauth_token_url: String,

    /// Userinfo endpoint
    #[arg(long, env = "KUBE_JIT_OAUTH_USERINFO_URL", default_value = "")]
    oauth_userinfo_url: String,

    /// Userinfo claim listing the user's groups
    #[arg(long, env = "KUBE_JIT_OAUTH_GROUPS_CLAIM", default_value = "groups")]
    oauth_groups_claim: String,

    /// Only allow logins with e-mails in this domain
    #[arg(long, env = "KUBE_JIT_ALLOWED_DOMAIN")]
    allowed_domain: Option<String>,

    /// Effect of a non-admin rejection: row-only or whole-request
    #[arg(long, env = "KUBE_JIT_REJECTION_POLICY", default_value = "row-only")]
    rejection_policy: RejectionPolicy,

    /// Attempts at creating a JitRequest before the request is demoted
    #[arg(long, env = "KUBE_JIT_MATERIALIZE_ATTEMPTS", default_value_t = 5)]
    materialize_attempts: u32,

    /// Run the expiry sweep every N seconds (0 disables it)
    #[arg(long, env = "KUBE_JIT_CLEAN_EXPIRED_INTERVAL_SECS", default_value_t = 0)]
    clean_expired_interval_secs: u64,

    /// Timeout for outbound HTTP calls in seconds
    #[arg(long, env = "KUBE_JIT_HTTP_TIMEOUT_SECS", default_value_t = 60)]
    http_timeout_secs: u64,

    /// Request database: sqlite://<path> or memory:
    #[arg(
        long,
        env = "KUBE_JIT_DATABASE_DSN",
        default_value = "sqlite:///var/lib/kube-jit/requests.db"
    )]
    database_dsn: StoreDsn,

    /// Read connections kept open next to the writer
    #[arg(long, env = "KUBE_JIT_DATABASE_POOL_SIZE", default_value_t = 4)]
    database_pool_size: usize,

    /// How long a database statement waits for a lock, in milliseconds
    #[arg(long, env = "KUBE_JIT_DATABASE_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    database_busy_timeout_ms: u64,

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
    init_telemetry(TelemetryConfig {
        service_name: "kube-jit-api".to_string(),
        format: cli.log_format,
    })?;

    if let Err(e) = run(cli).await {
        error!(error = %format!("{:#}", e), "kube-jit-api failed");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if cli.hmac_secret.is_empty() {
        bail!("--hmac-secret is required");
    }
    if cli.cookie_secret.is_empty() {
        bail!("--cookie-secret is required");
    }
    let config = ApiConfig::load(&cli.api_config)
        .with_context(|| format!("loading {}", cli.api_config.display()))?;
    let allow_origins = parse_origins(&cli.allow_origins)?;

    let clock: SharedClock = system_clock();
    let timeout = Duration::from_secs(cli.http_timeout_secs);
    let callback_base = format!(
        "{}{}{}",
        cli.callback_host.trim_end_matches('/'),
        API_PREFIX,
        CALLBACK_PATH
    );

    let store = open_store(
        &cli.database_dsn,
        |path| SqliteSettings {
            read_pool_size: cli.database_pool_size,
            busy_timeout: Duration::from_millis(cli.database_busy_timeout_ms),
            ..SqliteSettings::new(path)
        },
        clock.clone(),
    )
    .context("opening request store")?;
    if cli.database_dsn == StoreDsn::Memory {
        warn!("requests are kept in memory and are lost on restart");
    }

    let clusters = build_clusters(&config, clock.clone(), timeout).await?;
    let signer = Arc::new(UrlSigner::new(cli.hmac_secret.as_bytes(), clock.clone())?);
    let sessions = Arc::new(SessionCodec::new(
        cli.cookie_secret.as_bytes(),
        cli.cookie_same_site,
        cli.session_ttl_secs,
    )?);
    let identity = Arc::new(OidcIdentityProvider::new(
        OidcSettings {
            provider: cli.oauth_provider,
            client_id: cli.oauth_client_id,
            client_secret: cli.oauth_client_secret,
            redirect_uri: cli.oauth_redirect_uri,
            auth_url: cli.oauth_auth_url,
            token_url: cli.oauth_token_url,
            userinfo_url: cli.oauth_userinfo_url,
            groups_claim: cli.oauth_groups_claim,
        },
        timeout,
    )?);

    let service = Arc::new(AccessService::new(
        store,
        clusters.clone(),
        signer.clone(),
        Arc::new(LogNotifier),
        clock.clone(),
        ServiceSettings {
            allowed_roles: config.allowed_roles.clone(),
            callback_base: callback_base.clone(),
            rejection_policy: cli.rejection_policy,
            materialize_retry: RetryConfig::with_max_attempts(cli.materialize_attempts.max(1))
                .max_delay(Duration::from_secs(5)),
        },
    ));

    let sweeper = (cli.clean_expired_interval_secs > 0).then(|| {
        let service = service.clone();
        let period = Duration::from_secs(cli.clean_expired_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = service.clean_expired().await {
                    warn!(error = %e, "periodic expiry sweep failed");
                }
            }
        })
    });

    let state = AppState {
        service,
        clusters,
        identity,
        sessions,
        signer,
        clock,
        settings: Arc::new(ServerSettings {
            admin_teams: config.admin_teams.clone(),
            platform_approver_teams: config.platform_approver_teams.clone(),
            allowed_domain: cli.allowed_domain,
            callback_base,
            session_ttl_secs: cli.session_ttl_secs,
            allow_origins,
        }),
    };

    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    server::serve(listener, server::router(state), shutdown_signal()).await?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    info!("kube-jit-api stopped");
    Ok(())
}

/// Build credential sources for every configured cluster.
///
/// Generic clusters may reference a token Secret, which is read once here
/// from the cluster the API runs in.
async fn build_clusters(
    config: &ApiConfig,
    clock: SharedClock,
    timeout: Duration,
) -> anyhow::Result<Arc<dyn ClusterGateway>> {
    let http = http_client(timeout)?;
    let local = if config.clusters.iter().any(|c| c.token_secret.is_some()) {
        Some(create_client(None).await?)
    } else {
        None
    };

    let mut sources: BTreeMap<String, Arc<dyn CredentialSource>> = BTreeMap::new();
    for cluster in &config.clusters {
        let token = match (&cluster.token_secret, &local) {
            (Some(secret), Some(client)) => {
                Some(read_token_secret(client, &cluster.name, secret).await?)
            }
            _ => None,
        };
        let source = source_for(cluster, token, http.clone())?;
        info!(cluster = %cluster.name, provider = %cluster.cluster_type, "cluster configured");
        sources.insert(cluster.name.clone(), Arc::from(source));
    }
    if sources.is_empty() {
        warn!("no clusters configured");
    }

    let clients = ClientCache::new(sources, clock.clone());
    let groups = GroupMappingCache::new(clock);
    Ok(Arc::new(ClusterAccess::new(clients, groups)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install signal handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
