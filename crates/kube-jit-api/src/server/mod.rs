//! HTTP surface
//!
//! Every route lives under [`API_PREFIX`]. Handlers authenticate through the
//! chunked session cookie, except `/k8s-callback`, which is authenticated by
//! its signed URL, and the login endpoints.

mod handlers;
#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue, Method, Request};
use axum::routing::{get, post};
use axum::Router;
use kube_jit_common::clock::SharedClock;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer};
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tower_http::ServiceBuilderExt;
use tracing::{info, info_span, Level};
use uuid::Uuid;

use crate::clusters::ClusterGateway;
use crate::error::{Error, Result};
use crate::identity::IdentityProvider;
use crate::permissions::Team;
use crate::service::AccessService;
use crate::session::SessionCodec;
use crate::signed_url::SharedSigner;
use crate::{API_PREFIX, CALLBACK_PATH};

pub use handlers::CurrentSession;

/// Request id header set on every request and echoed on the response
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Server-level settings
#[derive(Clone, Debug, Default)]
pub struct ServerSettings {
    /// Teams granting admin rights
    pub admin_teams: Vec<Team>,
    /// Teams granting platform approver rights
    pub platform_approver_teams: Vec<Team>,
    /// Only e-mails in this domain may log in
    pub allowed_domain: Option<String>,
    /// Absolute callback URL, before signing
    pub callback_base: String,
    /// Session lifetime
    pub session_ttl_secs: i64,
    /// CORS origins allowed to send credentials
    pub allow_origins: Vec<String>,
}

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Request workflow
    pub service: Arc<AccessService>,
    /// Target clusters, for permission resolution
    pub clusters: Arc<dyn ClusterGateway>,
    /// Login and directory groups
    pub identity: Arc<dyn IdentityProvider>,
    /// Session cookie codec
    pub sessions: Arc<SessionCodec>,
    /// Callback URL verifier
    pub signer: SharedSigner,
    /// Time source
    pub clock: SharedClock,
    /// Settings
    pub settings: Arc<ServerSettings>,
}

#[derive(Clone, Default)]
struct JitRequestId;

impl MakeRequestId for JitRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = format!("req-{}", Uuid::new_v4().simple());
        Some(RequestId::new(
            HeaderValue::from_str(&id).unwrap_or_else(|_| HeaderValue::from_static("req-unknown")),
        ))
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    if origins.is_empty() {
        return CorsLayer::new();
    }
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(3600))
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    let x_request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    let sensitive: Arc<[HeaderName]> = vec![
        header::AUTHORIZATION,
        header::COOKIE,
        header::SET_COOKIE,
    ]
    .into();

    let middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(x_request_id.clone(), JitRequestId))
        .sensitive_request_headers(sensitive.clone())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri().path(),
                        request_id = ?request.headers().get(REQUEST_ID_HEADER),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .sensitive_response_headers(sensitive)
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .layer(cors_layer(&state.settings.allow_origins));

    let api = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/client_id", get(handlers::client_id))
        .route("/oauth/{provider}/callback", get(handlers::oauth_callback))
        .route("/logout", post(handlers::logout))
        .route("/permissions", post(handlers::permissions))
        .route("/roles-and-clusters", get(handlers::roles_and_clusters))
        .route("/approving-groups", get(handlers::approving_groups))
        .route("/submit-request", post(handlers::submit_request))
        .route("/history", get(handlers::history))
        .route("/approvals", get(handlers::approvals))
        .route("/approve-reject", post(handlers::approve_reject))
        .route(CALLBACK_PATH, post(handlers::k8s_callback))
        .route("/admin/clean-expired", post(handlers::clean_expired));

    Router::new()
        .nest(API_PREFIX, api)
        .layer(middleware)
        .with_state(state)
}

/// Serve `router` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .map_err(|e| Error::Internal(format!("listener address: {}", e)))?;
    info!(%addr, "Starting kube-jit API server");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Internal(format!("server error: {}", e)))
}
