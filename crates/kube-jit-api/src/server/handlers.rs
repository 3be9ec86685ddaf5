//! Route handlers

use axum::extract::{FromRequestParts, Path, Query, RawQuery, State};
use axum::http::header::SET_COOKIE;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use kube_jit_common::crd::JitRequestState;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::AppState;
use crate::error::{Error, Result};
use crate::model::{ApprovalRef, Decision, RecordFilter, RequestId, RequestStatus, SubmitRequest};
use crate::permissions::{resolve, Permissions};
use crate::service::{CallbackOutcome, DecisionReport};
use crate::session::{session_chunks, Session};

/// A verified, unexpired session
pub struct CurrentSession(pub Session);

impl FromRequestParts<AppState> for CurrentSession {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let session: Session = state
            .sessions
            .read(&parts.headers)
            .map_err(|e| Error::Unauthorized(e.to_string()))?
            .ok_or_else(|| Error::Unauthorized("no session".to_string()))?;
        if session.expires_at <= state.clock.now() {
            return Err(Error::Unauthorized("session expired".to_string()));
        }
        Ok(CurrentSession(session))
    }
}

fn message(text: impl Into<String>) -> Json<serde_json::Value> {
    Json(json!({ "message": text.into() }))
}

fn with_cookies(mut resp: Response, cookies: Vec<String>) -> Result<Response> {
    for cookie in cookies {
        let value = HeaderValue::from_str(&cookie)
            .map_err(|e| Error::Internal(format!("invalid cookie value: {}", e)))?;
        resp.headers_mut().append(SET_COOKIE, value);
    }
    Ok(resp)
}

fn store_session(
    state: &AppState,
    headers: &HeaderMap,
    session: &Session,
    resp: Response,
) -> Result<Response> {
    let previous = session_chunks(headers).len();
    let cookies = state
        .sessions
        .set_cookies(session, previous)
        .map_err(|e| Error::Internal(e.to_string()))?;
    with_cookies(resp, cookies)
}

/// Resolve permissions from the user's current directory groups.
///
/// Clusters whose group cache cannot be read are left out of the approver
/// computation.
async fn live_permissions(state: &AppState, session: &Session) -> Result<Permissions> {
    let groups = state.identity.groups(&session.token).await?;
    let mut caches = Vec::new();
    for cluster in state.clusters.cluster_names() {
        match state.clusters.groups_for(&cluster).await {
            Ok(entries) => caches.push(entries),
            Err(e) => warn!(cluster = %cluster, error = %e, "group cache unavailable"),
        }
    }
    Ok(resolve(
        &groups,
        &state.settings.admin_teams,
        &state.settings.platform_approver_teams,
        caches.iter().map(|c| c.as_slice()),
    ))
}

/// Memoized permissions when present, live ones otherwise
async fn session_permissions(state: &AppState, session: &Session) -> Result<Permissions> {
    match &session.permissions {
        Some(p) => Ok(p.clone()),
        None => live_permissions(state, session).await,
    }
}

pub(super) async fn client_id(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.identity.client_info())
}

#[derive(Debug, Deserialize)]
pub(super) struct OAuthParams {
    code: String,
}

pub(super) async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Query(params): Query<OAuthParams>,
) -> Result<Response> {
    if provider != state.identity.name() {
        return Err(Error::BadRequest(format!("unknown provider '{}'", provider)));
    }
    let login = state.identity.exchange_code(&params.code).await?;
    let user = login.user;

    if let Some(domain) = &state.settings.allowed_domain {
        let suffix = format!("@{}", domain.to_ascii_lowercase());
        if !user.email.to_ascii_lowercase().ends_with(&suffix) {
            warn!(user = %user.id, "login from outside the allowed domain");
            return Err(Error::Forbidden(format!(
                "e-mail domain is not allowed, expected {}",
                domain
            )));
        }
    }

    let session = Session {
        id: user.id.clone(),
        name: user.name.clone(),
        email: user.email.clone(),
        avatar_url: user.avatar_url.clone(),
        provider: user.provider.clone(),
        token: login.access_token,
        expires_at: state.clock.now() + Duration::seconds(state.settings.session_ttl_secs),
        permissions: None,
    };
    info!(user = %session.id, provider = %session.provider, "login");

    let body = Json(json!({
        "id": user.id,
        "name": user.name,
        "email": user.email,
        "avatar_url": user.avatar_url,
        "provider": user.provider,
        "expiresIn": login.expires_in,
    }));
    store_session(&state, &headers, &session, body.into_response())
}

pub(super) async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let count = session_chunks(&headers).len();
    with_cookies(
        message("logged out").into_response(),
        state.sessions.clear_cookies(count),
    )
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct PermissionsBody {
    #[serde(default)]
    provider: Option<String>,
}

pub(super) async fn permissions(
    State(state): State<AppState>,
    CurrentSession(mut session): CurrentSession,
    headers: HeaderMap,
    Json(body): Json<PermissionsBody>,
) -> Result<Response> {
    if let Some(provider) = &body.provider {
        if provider != &session.provider {
            return Err(Error::BadRequest(format!("unknown provider '{}'", provider)));
        }
    }
    let perms = live_permissions(&state, &session).await?;
    session.permissions = Some(perms.clone());
    store_session(&state, &headers, &session, Json(perms).into_response())
}

pub(super) async fn roles_and_clusters(
    State(state): State<AppState>,
    _session: CurrentSession,
) -> impl IntoResponse {
    Json(json!({
        "roles": state.service.allowed_roles(),
        "clusters": state.service.cluster_names(),
    }))
}

pub(super) async fn approving_groups(
    State(state): State<AppState>,
    _session: CurrentSession,
) -> impl IntoResponse {
    Json(state.settings.platform_approver_teams.clone())
}

pub(super) async fn submit_request(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Json(body): Json<SubmitRequest>,
) -> Result<Response> {
    let record = state.service.submit(&session.actor(), body).await?;
    Ok(Json(json!({
        "message": format!("request {} submitted", record.request.id),
        "id": record.request.id,
    }))
    .into_response())
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct HistoryParams {
    #[serde(rename = "userID", default)]
    user_id: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    status: Option<RequestStatus>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(rename = "startDate", default)]
    start_date: Option<DateTime<Utc>>,
    #[serde(rename = "endDate", default)]
    end_date: Option<DateTime<Utc>>,
}

pub(super) async fn history(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Query(params): Query<HistoryParams>,
) -> Result<Response> {
    let perms = session_permissions(&state, &session).await?;
    let filter = RecordFilter {
        user_id: params.user_id,
        username: params.username,
        status: params.status,
        created_after: params.start_date,
        created_before: params.end_date,
        limit: params.limit,
    };
    let records = state
        .service
        .records(&session.actor(), &perms.approver(), filter)
        .await?;
    Ok(Json(records).into_response())
}

pub(super) async fn approvals(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> Result<Response> {
    let perms = session_permissions(&state, &session).await?;
    let pending = state.service.pending_approvals(&perms.approver()).await?;
    Ok(Json(pending).into_response())
}

/// One entry of an approve/reject payload.
///
/// Admin clients send whole requests, optionally listing their namespaces;
/// other clients send one entry per namespace.
#[derive(Debug, Deserialize)]
pub(super) struct RequestEntry {
    id: RequestId,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    namespaces: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ApproveRejectBody {
    requests: Vec<RequestEntry>,
    #[serde(rename = "approverID", default)]
    approver_id: Option<String>,
    status: Decision,
}

fn approval_refs(entries: Vec<RequestEntry>) -> Vec<ApprovalRef> {
    entries
        .into_iter()
        .flat_map(|e| {
            let id = e.id;
            match (e.namespace, e.namespaces.is_empty()) {
                (Some(ns), _) => vec![ApprovalRef {
                    id,
                    namespace: Some(ns),
                }],
                (None, false) => e
                    .namespaces
                    .into_iter()
                    .map(|ns| ApprovalRef {
                        id,
                        namespace: Some(ns),
                    })
                    .collect(),
                (None, true) => vec![ApprovalRef { id, namespace: None }],
            }
        })
        .collect()
}

#[derive(Serialize)]
struct DecisionResponse {
    message: String,
    #[serde(flatten)]
    report: DecisionReport,
}

pub(super) async fn approve_reject(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Json(body): Json<ApproveRejectBody>,
) -> Result<Response> {
    if let Some(approver_id) = &body.approver_id {
        if approver_id != &session.id {
            return Err(Error::Forbidden(
                "approverID does not match the session".to_string(),
            ));
        }
    }
    if body.requests.is_empty() {
        return Err(Error::BadRequest("no requests referenced".to_string()));
    }

    let perms = live_permissions(&state, &session).await?;
    let refs = approval_refs(body.requests);
    let report = state
        .service
        .approve_or_reject(&session.actor(), &perms.approver(), body.status, &refs)
        .await?;

    let message = match body.status {
        Decision::Approved => format!("{} row(s) approved", report.applied.len()),
        Decision::Rejected => format!("{} row(s) rejected", report.applied.len()),
    };
    Ok(Json(DecisionResponse { message, report }).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TicketId {
    Text(String),
    Number(u64),
}

impl TicketId {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct CallbackBody {
    #[serde(rename = "ticketID")]
    ticket_id: TicketId,
    status: JitRequestState,
    #[serde(default)]
    message: String,
}

pub(super) async fn k8s_callback(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    Json(body): Json<CallbackBody>,
) -> Result<Response> {
    let query = query.ok_or_else(|| Error::Unauthorized("unsigned callback".to_string()))?;
    let url = format!("{}?{}", state.settings.callback_base, query);
    let verified = state.signer.verify(&url).map_err(|e| {
        warn!(error = %e, "callback signature rejected");
        Error::Unauthorized(e.to_string())
    })?;

    let ticket = body.ticket_id.into_string();
    if verified.param("ticketID") != Some(ticket.as_str()) {
        warn!(ticket_id = %ticket, "callback ticket does not match signed url");
        return Err(Error::Unauthorized(
            "ticketID does not match the signed url".to_string(),
        ));
    }
    let id: RequestId = ticket
        .parse()
        .map_err(|_| Error::BadRequest(format!("invalid ticketID '{}'", ticket)))?;

    let text = match state.service.callback(id, body.status, &body.message).await? {
        CallbackOutcome::Applied => "callback applied",
        CallbackOutcome::Duplicate => "callback already applied",
    };
    Ok(message(text).into_response())
}

pub(super) async fn clean_expired(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> Result<Response> {
    let perms = live_permissions(&state, &session).await?;
    if !perms.is_admin {
        return Err(Error::Forbidden("admin only".to_string()));
    }
    let report = state.service.clean_expired().await?;
    Ok(Json(json!({
        "message": format!("{} expired request(s) deleted", report.deleted.len()),
        "deleted": report.deleted,
        "expired": report.expired,
    }))
    .into_response())
}
