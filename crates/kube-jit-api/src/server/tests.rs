use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use chrono::Duration;
use kube_jit_common::clock::{ManualClock, SharedClock};
use kube_jit_common::crd::GroupEntry;
use kube_jit_common::retry::RetryConfig;
use tower::ServiceExt;

use super::*;
use crate::clusters::{CreateOutcome, MockClusterGateway};
use crate::config::SameSite;
use crate::identity::{ClientInfo, LoginResult, UserInfo};
use crate::model::RequestStatus;
use crate::notify::LogNotifier;
use crate::permissions::{Permissions, Team};
use crate::service::{RejectionPolicy, ServiceSettings};
use crate::session::Session;
use crate::signed_url::UrlSigner;
use crate::store::tests::{base_time, draft};
use crate::store::{MemoryStore, RequestStore};

const CALLBACK_BASE: &str = "https://jit.example.com/kube-jit-api/k8s-callback";

/// Identity provider whose codes and tokens are user ids
struct StaticIdentity {
    groups: HashMap<String, Vec<Team>>,
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    fn name(&self) -> &str {
        "oidc"
    }

    fn client_info(&self) -> ClientInfo {
        ClientInfo {
            client_id: "kube-jit".into(),
            provider: "oidc".into(),
            redirect_uri: "https://jit.example.com/callback".into(),
            auth_url: "https://idp.example.com/authorize".into(),
        }
    }

    async fn exchange_code(&self, code: &str) -> Result<LoginResult> {
        Ok(LoginResult {
            user: UserInfo {
                id: code.into(),
                name: format!("{} name", code),
                email: format!("{}@example.com", code),
                avatar_url: String::new(),
                provider: "oidc".into(),
            },
            access_token: code.into(),
            expires_in: 3600,
        })
    }

    async fn groups(&self, access_token: &str) -> Result<Vec<Team>> {
        Ok(self.groups.get(access_token).cloned().unwrap_or_default())
    }
}

struct TestApp {
    router: Router,
    state: AppState,
    store: Arc<MemoryStore>,
    clock: ManualClock,
}

fn gateway() -> MockClusterGateway {
    let mut gw = MockClusterGateway::new();
    gw.expect_has_cluster().returning(|c| c == "c1");
    gw.expect_cluster_names()
        .returning(|| vec!["c1".to_string()]);
    gw.expect_groups_for().returning(|_| {
        Ok(Arc::new(vec![
            GroupEntry {
                group_id: "ga".into(),
                namespace: "app-a".into(),
                group_name: "group-a".into(),
            },
            GroupEntry {
                group_id: "gb".into(),
                namespace: "app-b".into(),
                group_name: "group-b".into(),
            },
        ]))
    });
    gw.expect_create_jit_request()
        .returning(|_, _| Ok(CreateOutcome::Created));
    gw
}

fn app() -> TestApp {
    let clock = ManualClock::new(base_time());
    let shared: SharedClock = Arc::new(clock.clone());
    let store = Arc::new(MemoryStore::new(shared.clone()));
    let signer = Arc::new(UrlSigner::new(b"hmac-secret", shared.clone()).unwrap());
    let clusters: Arc<dyn ClusterGateway> = Arc::new(gateway());

    let service = Arc::new(AccessService::new(
        store.clone(),
        clusters.clone(),
        signer.clone(),
        Arc::new(LogNotifier),
        shared.clone(),
        ServiceSettings {
            allowed_roles: vec!["edit".into()],
            callback_base: CALLBACK_BASE.into(),
            rejection_policy: RejectionPolicy::RowOnly,
            materialize_retry: RetryConfig::with_max_attempts(2)
                .initial_delay(StdDuration::from_millis(1)),
        },
    ));

    let identity = StaticIdentity {
        groups: HashMap::from([
            ("u2".to_string(), vec![Team::new("ga", "group-a")]),
            ("admin".to_string(), vec![Team::new("99", "sre")]),
        ]),
    };

    let state = AppState {
        service,
        clusters,
        identity: Arc::new(identity),
        sessions: Arc::new(SessionCodec::new(b"cookie-secret", SameSite::Lax, 3600).unwrap()),
        signer,
        clock: shared,
        settings: Arc::new(ServerSettings {
            admin_teams: vec![Team::new("99", "sre")],
            platform_approver_teams: vec![Team::new("42", "platform")],
            allowed_domain: Some("example.com".into()),
            callback_base: CALLBACK_BASE.into(),
            session_ttl_secs: 3600,
            allow_origins: vec!["https://jit.example.com".into()],
        }),
    };

    TestApp {
        router: router(state.clone()),
        state,
        store,
        clock,
    }
}

fn cookie_for(state: &AppState, user: &str) -> String {
    let session = Session {
        id: user.into(),
        name: format!("{} name", user),
        email: format!("{}@example.com", user),
        avatar_url: String::new(),
        provider: "oidc".into(),
        token: user.into(),
        expires_at: base_time() + Duration::hours(1),
        permissions: None,
    };
    cookie_header(&state.sessions.set_cookies(&session, 0).unwrap())
}

/// Session cookie carrying memoized permissions
fn cookie_with_permissions(state: &AppState, user: &str, permissions: Permissions) -> String {
    let session = Session {
        id: user.into(),
        name: format!("{} name", user),
        email: format!("{}@example.com", user),
        avatar_url: String::new(),
        provider: "oidc".into(),
        token: user.into(),
        expires_at: base_time() + Duration::hours(1),
        permissions: Some(permissions),
    };
    cookie_header(&state.sessions.set_cookies(&session, 0).unwrap())
}

fn cookie_header(set_cookies: &[String]) -> String {
    set_cookies
        .iter()
        .map(|c| c.split(';').next().unwrap().to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn set_cookies(resp: &Response) -> Vec<String> {
    resp.headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(c) = cookie {
        builder = builder.header(header::COOKIE, c);
    }
    builder.body(Body::empty()).unwrap()
}

fn post(uri: &str, cookie: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(c) = cookie {
        builder = builder.header(header::COOKIE, c);
    }
    builder
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

async fn send(app: &TestApp, req: Request<Body>) -> Response {
    app.router.clone().oneshot(req).await.unwrap()
}

async fn body_json(resp: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn submission(namespaces: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "clusterName": "c1",
        "roleName": "edit",
        "namespaces": namespaces,
        "justification": "incident 42",
        "startDate": (base_time() + Duration::minutes(1)).to_rfc3339(),
        "endDate": (base_time() + Duration::minutes(10)).to_rfc3339(),
    })
}

#[tokio::test]
async fn healthz_is_public_and_tagged_with_request_id() {
    let app = app();
    let resp = send(&app, get("/kube-jit-api/healthz", None)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let id = resp.headers().get(REQUEST_ID_HEADER).unwrap().to_str().unwrap();
    assert!(id.starts_with("req-"));
}

#[tokio::test]
async fn client_id_describes_login() {
    let app = app();
    let resp = send(&app, get("/kube-jit-api/client_id", None)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["client_id"], "kube-jit");
    assert_eq!(body["provider"], "oidc");
}

#[tokio::test]
async fn protected_routes_require_a_session() {
    let app = app();
    let resp = send(&app, post("/kube-jit-api/submit-request", None, submission(&["app-a"]))).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp).await;
    assert_eq!(body["status"], 401);
    assert!(body["error"].as_str().unwrap().contains("no session"));
}

#[tokio::test]
async fn expired_sessions_are_refused() {
    let app = app();
    let cookie = cookie_for(&app.state, "u1");
    app.clock.advance(Duration::hours(2));
    let resp = send(&app, get("/kube-jit-api/approvals", Some(&cookie))).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn login_sets_session_cookies_usable_for_submit() {
    let app = app();
    let resp = send(&app, get("/kube-jit-api/oauth/oidc/callback?code=u1", None)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let cookies = set_cookies(&resp);
    assert!(!cookies.is_empty());
    assert!(cookies[0].starts_with("kube_jit_session_0="));
    assert!(cookies[0].contains("HttpOnly"));
    let body = body_json(resp).await;
    assert_eq!(body["email"], "u1@example.com");
    assert_eq!(body["expiresIn"], 3600);

    let cookie = cookie_header(&cookies);
    let resp = send(
        &app,
        post("/kube-jit-api/submit-request", Some(&cookie), submission(&["app-a"])),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["message"], "request 1 submitted");

    let resp = send(&app, get("/kube-jit-api/history?userID=u1", Some(&cookie))).await;
    let records = body_json(resp).await;
    assert_eq!(records.as_array().unwrap().len(), 1);
    assert_eq!(records[0]["userID"], "u1");
    assert_eq!(records[0]["namespaceApprovals"][0]["groupID"], "ga");
}

#[tokio::test]
async fn login_outside_allowed_domain_is_forbidden() {
    let mut app = app();
    let mut settings = (*app.state.settings).clone();
    settings.allowed_domain = Some("corp.example.org".into());
    app.state.settings = Arc::new(settings);
    app.router = router(app.state.clone());

    let resp = send(&app, get("/kube-jit-api/oauth/oidc/callback?code=u1", None)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(set_cookies(&resp).is_empty());
}

#[tokio::test]
async fn unknown_provider_is_a_bad_request() {
    let app = app();
    let resp = send(&app, get("/kube-jit-api/oauth/github/callback?code=u1", None)).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_namespace_is_a_bad_request() {
    let app = app();
    let cookie = cookie_for(&app.state, "u1");
    let resp = send(
        &app,
        post("/kube-jit-api/submit-request", Some(&cookie), submission(&["app-z"])),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["error"], "invalid namespace: app-z");
}

#[tokio::test]
async fn permissions_are_resolved_and_memoized() {
    let app = app();
    let cookie = cookie_for(&app.state, "u2");
    let resp = send(
        &app,
        post("/kube-jit-api/permissions", Some(&cookie), serde_json::json!({"provider": "oidc"})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let cookies = set_cookies(&resp);
    let body = body_json(resp).await;
    assert_eq!(body["isAdmin"], false);
    assert_eq!(body["approverGroups"][0]["id"], "ga");

    let session: Session = app
        .state
        .sessions
        .decode(
            &cookies
                .iter()
                .map(|c| {
                    let pair = c.split(';').next().unwrap();
                    pair.split_once('=').unwrap().1.to_string()
                })
                .collect::<Vec<_>>(),
        )
        .unwrap();
    assert_eq!(
        session.permissions.unwrap().approver_groups,
        vec![Team::new("ga", "group-a")]
    );
}

/// Story: submit, approve by the group holder, then report success
#[tokio::test]
async fn story_approval_and_signed_callback() {
    let app = app();
    let requester = cookie_for(&app.state, "u1");
    let approver = cookie_for(&app.state, "u2");

    send(
        &app,
        post("/kube-jit-api/submit-request", Some(&requester), submission(&["app-a"])),
    )
    .await;

    let resp = send(&app, get("/kube-jit-api/approvals", Some(&approver))).await;
    let pending = body_json(resp).await;
    assert_eq!(pending.as_array().unwrap().len(), 1);

    let resp = send(
        &app,
        post(
            "/kube-jit-api/approve-reject",
            Some(&approver),
            serde_json::json!({
                "requests": [{"id": 1, "namespace": "app-a"}],
                "approverID": "u2",
                "status": "Approved",
            }),
        ),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["approved"], serde_json::json!([1]));
    assert_eq!(body["message"], "1 row(s) approved");

    let signed = app
        .state
        .signer
        .sign(&format!("{}?ticketID=1", CALLBACK_BASE), base_time() + Duration::minutes(10))
        .unwrap();
    let query = url::Url::parse(&signed).unwrap().query().unwrap().to_string();
    let callback = format!("/kube-jit-api/k8s-callback?{}", query);
    let report = serde_json::json!({"ticketID": "1", "status": "Succeeded", "message": "bindings created"});

    let resp = send(&app, post(&callback, None, report.clone())).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["message"], "callback applied");
    let record = app.store.get(1).await.unwrap().unwrap();
    assert_eq!(record.request.status, RequestStatus::Succeeded);
    assert_eq!(record.request.notes, "bindings created");

    let resp = send(&app, post(&callback, None, report)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["message"], "callback already applied");
}

/// Group membership revoked at the identity provider after the session
/// memoized it must not let the user decide rows of that group.
#[tokio::test]
async fn decisions_use_live_groups_not_memoized_ones() {
    let app = app();
    let requester = cookie_for(&app.state, "u1");
    send(
        &app,
        post("/kube-jit-api/submit-request", Some(&requester), submission(&["app-a"])),
    )
    .await;

    let stale = cookie_with_permissions(
        &app.state,
        "u3",
        Permissions {
            approver_groups: vec![Team::new("ga", "group-a")],
            ..Default::default()
        },
    );
    let resp = send(
        &app,
        post(
            "/kube-jit-api/approve-reject",
            Some(&stale),
            serde_json::json!({
                "requests": [{"id": 1, "namespace": "app-a"}],
                "approverID": "u3",
                "status": "Rejected",
            }),
        ),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["message"], "0 row(s) rejected");
    assert_eq!(body["applied"], serde_json::json!([]));
    assert_eq!(
        body["skipped"],
        serde_json::json!([{"id": 1, "namespace": "app-a"}])
    );

    let record = app.store.get(1).await.unwrap().unwrap();
    assert_eq!(record.request.status, RequestStatus::Requested);
    let row = &record.namespace_approvals[0];
    assert!(!row.approved);
    assert_eq!(row.approver_id, None);
    assert!(record.request.approver_ids.is_empty());
}

#[tokio::test]
async fn approver_id_must_match_the_session() {
    let app = app();
    let cookie = cookie_for(&app.state, "u2");
    let resp = send(
        &app,
        post(
            "/kube-jit-api/approve-reject",
            Some(&cookie),
            serde_json::json!({
                "requests": [{"id": 1}],
                "approverID": "someone-else",
                "status": "Approved",
            }),
        ),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

async fn approved_request(app: &TestApp) {
    let mut record = draft(&[("app-a", "ga")], base_time() + Duration::minutes(1));
    record.request.status = RequestStatus::Approved;
    app.store.insert(record).await.unwrap();
}

fn signed_callback(app: &TestApp, ticket: &str, expiry: chrono::DateTime<chrono::Utc>) -> String {
    let signed = app
        .state
        .signer
        .sign(&format!("{}?ticketID={}", CALLBACK_BASE, ticket), expiry)
        .unwrap();
    let query = url::Url::parse(&signed).unwrap().query().unwrap().to_string();
    format!("/kube-jit-api/k8s-callback?{}", query)
}

/// Story: an expired callback URL is refused without touching the request
#[tokio::test]
async fn story_expired_callback_url() {
    let app = app();
    approved_request(&app).await;
    let uri = signed_callback(&app, "1", base_time() + Duration::minutes(1));
    app.clock.advance(Duration::minutes(2));

    let resp = send(
        &app,
        post(&uri, None, serde_json::json!({"ticketID": "1", "status": "Succeeded"})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let record = app.store.get(1).await.unwrap().unwrap();
    assert_eq!(record.request.status, RequestStatus::Approved);
}

#[tokio::test]
async fn tampered_or_rebound_callbacks_are_unauthorized() {
    let app = app();
    approved_request(&app).await;
    let uri = signed_callback(&app, "1", base_time() + Duration::minutes(1));

    let tampered = uri.replace("ticketID=1", "ticketID=2");
    let resp = send(
        &app,
        post(&tampered, None, serde_json::json!({"ticketID": "2", "status": "Succeeded"})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = send(
        &app,
        post(&uri, None, serde_json::json!({"ticketID": 2, "status": "Succeeded"})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = send(
        &app,
        post(
            "/kube-jit-api/k8s-callback",
            None,
            serde_json::json!({"ticketID": "1", "status": "Succeeded"}),
        ),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let record = app.store.get(1).await.unwrap().unwrap();
    assert_eq!(record.request.status, RequestStatus::Approved);
}

#[tokio::test]
async fn numeric_ticket_ids_are_accepted() {
    let app = app();
    approved_request(&app).await;
    let uri = signed_callback(&app, "1", base_time() + Duration::minutes(1));
    let resp = send(
        &app,
        post(&uri, None, serde_json::json!({"ticketID": 1, "status": "Pending", "message": "waiting"})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let record = app.store.get(1).await.unwrap().unwrap();
    assert_eq!(record.request.status, RequestStatus::Approved);
    assert_eq!(record.request.notes, "waiting");
}

#[tokio::test]
async fn clean_expired_is_admin_only() {
    let app = app();
    let mut stuck = draft(&[("app-a", "ga")], base_time() - Duration::minutes(1));
    stuck.request.status = RequestStatus::Requested;
    app.store.insert(stuck).await.unwrap();

    let user = cookie_for(&app.state, "u2");
    let resp = send(&app, post("/kube-jit-api/admin/clean-expired", Some(&user), serde_json::json!({}))).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let admin = cookie_for(&app.state, "admin");
    let resp = send(&app, post("/kube-jit-api/admin/clean-expired", Some(&admin), serde_json::json!({}))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await["deleted"], serde_json::json!([1]));
    assert!(app.store.get(1).await.unwrap().is_none());
}

#[tokio::test]
async fn logout_expires_every_chunk() {
    let app = app();
    let cookie = cookie_for(&app.state, "u1");
    let resp = send(&app, post("/kube-jit-api/logout", Some(&cookie), serde_json::json!({}))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let cleared = set_cookies(&resp);
    assert!(!cleared.is_empty());
    assert!(cleared.iter().all(|c| c.contains("Max-Age=0")));
}

#[tokio::test]
async fn roles_and_clusters_lists_configuration() {
    let app = app();
    let cookie = cookie_for(&app.state, "u1");
    let resp = send(&app, get("/kube-jit-api/roles-and-clusters", Some(&cookie))).await;
    let body = body_json(resp).await;
    assert_eq!(body["roles"], serde_json::json!(["edit"]));
    assert_eq!(body["clusters"], serde_json::json!(["c1"]));

    let resp = send(&app, get("/kube-jit-api/approving-groups", Some(&cookie))).await;
    assert_eq!(body_json(resp).await[0]["name"], "platform");
}
