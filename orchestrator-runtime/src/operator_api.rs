//! Axum-based operator API.
//!
//! Routes:
//! - `GET  /health` (no auth)
//! - `POST /auth/enroll`, `POST /auth/verify`, `POST /auth/logout`
//! - `POST /sandbox/spawn`, `POST /sandbox/kill`, `GET /sandbox/status`
//! - `GET|POST /sandbox/network`, `GET|POST /sandbox/snapshot`, `GET /snapshots`
//! - `GET  /metrics`
//!
//! Everything except `/health`, `/auth/verify` and a first-time
//! `/auth/enroll` requires a bearer session token.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRef, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::error::{AuthError, LifecycleError, OrchestratorError, PolicyError};
use crate::lifecycle::{SandboxLifecycleController, SandboxState};
use crate::metrics::metrics;
use crate::policy::NetworkPolicy;
use crate::rate_limit::{self, RateLimitConfig, RateLimiter};
use crate::session_auth::{AuthSession, AuthSessionManager, SessionAuth, extract_bearer_token};
use crate::util::now_ts;

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthSessionManager>,
    pub controller: SandboxLifecycleController,
}

impl FromRef<AppState> for Arc<AuthSessionManager> {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub request_timeout: Duration,
    pub auth_rate_limit: RateLimitConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            auth_rate_limit: RateLimitConfig::AUTH,
        }
    }
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ApiError {
    error: String,
}

fn api_error(status: StatusCode, msg: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError { error: msg.into() }))
}

/// HTTP status for each error variant.
pub fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::Auth(AuthError::InvalidCode | AuthError::Unauthenticated) => {
            StatusCode::UNAUTHORIZED
        }
        OrchestratorError::Auth(AuthError::LockedOut { .. }) => StatusCode::TOO_MANY_REQUESTS,
        OrchestratorError::Auth(AuthError::AlreadyEnrolled) => StatusCode::CONFLICT,
        OrchestratorError::Auth(AuthError::NotEnrolled) => StatusCode::PRECONDITION_FAILED,
        OrchestratorError::Lifecycle(LifecycleError::Conflict(_))
        | OrchestratorError::Lifecycle(LifecycleError::StateConflict { .. }) => StatusCode::CONFLICT,
        OrchestratorError::Lifecycle(LifecycleError::ProviderTimeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        OrchestratorError::Lifecycle(LifecycleError::ProviderFailure(_)) => StatusCode::BAD_GATEWAY,
        OrchestratorError::Policy(PolicyError::Malformed(_)) => StatusCode::BAD_REQUEST,
        OrchestratorError::Policy(PolicyError::PartialApply { .. }) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        OrchestratorError::Policy(PolicyError::EnforcementTimeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        OrchestratorError::Policy(PolicyError::Enforcement(_)) => StatusCode::BAD_GATEWAY,
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::Http(_) => StatusCode::BAD_GATEWAY,
        OrchestratorError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            error!(status = status.as_u16(), "request failed: {self}");
        } else {
            debug!(status = status.as_u16(), "request rejected: {self}");
        }

        let mut response = api_error(status, self.to_string()).into_response();
        if let OrchestratorError::Auth(AuthError::LockedOut { retry_after_secs }) = &self {
            if let Ok(value) = HeaderValue::from_str(&(*retry_after_secs).max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

type ApiResult = Result<Response, OrchestratorError>;

/// Parse a JSON request body. An empty body yields `None`.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<Option<T>, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|err| format!("invalid request body: {err}"))
}

fn require_session(auth: &AuthSessionManager, headers: &HeaderMap) -> Result<AuthSession, AuthError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer_token)
        .ok_or(AuthError::Unauthenticated)?;
    auth.validate(token)
}

// ---------------------------------------------------------------------------
// Auth endpoints
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct EnrollQuery {
    #[serde(default)]
    force: bool,
}

async fn enroll(
    State(state): State<AppState>,
    Query(query): Query<EnrollQuery>,
    headers: HeaderMap,
) -> ApiResult {
    // Resetting an existing credential requires a live session.
    if query.force {
        require_session(&state.auth, &headers)?;
    }
    let enrollment = state.auth.enroll(query.force)?;
    Ok((StatusCode::CREATED, Json(enrollment)).into_response())
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct VerifyRequest {
    code: String,
}

async fn verify(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let request: VerifyRequest = parse_body(&body)
        .map_err(OrchestratorError::Validation)?
        .ok_or_else(|| OrchestratorError::Validation("missing request body".into()))?;
    let session = state.auth.verify(&request.code, now_ts())?;
    Ok(Json(session).into_response())
}

async fn logout(State(state): State<AppState>, SessionAuth(session): SessionAuth) -> ApiResult {
    let revoked = state.auth.revoke(&session.token)?;
    Ok(Json(serde_json::json!({ "revoked": revoked })).into_response())
}

// ---------------------------------------------------------------------------
// Sandbox endpoints
// ---------------------------------------------------------------------------

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SpawnRequest {
    #[serde(default)]
    snapshot_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpawnResponse {
    id: String,
    state: SandboxState,
    snapshot_id: String,
}

async fn spawn_sandbox(State(state): State<AppState>, _auth: SessionAuth, body: Bytes) -> ApiResult {
    let request: SpawnRequest = parse_body(&body)
        .map_err(OrchestratorError::Validation)?
        .unwrap_or_default();
    let sandbox = state.controller.spawn(request.snapshot_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SpawnResponse {
            id: sandbox.id,
            state: sandbox.state,
            snapshot_id: sandbox.snapshot_id,
        }),
    )
        .into_response())
}

async fn kill_sandbox(State(state): State<AppState>, _auth: SessionAuth) -> ApiResult {
    let status = state.controller.kill()?;
    Ok(Json(status).into_response())
}

async fn sandbox_status(State(state): State<AppState>, _auth: SessionAuth) -> impl IntoResponse {
    Json(state.controller.status())
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NetworkRequest {
    policies: Vec<NetworkPolicy>,
}

async fn configure_network(State(state): State<AppState>, _auth: SessionAuth, body: Bytes) -> ApiResult {
    let request: NetworkRequest = parse_body(&body)
        .map_err(PolicyError::Malformed)?
        .ok_or_else(|| PolicyError::Malformed("missing request body".into()))?;
    let applied = state.controller.configure_network(request.policies).await?;
    Ok(Json(serde_json::json!({ "applied": applied })).into_response())
}

async fn get_network(State(state): State<AppState>, _auth: SessionAuth) -> ApiResult {
    Ok(Json(state.controller.network()?).into_response())
}

/// Accepted immediately; poll `GET /sandbox/snapshot` for completion.
async fn create_snapshot(State(state): State<AppState>, _auth: SessionAuth) -> ApiResult {
    let job = state.controller.snapshot()?;
    Ok((StatusCode::ACCEPTED, Json(job)).into_response())
}

async fn snapshot_job(State(state): State<AppState>, _auth: SessionAuth) -> ApiResult {
    Ok(Json(serde_json::json!({ "job": state.controller.snapshot_job() })).into_response())
}

async fn list_snapshots(State(state): State<AppState>, _auth: SessionAuth) -> ApiResult {
    let snapshots = state.controller.snapshots()?;
    Ok(Json(serde_json::json!({ "snapshots": snapshots })).into_response())
}

async fn get_metrics(_auth: SessionAuth) -> impl IntoResponse {
    let counters: serde_json::Map<String, serde_json::Value> = metrics()
        .snapshot()
        .into_iter()
        .map(|(name, value)| (name, value.into()))
        .collect();
    Json(serde_json::json!({ "counters": counters }))
}

// ---------------------------------------------------------------------------
// Router builder
// ---------------------------------------------------------------------------

/// Build the operator API router.
pub fn operator_api_router(state: AppState, config: ApiConfig) -> Router {
    let limiter = Arc::new(RateLimiter::new(config.auth_rate_limit));
    let auth_routes = Router::new()
        .route("/auth/enroll", post(enroll))
        .route("/auth/verify", post(verify))
        .route("/auth/logout", post(logout))
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit::rate_limit));

    Router::new()
        .route("/health", get(health))
        .merge(auth_routes)
        .route("/sandbox/spawn", post(spawn_sandbox))
        .route("/sandbox/kill", post(kill_sandbox))
        .route("/sandbox/status", get(sandbox_status))
        .route("/sandbox/network", get(get_network).post(configure_network))
        .route("/sandbox/snapshot", get(snapshot_job).post(create_snapshot))
        .route("/snapshots", get(list_snapshots))
        .route("/metrics", get(get_metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(config.request_timeout)),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, LifecycleConfig, PolicyConfig};
    use crate::enforcer::mock::MockPolicyEnforcer;
    use crate::policy::NetworkPolicyEngine;
    use crate::provider::mock::MockCloudProvider;
    use crate::retry::RetryPolicy;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    struct TestApp {
        _dir: tempfile::TempDir,
        router: Router,
        state: AppState,
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            timeout: Duration::from_secs(2),
        }
    }

    fn test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let auth = Arc::new(AuthSessionManager::open(dir.path(), AuthConfig::default()).unwrap());
        let engine = Arc::new(NetworkPolicyEngine::new(
            Arc::new(MockPolicyEnforcer::new()),
            PolicyConfig::default(),
        ));
        let controller = SandboxLifecycleController::open(
            dir.path(),
            LifecycleConfig {
                provider_retry: fast(),
                status_poll: fast(),
                snapshot_poll: fast(),
                policy_max_attempts: 1,
                default_snapshot_id: Some("snap-default".into()),
            },
            Arc::new(MockCloudProvider::new()),
            engine,
        )
        .unwrap();
        let state = AppState { auth, controller };
        TestApp {
            _dir: dir,
            router: operator_api_router(state.clone(), ApiConfig::default()),
            state,
        }
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &TestApp, req: Request<Body>) -> (StatusCode, HeaderMap, serde_json::Value) {
        let response = app.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, json)
    }

    /// Enroll and log in, returning a session token.
    async fn login(app: &TestApp) -> String {
        let (status, _, _) = send(app, request("POST", "/auth/enroll", None, None)).await;
        assert_eq!(status, StatusCode::CREATED);
        let code = app.state.auth.current_code(now_ts()).unwrap();
        let (status, _, json) = send(
            app,
            request("POST", "/auth/verify", None, Some(serde_json::json!({ "code": code }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        json["token"].as_str().unwrap().to_string()
    }

    fn wrong_code(app: &TestApp) -> String {
        let now = now_ts();
        let good: Vec<String> = [now - 30, now, now + 30, now + 60]
            .iter()
            .filter_map(|t| app.state.auth.current_code(*t))
            .collect();
        (0..1_000_000u32)
            .map(|n| format!("{n:06}"))
            .find(|c| !good.contains(c))
            .unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let app = test_app();
        let (status, _, json) = send(&app, request("GET", "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn sandbox_routes_require_session() {
        let app = test_app();
        for (method, uri) in [
            ("POST", "/sandbox/spawn"),
            ("POST", "/sandbox/kill"),
            ("GET", "/sandbox/status"),
            ("GET", "/sandbox/network"),
            ("POST", "/sandbox/snapshot"),
            ("GET", "/sandbox/snapshot"),
            ("GET", "/snapshots"),
            ("GET", "/metrics"),
        ] {
            let (status, _, json) = send(&app, request(method, uri, None, None)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{method} {uri}");
            assert!(json["error"].is_string());
        }
        let (status, _, _) = send(&app, request("GET", "/sandbox/status", Some("bogus"), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn enroll_verify_and_read_status() {
        let app = test_app();
        let token = login(&app).await;
        let (status, _, json) = send(&app, request("GET", "/sandbox/status", Some(&token), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "Absent");
        assert!(json["sandbox"].is_null());
    }

    #[tokio::test]
    async fn verify_before_enroll_is_precondition_failed() {
        let app = test_app();
        let (status, _, _) = send(
            &app,
            request("POST", "/auth/verify", None, Some(serde_json::json!({ "code": "123456" }))),
        )
        .await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn second_enroll_conflicts_and_force_needs_session() {
        let app = test_app();
        let token = login(&app).await;

        let (status, _, _) = send(&app, request("POST", "/auth/enroll", None, None)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _, _) = send(&app, request("POST", "/auth/enroll?force=true", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, json) =
            send(&app, request("POST", "/auth/enroll?force=true", Some(&token), None)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(json["enrollmentUri"].as_str().unwrap().starts_with("otpauth://totp/"));

        // The reset revoked the old session.
        let (status, _, _) = send(&app, request("GET", "/sandbox/status", Some(&token), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn repeated_bad_codes_lock_out_with_retry_after() {
        let app = test_app();
        send(&app, request("POST", "/auth/enroll", None, None)).await;
        let bad = wrong_code(&app);

        for _ in 0..AuthConfig::default().lockout_threshold {
            let (status, _, _) = send(
                &app,
                request("POST", "/auth/verify", None, Some(serde_json::json!({ "code": bad }))),
            )
            .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }
        let (status, headers, json) = send(
            &app,
            request("POST", "/auth/verify", None, Some(serde_json::json!({ "code": bad }))),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(headers.contains_key("retry-after"));
        assert!(json["error"].as_str().unwrap().contains("locked out"));
    }

    #[tokio::test]
    async fn logout_revokes_session() {
        let app = test_app();
        let token = login(&app).await;
        let (status, _, json) = send(&app, request("POST", "/auth/logout", Some(&token), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["revoked"], true);
        let (status, _, _) = send(&app, request("GET", "/sandbox/status", Some(&token), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn spawn_then_conflict() {
        let app = test_app();
        let token = login(&app).await;

        let (status, _, json) = send(
            &app,
            request(
                "POST",
                "/sandbox/spawn",
                Some(&token),
                Some(serde_json::json!({ "snapshotId": "snap-1" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["state"], "Provisioning");
        assert_eq!(json["snapshotId"], "snap-1");
        assert!(json["id"].as_str().unwrap().starts_with("sandbox-"));

        let (status, _, _) = send(&app, request("POST", "/sandbox/spawn", Some(&token), None)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn spawn_rejects_unknown_fields() {
        let app = test_app();
        let token = login(&app).await;
        let (status, _, _) = send(
            &app,
            request(
                "POST",
                "/sandbox/spawn",
                Some(&token),
                Some(serde_json::json!({ "image": "ubuntu" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn network_requires_running_sandbox() {
        let app = test_app();
        let token = login(&app).await;
        let (status, _, json) = send(
            &app,
            request(
                "POST",
                "/sandbox/network",
                Some(&token),
                Some(serde_json::json!({ "policies": [] })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("configure network"));

        let (status, _, _) = send(
            &app,
            request(
                "POST",
                "/sandbox/network",
                Some(&token),
                Some(serde_json::json!({ "policies": [{ "containerId": "container-1", "dns": true }] })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn snapshot_needs_running_sandbox_and_reports_no_job() {
        let app = test_app();
        let token = login(&app).await;
        let (status, _, json) = send(&app, request("POST", "/sandbox/snapshot", Some(&token), None)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("snapshot"));

        let (status, _, json) = send(&app, request("GET", "/sandbox/snapshot", Some(&token), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["job"].is_null());
    }

    #[tokio::test]
    async fn metrics_lists_counters() {
        let app = test_app();
        let token = login(&app).await;
        let (status, _, json) = send(&app, request("GET", "/metrics", Some(&token), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["counters"]["spawns"].is_u64());
    }

    #[test]
    fn error_statuses() {
        let cases = [
            (OrchestratorError::from(AuthError::InvalidCode), StatusCode::UNAUTHORIZED),
            (
                OrchestratorError::from(LifecycleError::ProviderTimeout("x".into())),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                OrchestratorError::from(LifecycleError::ProviderFailure("x".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (
                OrchestratorError::from(PolicyError::PartialApply {
                    reason: "x".into(),
                    rolled_back: true,
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                OrchestratorError::from(PolicyError::EnforcementTimeout("x".into())),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (OrchestratorError::Storage("disk".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(status_for(&err), expected, "{err}");
        }
    }
}
