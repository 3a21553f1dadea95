//! End-to-end operator API flow against in-process provider and enforcer mocks.
//!
//! Boots the real router on an ephemeral port and drives it over HTTP:
//! enroll, verify, spawn, wait for Running, configure network, snapshot, kill.
//!
//! Run:
//!   cargo test -p orchestrator-runtime --test control_plane_flow

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{Value, json};

use orchestrator_runtime::config::{AuthConfig, LifecycleConfig, PolicyConfig};
use orchestrator_runtime::enforcer::mock::MockPolicyEnforcer;
use orchestrator_runtime::lifecycle::SandboxLifecycleController;
use orchestrator_runtime::operator_api::{ApiConfig, AppState, operator_api_router};
use orchestrator_runtime::policy::{NetworkPolicyEngine, Rule};
use orchestrator_runtime::provider::mock::MockCloudProvider;
use orchestrator_runtime::retry::RetryPolicy;
use orchestrator_runtime::session_auth::AuthSessionManager;
use orchestrator_runtime::util::now_ts;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestServer {
    url: String,
    client: Client,
    auth: Arc<AuthSessionManager>,
    provider: Arc<MockCloudProvider>,
    enforcer: Arc<MockPolicyEnforcer>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let fast = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            timeout: Duration::from_secs(2),
        };

        let auth = Arc::new(AuthSessionManager::open(dir.path(), AuthConfig::default()).unwrap());
        let provider = Arc::new(MockCloudProvider::new());
        provider.set_polls_until_active(2);
        let enforcer = Arc::new(MockPolicyEnforcer::new());
        let engine = Arc::new(NetworkPolicyEngine::new(enforcer.clone(), PolicyConfig::default()));
        let controller = SandboxLifecycleController::open(
            dir.path(),
            LifecycleConfig {
                provider_retry: fast.clone(),
                status_poll: RetryPolicy {
                    max_attempts: 20,
                    ..fast.clone()
                },
                snapshot_poll: RetryPolicy {
                    max_attempts: 20,
                    ..fast
                },
                policy_max_attempts: 2,
                default_snapshot_id: None,
            },
            provider.clone(),
            engine,
        )
        .unwrap();

        let router = operator_api_router(
            AppState {
                auth: auth.clone(),
                controller,
            },
            ApiConfig::default(),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            url: format!("http://{addr}"),
            client: Client::new(),
            auth,
            provider,
            enforcer,
            _dir: dir,
        }
    }

    async fn call(&self, method: reqwest::Method, path: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = self.client.request(method, format!("{}{path}", self.url));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.unwrap();
        let status = response.status();
        let text = response.text().await.unwrap();
        let json = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap()
        };
        (status, json)
    }

    async fn wait_for_state(&self, token: &str, state: &str) -> Value {
        for _ in 0..200 {
            let (status, json) = self
                .call(reqwest::Method::GET, "/sandbox/status", Some(token), None)
                .await;
            assert_eq!(status, StatusCode::OK);
            if json["state"] == state {
                return json;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sandbox never reached {state}");
    }

    async fn wait_for_snapshot(&self, token: &str) -> Value {
        for _ in 0..200 {
            let (status, json) = self
                .call(reqwest::Method::GET, "/sandbox/snapshot", Some(token), None)
                .await;
            assert_eq!(status, StatusCode::OK);
            if matches!(json["job"]["state"].as_str(), Some("Completed") | Some("Failed")) {
                return json["job"].clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("snapshot never finished");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_control_plane_flow() {
    let server = TestServer::start().await;

    // Enroll the authenticator and log in with the current code.
    let (status, enrollment) = server
        .call(reqwest::Method::POST, "/auth/enroll", None, None)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(enrollment["secret"].as_str().is_some_and(|s| !s.is_empty()));

    let code = server.auth.current_code(now_ts()).unwrap();
    let (status, session) = server
        .call(reqwest::Method::POST, "/auth/verify", None, Some(json!({ "code": code })))
        .await;
    assert_eq!(status, StatusCode::OK);
    let token = session["token"].as_str().unwrap().to_string();
    assert!(session["expiresAt"].as_u64().unwrap() > now_ts());

    // Unauthenticated mutations are rejected before reaching the controller.
    let (status, _) = server
        .call(reqwest::Method::POST, "/sandbox/spawn", None, Some(json!({ "snapshotId": "snap-1" })))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(server.provider.create_calls.load(Ordering::SeqCst), 0);

    // Spawn and wait for readiness.
    let (status, spawned) = server
        .call(
            reqwest::Method::POST,
            "/sandbox/spawn",
            Some(&token),
            Some(json!({ "snapshotId": "snap-1" })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(spawned["state"], "Provisioning");

    let running = server.wait_for_state(&token, "Running").await;
    let sandbox = &running["sandbox"];
    assert_eq!(sandbox["id"], spawned["id"]);
    assert_eq!(sandbox["snapshotId"], "snap-1");
    assert_eq!(sandbox["appliedPolicy"].as_array().unwrap().len(), 4);
    assert!(server.enforcer.installed("container-3").contains(&Rule::DefaultDeny));

    // Open egress for one container; the others keep their rules untouched.
    let (status, applied) = server
        .call(
            reqwest::Method::POST,
            "/sandbox/network",
            Some(&token),
            Some(json!({
                "policies": [{
                    "containerId": "container-2",
                    "egressAllowlist": ["api.github.com", "*.pypi.org"],
                    "openPorts": [{ "port": 8080, "direction": "ingress" }]
                }]
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{applied}");
    assert_eq!(applied["applied"].as_array().unwrap().len(), 4);
    let touched: Vec<String> = server
        .enforcer
        .calls()
        .into_iter()
        .skip(8)
        .map(|c| c.container_id)
        .collect();
    assert!(touched.iter().all(|c| c == "container-2"), "{touched:?}");

    let (status, view) = server
        .call(reqwest::Method::GET, "/sandbox/network", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["desired"], view["applied"]);

    // Snapshot, then tear down.
    let (status, snapshot) = server
        .call(reqwest::Method::POST, "/sandbox/snapshot", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(snapshot["version"], 1);
    let job = server.wait_for_snapshot(&token).await;
    assert_eq!(job["state"], "Completed");
    assert_eq!(server.provider.snapshot_calls.load(Ordering::SeqCst), 1);

    let (status, killed) = server
        .call(reqwest::Method::POST, "/sandbox/kill", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(matches!(killed["state"].as_str(), Some("Destroying") | Some("Absent")));

    server.wait_for_state(&token, "Absent").await;
    assert_eq!(server.provider.destroyed_ids(), vec!["mock-1"]);

    // A second kill is a no-op.
    let (status, killed) = server
        .call(reqwest::Method::POST, "/sandbox/kill", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(killed["state"], "Absent");
    assert_eq!(server.provider.destroy_calls.load(Ordering::SeqCst), 1);

    let (status, catalog) = server
        .call(reqwest::Method::GET, "/snapshots", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(catalog["snapshots"].as_array().unwrap().len(), 1);

    let (status, metrics) = server
        .call(reqwest::Method::GET, "/metrics", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(metrics["counters"]["spawns"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn spawn_without_snapshot_is_bad_request() {
    let server = TestServer::start().await;
    server
        .call(reqwest::Method::POST, "/auth/enroll", None, None)
        .await;
    let code = server.auth.current_code(now_ts()).unwrap();
    let (_, session) = server
        .call(reqwest::Method::POST, "/auth/verify", None, Some(json!({ "code": code })))
        .await;
    let token = session["token"].as_str().unwrap();

    let (status, body) = server
        .call(reqwest::Method::POST, "/sandbox/spawn", Some(token), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("snapshot"));
}
