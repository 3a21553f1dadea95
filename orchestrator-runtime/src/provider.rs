//! `CloudProviderClient` capability and its DigitalOcean implementation.
//!
//! Every instance this control plane creates is named after its sandbox id
//! and tagged with [`SANDBOX_TAG`], so a create whose response was lost can be
//! adopted by name and strays can be found by tag.

use reqwest::{Method, StatusCode, Url};
use serde_json::{Value, json};

use tracing::debug;

use crate::config::{DigitalOceanConfig, SANDBOX_TAG};
use crate::error::ProviderError;
use crate::http::{HttpError, auth_headers, build_url, request_json};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateInstanceRequest {
    /// Instance name; always the sandbox id.
    pub name: String,
    pub snapshot_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstanceStatus {
    Pending,
    Active { private_ip: Option<String> },
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceSummary {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotProgress {
    Pending,
    Completed { image_id: String },
    Failed { reason: String },
}

#[async_trait::async_trait]
pub trait CloudProviderClient: Send + Sync {
    /// Start creating an instance from a snapshot; returns the provider id.
    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<String, ProviderError>;

    /// Destroy an instance. An already-absent instance is not an error.
    async fn destroy_instance(&self, instance_id: &str) -> Result<(), ProviderError>;

    async fn poll_status(&self, instance_id: &str) -> Result<InstanceStatus, ProviderError>;

    /// Instances carrying the sandbox tag.
    async fn list_instances(&self) -> Result<Vec<InstanceSummary>, ProviderError>;

    /// Start a snapshot of an instance and return the provider action id.
    /// Every call starts a new, billable snapshot.
    async fn start_snapshot(&self, instance_id: &str, name: &str) -> Result<String, ProviderError>;

    /// Progress of an action returned by `start_snapshot`.
    async fn snapshot_progress(
        &self,
        instance_id: &str,
        action_id: &str,
        name: &str,
    ) -> Result<SnapshotProgress, ProviderError>;
}

// ---------------------------------------------------------------------------
// DigitalOcean
// ---------------------------------------------------------------------------

pub struct DigitalOceanClient {
    config: DigitalOceanConfig,
}

fn map_http(err: HttpError) -> ProviderError {
    match err {
        HttpError::Timeout(msg) => ProviderError::Timeout(msg),
        HttpError::Status { status, body } if status == StatusCode::NOT_FOUND => {
            ProviderError::NotFound(body)
        }
        other => ProviderError::Api(other.to_string()),
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Parse a droplet object from the DigitalOcean API.
fn parse_droplet(droplet: &Value) -> Option<InstanceSummary> {
    let id = id_string(&droplet["id"])?;
    let name = droplet["name"].as_str().unwrap_or_default().to_string();
    let status = match droplet["status"].as_str().unwrap_or("new") {
        "active" => {
            let private_ip = droplet["networks"]["v4"]
                .as_array()
                .into_iter()
                .flatten()
                .find(|n| n["type"].as_str() == Some("private"))
                .and_then(|n| n["ip_address"].as_str())
                .map(str::to_string);
            InstanceStatus::Active { private_ip }
        }
        "off" | "archive" => InstanceStatus::Failed {
            reason: format!("droplet status is {}", droplet["status"].as_str().unwrap_or("unknown")),
        },
        _ => InstanceStatus::Pending,
    };
    Some(InstanceSummary { id, name, status })
}

impl DigitalOceanClient {
    pub fn new(config: DigitalOceanConfig) -> Self {
        Self { config }
    }

    fn url(&self, path: &str) -> Result<Url, ProviderError> {
        build_url(&self.config.api_url, path).map_err(map_http)
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, ProviderError> {
        let url = self.url(path)?;
        let headers = auth_headers(&self.config.api_token).map_err(map_http)?;
        request_json(method, url, body, headers, self.config.timeout)
            .await
            .map_err(map_http)
    }
}

#[async_trait::async_trait]
impl CloudProviderClient for DigitalOceanClient {
    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<String, ProviderError> {
        // Snapshot ids are numeric; keep slugs as strings.
        let image = request
            .snapshot_id
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(request.snapshot_id.clone()));
        let mut payload = json!({
            "name": request.name,
            "region": self.config.region,
            "size": self.config.size,
            "image": image,
            "tags": [SANDBOX_TAG],
            "monitoring": true,
        });
        if !self.config.vpc_uuid.is_empty() {
            payload["vpc_uuid"] = Value::from(self.config.vpc_uuid.clone());
        }

        let data = self.request(Method::POST, "droplets", Some(payload)).await?;
        id_string(&data["droplet"]["id"])
            .ok_or_else(|| ProviderError::Api("create response did not include a droplet id".into()))
    }

    async fn destroy_instance(&self, instance_id: &str) -> Result<(), ProviderError> {
        match self
            .request(Method::DELETE, &format!("droplets/{instance_id}"), None)
            .await
        {
            Ok(_) | Err(ProviderError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn poll_status(&self, instance_id: &str) -> Result<InstanceStatus, ProviderError> {
        let data = self
            .request(Method::GET, &format!("droplets/{instance_id}"), None)
            .await?;
        parse_droplet(&data["droplet"])
            .map(|d| d.status)
            .ok_or_else(|| ProviderError::Api(format!("malformed droplet {instance_id}")))
    }

    async fn list_instances(&self) -> Result<Vec<InstanceSummary>, ProviderError> {
        let data = self
            .request(
                Method::GET,
                &format!("droplets?tag_name={SANDBOX_TAG}&per_page=200"),
                None,
            )
            .await?;
        Ok(data["droplets"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(parse_droplet)
            .collect())
    }

    async fn start_snapshot(&self, instance_id: &str, name: &str) -> Result<String, ProviderError> {
        let data = self
            .request(
                Method::POST,
                &format!("droplets/{instance_id}/actions"),
                Some(json!({ "type": "snapshot", "name": name })),
            )
            .await?;
        id_string(&data["action"]["id"])
            .ok_or_else(|| ProviderError::Api("snapshot action has no id".into()))
    }

    async fn snapshot_progress(
        &self,
        instance_id: &str,
        action_id: &str,
        name: &str,
    ) -> Result<SnapshotProgress, ProviderError> {
        let data = self
            .request(Method::GET, &format!("actions/{action_id}"), None)
            .await?;
        match data["action"]["status"].as_str() {
            Some("completed") => {}
            Some("errored") => {
                return Ok(SnapshotProgress::Failed {
                    reason: format!("action {action_id} errored"),
                });
            }
            status => {
                debug!(action_id, ?status, "snapshot action in progress");
                return Ok(SnapshotProgress::Pending);
            }
        }

        let data = self
            .request(Method::GET, &format!("droplets/{instance_id}/snapshots"), None)
            .await?;
        let image_id = data["snapshots"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|s| s["name"].as_str() == Some(name))
            .filter_map(|s| id_string(&s["id"]))
            .last();
        // The image can lag the completed action by a few seconds.
        Ok(match image_id {
            Some(image_id) => SnapshotProgress::Completed { image_id },
            None => SnapshotProgress::Pending,
        })
    }
}

/// Mock provider for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    struct MockInstance {
        name: String,
        polls: u32,
    }

    /// In-memory provider. The n-th status poll of an instance (counting
    /// from 1) reports it active, where n is `polls_until_active`.
    pub struct MockCloudProvider {
        pub create_calls: AtomicUsize,
        pub destroy_calls: AtomicUsize,
        pub poll_calls: AtomicUsize,
        pub list_calls: AtomicUsize,
        pub snapshot_calls: AtomicUsize,
        polls_until_active: AtomicU32,
        next_id: AtomicUsize,
        instances: Mutex<BTreeMap<String, MockInstance>>,
        destroyed: Mutex<Vec<String>>,
        create_gate: Mutex<Option<Arc<Notify>>>,
        create_failures: AtomicU32,
        destroy_failures: AtomicU32,
        report_failed: AtomicBool,
        list_gate: Mutex<Option<Arc<Notify>>>,
        snapshot_start_failures: AtomicU32,
        snapshot_polls_until_done: AtomicU32,
        snapshot_actions: Mutex<BTreeMap<String, MockSnapshotAction>>,
    }

    struct MockSnapshotAction {
        image_id: String,
        polls: u32,
    }

    impl Default for MockCloudProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockCloudProvider {
        pub fn new() -> Self {
            Self {
                create_calls: AtomicUsize::new(0),
                destroy_calls: AtomicUsize::new(0),
                poll_calls: AtomicUsize::new(0),
                list_calls: AtomicUsize::new(0),
                snapshot_calls: AtomicUsize::new(0),
                polls_until_active: AtomicU32::new(1),
                next_id: AtomicUsize::new(1),
                instances: Mutex::new(BTreeMap::new()),
                destroyed: Mutex::new(Vec::new()),
                create_gate: Mutex::new(None),
                create_failures: AtomicU32::new(0),
                destroy_failures: AtomicU32::new(0),
                report_failed: AtomicBool::new(false),
                list_gate: Mutex::new(None),
                snapshot_start_failures: AtomicU32::new(0),
                snapshot_polls_until_done: AtomicU32::new(1),
                snapshot_actions: Mutex::new(BTreeMap::new()),
            }
        }

        pub fn set_polls_until_active(&self, polls: u32) {
            self.polls_until_active.store(polls, Ordering::SeqCst);
        }

        /// Make the next `n` create calls fail.
        pub fn fail_creates(&self, n: u32) {
            self.create_failures.store(n, Ordering::SeqCst);
        }

        /// Make the next `n` destroy calls fail.
        pub fn fail_destroys(&self, n: u32) {
            self.destroy_failures.store(n, Ordering::SeqCst);
        }

        /// Status polls report the instance as failed.
        pub fn report_failed(&self, failed: bool) {
            self.report_failed.store(failed, Ordering::SeqCst);
        }

        /// Block create calls until the returned `Notify` is notified.
        pub fn hold_creates(&self) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            *self.create_gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(gate.clone());
            gate
        }

        /// Block list calls until the returned `Notify` is notified.
        pub fn hold_lists(&self) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            *self.list_gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(gate.clone());
            gate
        }

        /// Make the next `n` snapshot starts fail.
        pub fn fail_snapshot_starts(&self, n: u32) {
            self.snapshot_start_failures.store(n, Ordering::SeqCst);
        }

        /// The n-th progress poll of a snapshot action reports it completed.
        pub fn set_snapshot_polls_until_done(&self, polls: u32) {
            self.snapshot_polls_until_done.store(polls, Ordering::SeqCst);
        }

        /// Register an instance that exists at the provider without a create call.
        pub fn insert_instance(&self, id: &str, name: &str) {
            self.instances
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(
                    id.to_string(),
                    MockInstance {
                        name: name.to_string(),
                        polls: 0,
                    },
                );
        }

        pub fn destroyed_ids(&self) -> Vec<String> {
            self.destroyed.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        pub fn live_ids(&self) -> Vec<String> {
            self.instances
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .keys()
                .cloned()
                .collect()
        }

        fn take_failure(counter: &AtomicU32) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait::async_trait]
    impl CloudProviderClient for MockCloudProvider {
        async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<String, ProviderError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            let gate = self
                .create_gate
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if Self::take_failure(&self.create_failures) {
                return Err(ProviderError::Api("HTTP 503: mock create failure".into()));
            }
            let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.insert_instance(&id, &request.name);
            Ok(id)
        }

        async fn destroy_instance(&self, instance_id: &str) -> Result<(), ProviderError> {
            self.destroy_calls.fetch_add(1, Ordering::SeqCst);
            if Self::take_failure(&self.destroy_failures) {
                return Err(ProviderError::Api("HTTP 500: mock destroy failure".into()));
            }
            self.instances
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(instance_id);
            self.destroyed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(instance_id.to_string());
            Ok(())
        }

        async fn poll_status(&self, instance_id: &str) -> Result<InstanceStatus, ProviderError> {
            self.poll_calls.fetch_add(1, Ordering::SeqCst);
            let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
            let instance = instances
                .get_mut(instance_id)
                .ok_or_else(|| ProviderError::NotFound(format!("instance {instance_id}")))?;
            if self.report_failed.load(Ordering::SeqCst) {
                return Ok(InstanceStatus::Failed {
                    reason: "mock instance failed".into(),
                });
            }
            instance.polls += 1;
            if instance.polls >= self.polls_until_active.load(Ordering::SeqCst) {
                Ok(InstanceStatus::Active {
                    private_ip: Some("10.10.0.2".into()),
                })
            } else {
                Ok(InstanceStatus::Pending)
            }
        }

        async fn list_instances(&self) -> Result<Vec<InstanceSummary>, ProviderError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.list_gate.lock().unwrap_or_else(|e| e.into_inner()).clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            Ok(self
                .instances
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|(id, i)| InstanceSummary {
                    id: id.clone(),
                    name: i.name.clone(),
                    status: InstanceStatus::Pending,
                })
                .collect())
        }

        async fn start_snapshot(&self, instance_id: &str, name: &str) -> Result<String, ProviderError> {
            let n = self.snapshot_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if Self::take_failure(&self.snapshot_start_failures) {
                return Err(ProviderError::Timeout("mock snapshot start timed out".into()));
            }
            if !self
                .instances
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(instance_id)
            {
                return Err(ProviderError::NotFound(format!("instance {instance_id}")));
            }
            let action_id = format!("action-{n}");
            self.snapshot_actions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(
                    action_id.clone(),
                    MockSnapshotAction {
                        image_id: format!("image-{n}-{name}"),
                        polls: 0,
                    },
                );
            Ok(action_id)
        }

        async fn snapshot_progress(
            &self,
            _instance_id: &str,
            action_id: &str,
            _name: &str,
        ) -> Result<SnapshotProgress, ProviderError> {
            let mut actions = self.snapshot_actions.lock().unwrap_or_else(|e| e.into_inner());
            let action = actions
                .get_mut(action_id)
                .ok_or_else(|| ProviderError::NotFound(format!("action {action_id}")))?;
            action.polls += 1;
            if action.polls >= self.snapshot_polls_until_done.load(Ordering::SeqCst) {
                Ok(SnapshotProgress::Completed {
                    image_id: action.image_id.clone(),
                })
            } else {
                Ok(SnapshotProgress::Pending)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> DigitalOceanClient {
        DigitalOceanClient::new(DigitalOceanConfig {
            api_url: format!("{}/v2/", server.uri()),
            api_token: "do-token".into(),
            vpc_uuid: "vpc-1".into(),
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn create_posts_tagged_droplet_from_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/droplets"))
            .and(header("authorization", "Bearer do-token"))
            .and(body_partial_json(json!({
                "name": "sandbox-abc",
                "image": 12345,
                "region": "nyc1",
                "size": "s-2vcpu-2gb",
                "vpc_uuid": "vpc-1",
                "tags": [SANDBOX_TAG],
            })))
            .respond_with(
                ResponseTemplate::new(202).set_body_json(json!({ "droplet": { "id": 3164494 } })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let id = client(&server)
            .create_instance(&CreateInstanceRequest {
                name: "sandbox-abc".into(),
                snapshot_id: "12345".into(),
            })
            .await
            .unwrap();
        assert_eq!(id, "3164494");
    }

    #[tokio::test]
    async fn status_maps_droplet_states() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/droplets/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "droplet": { "id": 1, "name": "sandbox-a", "status": "new" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/droplets/2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "droplet": {
                    "id": 2,
                    "name": "sandbox-b",
                    "status": "active",
                    "networks": { "v4": [
                        { "ip_address": "203.0.113.7", "type": "public" },
                        { "ip_address": "10.116.0.4", "type": "private" }
                    ]}
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/droplets/3"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not_found"))
            .mount(&server)
            .await;

        let client = client(&server);
        assert_eq!(client.poll_status("1").await.unwrap(), InstanceStatus::Pending);
        assert_eq!(
            client.poll_status("2").await.unwrap(),
            InstanceStatus::Active {
                private_ip: Some("10.116.0.4".into())
            }
        );
        assert!(matches!(
            client.poll_status("3").await,
            Err(ProviderError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_treats_404_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v2/droplets/9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v2/droplets/10"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = client(&server);
        assert!(client.destroy_instance("9").await.is_ok());
        assert!(matches!(
            client.destroy_instance("10").await,
            Err(ProviderError::Api(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_by_tag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/droplets"))
            .and(query_param("tag_name", SANDBOX_TAG))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "droplets": [
                    { "id": 1, "name": "sandbox-a", "status": "active" },
                    { "id": 2, "name": "sandbox-b", "status": "off" }
                ]
            })))
            .mount(&server)
            .await;

        let instances = client(&server).list_instances().await.unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].name, "sandbox-a");
        assert!(matches!(instances[1].status, InstanceStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn snapshot_start_posts_one_action() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/droplets/7/actions"))
            .and(body_partial_json(json!({ "type": "snapshot", "name": "snap-v1" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "action": { "id": 555, "status": "in-progress" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let action = client(&server).start_snapshot("7", "snap-v1").await.unwrap();
        assert_eq!(action, "555");
    }

    #[tokio::test]
    async fn snapshot_progress_resolves_image_after_completion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/actions/555"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "action": { "id": 555, "status": "completed" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/actions/556"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "action": { "id": 556, "status": "in-progress" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/actions/557"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "action": { "id": 557, "status": "errored" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/droplets/7/snapshots"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "snapshots": [
                    { "id": "111", "name": "older" },
                    { "id": "222", "name": "snap-v1" }
                ]
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        assert_eq!(
            client.snapshot_progress("7", "555", "snap-v1").await.unwrap(),
            SnapshotProgress::Completed {
                image_id: "222".into()
            }
        );
        // Completed action whose image is not listed yet.
        assert_eq!(
            client.snapshot_progress("7", "555", "snap-v2").await.unwrap(),
            SnapshotProgress::Pending
        );
        assert_eq!(
            client.snapshot_progress("7", "556", "snap-v1").await.unwrap(),
            SnapshotProgress::Pending
        );
        assert!(matches!(
            client.snapshot_progress("7", "557", "snap-v1").await.unwrap(),
            SnapshotProgress::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn mock_reports_active_on_configured_poll() {
        let provider = mock::MockCloudProvider::new();
        provider.set_polls_until_active(2);
        let id = provider
            .create_instance(&CreateInstanceRequest {
                name: "sandbox-x".into(),
                snapshot_id: "snap-1".into(),
            })
            .await
            .unwrap();
        assert_eq!(provider.poll_status(&id).await.unwrap(), InstanceStatus::Pending);
        assert!(matches!(
            provider.poll_status(&id).await.unwrap(),
            InstanceStatus::Active { .. }
        ));
    }
}
