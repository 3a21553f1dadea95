//! `PolicyEnforcer` capability: installs compiled rules on a live instance.
//!
//! The production implementation talks to the network agent baked into the
//! sandbox snapshot over the VPC. Tests use [`mock::MockPolicyEnforcer`].

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::AgentConfig;
use crate::error::PolicyError;
use crate::http::{HttpError, auth_headers, build_url, send_json};
use crate::policy::Rule;

/// Identifies the instance a plan is enforced on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnforcementTarget {
    pub sandbox_id: String,
    /// VPC-internal address of the instance, once the provider reported it.
    pub address: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementAction {
    Install,
    Remove,
}

impl EnforcementAction {
    pub fn inverse(self) -> Self {
        match self {
            EnforcementAction::Install => EnforcementAction::Remove,
            EnforcementAction::Remove => EnforcementAction::Install,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EnforcementAction::Install => "install",
            EnforcementAction::Remove => "remove",
        }
    }
}

#[async_trait::async_trait]
pub trait PolicyEnforcer: Send + Sync {
    /// Add `rules` to `container_id`'s rule set. Installing a rule that is
    /// already present is a no-op.
    async fn install(
        &self,
        target: &EnforcementTarget,
        container_id: &str,
        rules: &[Rule],
    ) -> Result<(), PolicyError>;

    /// Remove `rules` from `container_id`'s rule set. Removing an absent rule
    /// is a no-op.
    async fn remove(
        &self,
        target: &EnforcementTarget,
        container_id: &str,
        rules: &[Rule],
    ) -> Result<(), PolicyError>;
}

/// Enforcer backed by the in-sandbox network agent
/// (`POST http://{address}:{port}/network/{install,remove}`).
pub struct AgentPolicyEnforcer {
    config: AgentConfig,
}

impl AgentPolicyEnforcer {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    fn base_url(&self, target: &EnforcementTarget) -> Result<String, PolicyError> {
        let address = target.address.as_deref().ok_or_else(|| {
            PolicyError::Enforcement(format!(
                "sandbox {} has no private address yet",
                target.sandbox_id
            ))
        })?;
        Ok(format!("http://{address}:{}/", self.config.port))
    }

    async fn call(
        &self,
        action: EnforcementAction,
        target: &EnforcementTarget,
        container_id: &str,
        rules: &[Rule],
    ) -> Result<(), PolicyError> {
        let base = self.base_url(target)?;
        let path = format!("network/{}", action.as_str());
        let payload = json!({ "containerId": container_id, "rules": rules });

        let result = async {
            let url = build_url(&base, &path)?;
            let headers = auth_headers(&self.config.token)?;
            send_json(Method::POST, url, Some(payload), headers, self.config.timeout).await
        }
        .await;

        result.map(|_| ()).map_err(|err| match err {
            HttpError::Timeout(msg) => PolicyError::EnforcementTimeout(msg),
            other => PolicyError::Enforcement(other.to_string()),
        })
    }
}

#[async_trait::async_trait]
impl PolicyEnforcer for AgentPolicyEnforcer {
    async fn install(
        &self,
        target: &EnforcementTarget,
        container_id: &str,
        rules: &[Rule],
    ) -> Result<(), PolicyError> {
        self.call(EnforcementAction::Install, target, container_id, rules)
            .await
    }

    async fn remove(
        &self,
        target: &EnforcementTarget,
        container_id: &str,
        rules: &[Rule],
    ) -> Result<(), PolicyError> {
        self.call(EnforcementAction::Remove, target, container_id, rules)
            .await
    }
}

/// Mock enforcer for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct EnforcerCall {
        pub action: EnforcementAction,
        pub container_id: String,
        pub rules: Vec<Rule>,
    }

    /// Records every call and simulates the installed rule state per container.
    pub struct MockPolicyEnforcer {
        pub install_calls: AtomicUsize,
        pub remove_calls: AtomicUsize,
        calls: Mutex<Vec<EnforcerCall>>,
        installed: Mutex<BTreeMap<String, BTreeSet<Rule>>>,
        /// 1-based call index that fails (counting installs and removes).
        fail_on_call: Mutex<Option<usize>>,
        fail_all: AtomicBool,
        delay: Mutex<Option<Duration>>,
    }

    impl Default for MockPolicyEnforcer {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockPolicyEnforcer {
        pub fn new() -> Self {
            Self {
                install_calls: AtomicUsize::new(0),
                remove_calls: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
                installed: Mutex::new(BTreeMap::new()),
                fail_on_call: Mutex::new(None),
                fail_all: AtomicBool::new(false),
                delay: Mutex::new(None),
            }
        }

        pub fn total_calls(&self) -> usize {
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
        }

        pub fn calls(&self) -> Vec<EnforcerCall> {
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        /// Rules currently installed on `container_id`.
        pub fn installed(&self, container_id: &str) -> BTreeSet<Rule> {
            self.installed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(container_id)
                .cloned()
                .unwrap_or_default()
        }

        pub fn fail_on_call(&self, n: Option<usize>) {
            *self.fail_on_call.lock().unwrap_or_else(|e| e.into_inner()) = n;
        }

        pub fn set_fail_all(&self, fail: bool) {
            self.fail_all.store(fail, Ordering::SeqCst);
        }

        pub fn set_delay(&self, delay: Option<Duration>) {
            *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
        }

        async fn record(
            &self,
            action: EnforcementAction,
            container_id: &str,
            rules: &[Rule],
        ) -> Result<(), PolicyError> {
            let index = {
                let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
                calls.push(EnforcerCall {
                    action,
                    container_id: container_id.to_string(),
                    rules: rules.to_vec(),
                });
                calls.len()
            };
            match action {
                EnforcementAction::Install => self.install_calls.fetch_add(1, Ordering::SeqCst),
                EnforcementAction::Remove => self.remove_calls.fetch_add(1, Ordering::SeqCst),
            };

            let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let fail_here = *self.fail_on_call.lock().unwrap_or_else(|e| e.into_inner())
                == Some(index);
            if fail_here || self.fail_all.load(Ordering::SeqCst) {
                return Err(PolicyError::Enforcement(format!(
                    "mock {} failed on call {index}",
                    action.as_str()
                )));
            }

            let mut installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
            let set = installed.entry(container_id.to_string()).or_default();
            for rule in rules {
                match action {
                    EnforcementAction::Install => {
                        set.insert(rule.clone());
                    }
                    EnforcementAction::Remove => {
                        set.remove(rule);
                    }
                }
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl PolicyEnforcer for MockPolicyEnforcer {
        async fn install(
            &self,
            _target: &EnforcementTarget,
            container_id: &str,
            rules: &[Rule],
        ) -> Result<(), PolicyError> {
            self.record(EnforcementAction::Install, container_id, rules)
                .await
        }

        async fn remove(
            &self,
            _target: &EnforcementTarget,
            container_id: &str,
            rules: &[Rule],
        ) -> Result<(), PolicyError> {
            self.record(EnforcementAction::Remove, container_id, rules)
                .await
        }
    }
}
