//! Declarative per-container network policy and its enforcement.
//!
//! A [`NetworkPolicy`] is validated at the boundary, compiled into a set of
//! [`Rule`]s per container slot (an [`EnforcementPlan`]) and pushed through a
//! [`PolicyEnforcer`]. Every container slot always has a plan: a slot without
//! an explicit policy gets the default-deny template.
//!
//! Changes are applied as a diff between the installed and the desired plan,
//! in four phases:
//!
//! 1. remove permissive rules that are no longer wanted,
//! 2. remove restrictive rules that are no longer wanted,
//! 3. install new restrictive rules,
//! 4. install new permissive rules.
//!
//! So egress never widens past the union of the old and new policy while a
//! change is in flight. Each performed step is journaled; a failing step rolls
//! the journal back in reverse order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::PolicyConfig;
use crate::enforcer::{EnforcementAction, EnforcementTarget, PolicyEnforcer};
use crate::error::PolicyError;
use crate::metrics::metrics;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// An egress destination: a domain, a `*.` wildcard domain, an IP or a CIDR block.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Destination {
    Domain(String),
    /// Matches strict subdomains of the stored suffix.
    Wildcard(String),
    Ip(IpAddr),
    Cidr { network: IpAddr, prefix: u8 },
}

fn valid_domain(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

fn mask_v4(addr: u32, prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { addr & (u32::MAX << (32 - u32::from(prefix))) }
}

fn mask_v6(addr: u128, prefix: u8) -> u128 {
    if prefix == 0 { 0 } else { addr & (u128::MAX << (128 - u32::from(prefix))) }
}

fn cidr_contains(network: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            mask_v4(u32::from(net), prefix) == mask_v4(u32::from(ip), prefix)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            mask_v6(u128::from(net), prefix) == mask_v6(u128::from(ip), prefix)
        }
        _ => false,
    }
}

impl FromStr for Destination {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim().to_ascii_lowercase();
        if value.is_empty() {
            return Err("empty destination".into());
        }

        if let Some((addr, prefix)) = value.split_once('/') {
            let ip: IpAddr = addr
                .parse()
                .map_err(|_| format!("invalid CIDR address in '{raw}'"))?;
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| format!("invalid CIDR prefix in '{raw}'"))?;
            let network = match ip {
                IpAddr::V4(v4) if prefix <= 32 => {
                    IpAddr::V4(mask_v4(u32::from(v4), prefix).into())
                }
                IpAddr::V6(v6) if prefix <= 128 => {
                    IpAddr::V6(mask_v6(u128::from(v6), prefix).into())
                }
                _ => return Err(format!("CIDR prefix out of range in '{raw}'")),
            };
            return Ok(Destination::Cidr { network, prefix });
        }

        if let Ok(ip) = value.parse::<IpAddr>() {
            return Ok(Destination::Ip(ip));
        }

        if let Some(suffix) = value.strip_prefix("*.") {
            if valid_domain(suffix) {
                return Ok(Destination::Wildcard(suffix.to_string()));
            }
            return Err(format!("invalid wildcard domain '{raw}'"));
        }

        if valid_domain(&value) {
            Ok(Destination::Domain(value))
        } else {
            Err(format!("invalid destination '{raw}'"))
        }
    }
}

impl TryFrom<String> for Destination {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Destination> for String {
    fn from(value: Destination) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Domain(d) => write!(f, "{d}"),
            Destination::Wildcard(suffix) => write!(f, "*.{suffix}"),
            Destination::Ip(ip) => write!(f, "{ip}"),
            Destination::Cidr { network, prefix } => write!(f, "{network}/{prefix}"),
        }
    }
}

impl Destination {
    /// Whether some address or name is matched by both destinations.
    ///
    /// Names and addresses never overlap; resolution happens in the sandbox.
    pub fn overlaps(&self, other: &Destination) -> bool {
        use Destination::*;
        let is_subdomain = |name: &str, suffix: &str| {
            name.len() > suffix.len() + 1
                && name.ends_with(suffix)
                && name.as_bytes()[name.len() - suffix.len() - 1] == b'.'
        };
        match (self, other) {
            (Domain(a), Domain(b)) => a == b,
            (Wildcard(s), Domain(d)) | (Domain(d), Wildcard(s)) => is_subdomain(d, s),
            (Wildcard(a), Wildcard(b)) => a == b || is_subdomain(a, b) || is_subdomain(b, a),
            (Ip(a), Ip(b)) => a == b,
            (Cidr { network, prefix }, Ip(ip)) | (Ip(ip), Cidr { network, prefix }) => {
                cidr_contains(*network, *prefix, *ip)
            }
            (
                Cidr {
                    network: n1,
                    prefix: p1,
                },
                Cidr {
                    network: n2,
                    prefix: p2,
                },
            ) => {
                let shorter = (*p1).min(*p2);
                cidr_contains(*n1, shorter, *n2)
            }
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortRule {
    pub port: u16,
    pub direction: Direction,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Network configuration for one container slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NetworkPolicy {
    pub container_id: String,
    #[serde(default)]
    pub egress_allowlist: BTreeSet<Destination>,
    #[serde(default)]
    pub egress_denylist: BTreeSet<Destination>,
    #[serde(default)]
    pub inter_container_allowed: bool,
    /// Restricts inter-container traffic to these slots. Empty means every
    /// other slot that also allows inter-container traffic.
    #[serde(default)]
    pub inter_container_peers: BTreeSet<String>,
    #[serde(default)]
    pub open_ports: BTreeSet<PortRule>,
}

impl NetworkPolicy {
    /// Deny all egress and all ingress except from the control plane.
    pub fn default_deny(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            egress_allowlist: BTreeSet::new(),
            egress_denylist: BTreeSet::new(),
            inter_container_allowed: false,
            inter_container_peers: BTreeSet::new(),
            open_ports: BTreeSet::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

/// Enforcement primitive installed on one container.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Rule {
    DefaultDeny,
    AllowControlPlaneIngress,
    #[serde(rename_all = "camelCase")]
    DenyEgress { destination: Destination },
    #[serde(rename_all = "camelCase")]
    AllowEgress { destination: Destination },
    #[serde(rename_all = "camelCase")]
    OpenPort {
        port: u16,
        direction: Direction,
        protocol: Protocol,
    },
    #[serde(rename_all = "camelCase")]
    AllowPeer { container_id: String },
}

impl Rule {
    /// Restrictive rules narrow what a container may reach.
    pub fn is_restrictive(&self) -> bool {
        matches!(self, Rule::DefaultDeny | Rule::DenyEgress { .. })
    }
}

/// Rules per container slot.
pub type EnforcementPlan = BTreeMap<String, BTreeSet<Rule>>;

/// One enforcer call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnforcementStep {
    pub action: EnforcementAction,
    pub container_id: String,
    pub rules: Vec<Rule>,
}

impl EnforcementStep {
    fn inverse(&self) -> Self {
        Self {
            action: self.action.inverse(),
            container_id: self.container_id.clone(),
            rules: self.rules.clone(),
        }
    }
}

/// Validate `policies` against the known container slots and return the
/// total policy set (one entry per slot, in slot order).
pub fn normalize(
    containers: &[String],
    policies: &[NetworkPolicy],
) -> Result<Vec<NetworkPolicy>, PolicyError> {
    let known: BTreeSet<&str> = containers.iter().map(String::as_str).collect();
    let mut by_slot: BTreeMap<&str, &NetworkPolicy> = BTreeMap::new();

    for policy in policies {
        let slot = policy.container_id.as_str();
        if !known.contains(slot) {
            return Err(PolicyError::Malformed(format!(
                "unknown container slot '{slot}'"
            )));
        }
        if by_slot.insert(slot, policy).is_some() {
            return Err(PolicyError::Malformed(format!(
                "duplicate policy for container slot '{slot}'"
            )));
        }

        for allowed in &policy.egress_allowlist {
            if let Some(denied) = policy.egress_denylist.iter().find(|d| allowed.overlaps(d)) {
                return Err(PolicyError::Malformed(format!(
                    "{slot}: '{allowed}' overlaps denied destination '{denied}'"
                )));
            }
        }

        if let Some(port) = policy.open_ports.iter().find(|p| p.port == 0) {
            return Err(PolicyError::Malformed(format!(
                "{slot}: invalid port {} ({:?})",
                port.port, port.direction
            )));
        }

        if !policy.inter_container_allowed && !policy.inter_container_peers.is_empty() {
            return Err(PolicyError::Malformed(format!(
                "{slot}: inter-container peers listed while inter-container traffic is disabled"
            )));
        }
    }

    for policy in by_slot.values() {
        let slot = policy.container_id.as_str();
        for peer in &policy.inter_container_peers {
            if peer == slot {
                return Err(PolicyError::Malformed(format!(
                    "{slot}: a container cannot list itself as a peer"
                )));
            }
            if !known.contains(peer.as_str()) {
                return Err(PolicyError::Malformed(format!(
                    "{slot}: unknown peer container '{peer}'"
                )));
            }
            let peer_allows = by_slot
                .get(peer.as_str())
                .is_some_and(|p| p.inter_container_allowed);
            if !peer_allows {
                return Err(PolicyError::Malformed(format!(
                    "{slot}: peer '{peer}' does not allow inter-container traffic"
                )));
            }
        }
    }

    Ok(containers
        .iter()
        .map(|slot| {
            by_slot
                .get(slot.as_str())
                .map(|p| (*p).clone())
                .unwrap_or_else(|| NetworkPolicy::default_deny(slot.clone()))
        })
        .collect())
}

fn effective_peers<'a>(policy: &'a NetworkPolicy, all: &'a [NetworkPolicy]) -> BTreeSet<&'a str> {
    if !policy.inter_container_allowed {
        return BTreeSet::new();
    }
    if !policy.inter_container_peers.is_empty() {
        return policy.inter_container_peers.iter().map(String::as_str).collect();
    }
    all.iter()
        .filter(|p| p.inter_container_allowed && p.container_id != policy.container_id)
        .map(|p| p.container_id.as_str())
        .collect()
}

/// Compile a normalized policy set. Peer rules are only emitted for pairs
/// that name each other.
pub fn compile(policies: &[NetworkPolicy]) -> EnforcementPlan {
    let mut plan = EnforcementPlan::new();
    for policy in policies {
        let mut rules = BTreeSet::from([Rule::DefaultDeny, Rule::AllowControlPlaneIngress]);
        rules.extend(
            policy
                .egress_denylist
                .iter()
                .map(|d| Rule::DenyEgress { destination: d.clone() }),
        );
        rules.extend(
            policy
                .egress_allowlist
                .iter()
                .map(|d| Rule::AllowEgress { destination: d.clone() }),
        );
        rules.extend(policy.open_ports.iter().map(|p| Rule::OpenPort {
            port: p.port,
            direction: p.direction,
            protocol: p.protocol,
        }));

        let mine = effective_peers(policy, policies);
        for peer in &mine {
            let mutual = policies
                .iter()
                .find(|p| p.container_id == *peer)
                .is_some_and(|p| effective_peers(p, policies).contains(policy.container_id.as_str()));
            if mutual {
                rules.insert(Rule::AllowPeer {
                    container_id: (*peer).to_string(),
                });
            }
        }

        plan.insert(policy.container_id.clone(), rules);
    }
    plan
}

/// Steps that move an enforcer from `current` to `desired`, in the
/// narrowing-first order described in the module docs.
pub fn diff(current: &EnforcementPlan, desired: &EnforcementPlan) -> Vec<EnforcementStep> {
    let empty = BTreeSet::new();
    let slots: BTreeSet<&String> = current.keys().chain(desired.keys()).collect();

    let phases = [
        (EnforcementAction::Remove, false),
        (EnforcementAction::Remove, true),
        (EnforcementAction::Install, true),
        (EnforcementAction::Install, false),
    ];

    let mut steps = Vec::new();
    for (action, restrictive) in phases {
        for slot in &slots {
            let have = current.get(*slot).unwrap_or(&empty);
            let want = desired.get(*slot).unwrap_or(&empty);
            let (from, to) = match action {
                EnforcementAction::Remove => (have, want),
                EnforcementAction::Install => (want, have),
            };
            let rules: Vec<Rule> = from
                .difference(to)
                .filter(|r| r.is_restrictive() == restrictive)
                .cloned()
                .collect();
            if !rules.is_empty() {
                steps.push(EnforcementStep {
                    action,
                    container_id: (*slot).clone(),
                    rules,
                });
            }
        }
    }
    steps
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Result of a successful reconcile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Total policy set now enforced.
    pub applied: Vec<NetworkPolicy>,
    /// Enforcer calls made. Zero when `current` already matched `desired`.
    pub steps: usize,
}

pub struct NetworkPolicyEngine {
    enforcer: Arc<dyn PolicyEnforcer>,
    config: PolicyConfig,
}

impl NetworkPolicyEngine {
    pub fn new(enforcer: Arc<dyn PolicyEnforcer>, config: PolicyConfig) -> Self {
        Self { enforcer, config }
    }

    /// Default-deny policy for every container slot.
    pub fn default_template(&self) -> Vec<NetworkPolicy> {
        self.config
            .containers
            .iter()
            .map(|slot| NetworkPolicy::default_deny(slot.clone()))
            .collect()
    }

    pub fn validate(&self, policies: &[NetworkPolicy]) -> Result<Vec<NetworkPolicy>, PolicyError> {
        normalize(&self.config.containers, policies)
    }

    /// Install `policies` on an instance with nothing enforced yet.
    ///
    /// Either every container's rules are installed or, after rollback, none are.
    pub async fn apply(
        &self,
        target: &EnforcementTarget,
        policies: &[NetworkPolicy],
    ) -> Result<Vec<NetworkPolicy>, PolicyError> {
        let desired = self.validate(policies)?;
        let steps = diff(&EnforcementPlan::new(), &compile(&desired));
        self.execute(target, &steps).await.inspect_err(|_| {
            metrics().record_policy_failure();
        })?;
        metrics().record_policy_apply();
        info!(sandbox_id = %target.sandbox_id, steps = steps.len(), "network policy applied");
        Ok(desired)
    }

    /// Move the instance from `current` to `desired`, touching only the rules that differ.
    pub async fn reconcile(
        &self,
        target: &EnforcementTarget,
        desired: &[NetworkPolicy],
        current: &[NetworkPolicy],
    ) -> Result<ReconcileOutcome, PolicyError> {
        let desired = self.validate(desired)?;
        let current_plan = compile(&normalize(&self.config.containers, current)?);
        let steps = diff(&current_plan, &compile(&desired));

        if steps.is_empty() {
            debug!(sandbox_id = %target.sandbox_id, "network policy already up to date");
            return Ok(ReconcileOutcome {
                applied: desired,
                steps: 0,
            });
        }

        self.execute(target, &steps).await.inspect_err(|_| {
            metrics().record_policy_failure();
        })?;
        metrics().record_policy_apply();
        info!(sandbox_id = %target.sandbox_id, steps = steps.len(), "network policy reconciled");
        Ok(ReconcileOutcome {
            applied: desired,
            steps: steps.len(),
        })
    }

    async fn run_step(
        &self,
        target: &EnforcementTarget,
        step: &EnforcementStep,
    ) -> Result<(), PolicyError> {
        let call = async {
            match step.action {
                EnforcementAction::Install => {
                    self.enforcer
                        .install(target, &step.container_id, &step.rules)
                        .await
                }
                EnforcementAction::Remove => {
                    self.enforcer
                        .remove(target, &step.container_id, &step.rules)
                        .await
                }
            }
        };
        match tokio::time::timeout(self.config.enforcement_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PolicyError::EnforcementTimeout(format!(
                "{} on {} did not complete within {}s",
                step.action.as_str(),
                step.container_id,
                self.config.enforcement_timeout.as_secs()
            ))),
        }
    }

    /// Run `steps` in order, journaling each completed one.
    async fn execute(
        &self,
        target: &EnforcementTarget,
        steps: &[EnforcementStep],
    ) -> Result<(), PolicyError> {
        let mut journal: Vec<&EnforcementStep> = Vec::new();
        for step in steps {
            let err = match self.run_step(target, step).await {
                Ok(()) => {
                    journal.push(step);
                    continue;
                }
                Err(err) => err,
            };

            warn!(
                sandbox_id = %target.sandbox_id,
                container_id = %step.container_id,
                action = step.action.as_str(),
                completed = journal.len(),
                "enforcement step failed: {err}"
            );

            // A timed-out call may still have landed.
            let mut undo: Vec<EnforcementStep> = Vec::new();
            if matches!(err, PolicyError::EnforcementTimeout(_)) {
                undo.push(step.inverse());
            }
            undo.extend(journal.iter().rev().map(|s| s.inverse()));
            let rolled_back = self.rollback(target, &undo).await;

            if journal.is_empty() && rolled_back {
                return Err(err);
            }
            return Err(PolicyError::PartialApply {
                reason: err.to_string(),
                rolled_back,
            });
        }
        Ok(())
    }

    async fn rollback(&self, target: &EnforcementTarget, undo: &[EnforcementStep]) -> bool {
        let mut ok = true;
        for step in undo {
            if let Err(err) = self.run_step(target, step).await {
                error!(
                    sandbox_id = %target.sandbox_id,
                    container_id = %step.container_id,
                    action = step.action.as_str(),
                    "rollback step failed: {err}"
                );
                ok = false;
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcer::mock::MockPolicyEnforcer;
    use std::time::Duration;

    fn slots() -> Vec<String> {
        PolicyConfig::default().containers
    }

    fn dest(s: &str) -> Destination {
        s.parse().unwrap()
    }

    fn engine() -> (Arc<MockPolicyEnforcer>, NetworkPolicyEngine) {
        let mock = Arc::new(MockPolicyEnforcer::new());
        let config = PolicyConfig {
            enforcement_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        (mock.clone(), NetworkPolicyEngine::new(mock, config))
    }

    fn target() -> EnforcementTarget {
        EnforcementTarget {
            sandbox_id: "sandbox-test".into(),
            address: Some("10.0.0.5".into()),
        }
    }

    fn runpod_policy() -> NetworkPolicy {
        NetworkPolicy {
            egress_allowlist: BTreeSet::from([dest("api.runpod.ai"), dest("*.runpod.net")]),
            ..NetworkPolicy::default_deny("container-4")
        }
    }

    #[test]
    fn destinations_parse_and_normalize() {
        assert_eq!(dest("API.RunPod.ai"), Destination::Domain("api.runpod.ai".into()));
        assert_eq!(dest("*.runpod.net"), Destination::Wildcard("runpod.net".into()));
        assert_eq!(dest("1.2.3.4"), Destination::Ip("1.2.3.4".parse().unwrap()));
        assert_eq!(dest("10.1.2.3/8").to_string(), "10.0.0.0/8");
        assert!("".parse::<Destination>().is_err());
        assert!("bad_domain.com".parse::<Destination>().is_err());
        assert!("10.0.0.0/33".parse::<Destination>().is_err());
        assert!("*.".parse::<Destination>().is_err());
    }

    #[test]
    fn overlap_covers_wildcards_and_cidrs() {
        assert!(dest("*.runpod.net").overlaps(&dest("eu.runpod.net")));
        assert!(!dest("*.runpod.net").overlaps(&dest("runpod.net")));
        assert!(!dest("*.runpod.net").overlaps(&dest("notrunpod.net")));
        assert!(dest("*.a.com").overlaps(&dest("*.b.a.com")));
        assert!(dest("10.0.0.0/8").overlaps(&dest("10.20.0.1")));
        assert!(dest("10.0.0.0/8").overlaps(&dest("10.20.0.0/16")));
        assert!(!dest("10.0.0.0/16").overlaps(&dest("10.1.0.0/16")));
        assert!(!dest("example.com").overlaps(&dest("93.184.216.34")));
    }

    #[test]
    fn schema_rejects_unknown_fields() {
        let raw = r#"{"containerId":"container-1","egressAllowlist":[],"allowAll":true}"#;
        assert!(serde_json::from_str::<NetworkPolicy>(raw).is_err());

        let raw = r#"{"containerId":"container-1","openPorts":[{"port":8080,"direction":"ingress"}]}"#;
        let policy: NetworkPolicy = serde_json::from_str(raw).unwrap();
        assert_eq!(
            policy.open_ports.iter().next().map(|p| p.protocol),
            Some(Protocol::Tcp)
        );
    }

    #[test]
    fn normalize_fills_omitted_slots_with_default_deny() {
        let set = normalize(&slots(), &[runpod_policy()]).unwrap();
        assert_eq!(set.len(), 4);
        assert_eq!(set[0], NetworkPolicy::default_deny("container-1"));
        assert_eq!(set[3], runpod_policy());
    }

    #[test]
    fn normalize_rejects_malformed_sets() {
        let unknown = NetworkPolicy::default_deny("container-9");
        assert!(matches!(normalize(&slots(), &[unknown]), Err(PolicyError::Malformed(_))));

        let dup = vec![runpod_policy(), runpod_policy()];
        assert!(matches!(normalize(&slots(), &dup), Err(PolicyError::Malformed(_))));

        let mut overlap = runpod_policy();
        overlap.egress_denylist.insert(dest("eu.runpod.net"));
        let err = normalize(&slots(), &[overlap]).unwrap_err();
        assert!(matches!(err, PolicyError::Malformed(ref m) if m.contains("eu.runpod.net")));

        let mut contradictory = NetworkPolicy::default_deny("container-1");
        contradictory.inter_container_peers.insert("container-2".into());
        assert!(normalize(&slots(), &[contradictory]).is_err());

        let mut one_sided = NetworkPolicy::default_deny("container-1");
        one_sided.inter_container_allowed = true;
        one_sided.inter_container_peers.insert("container-2".into());
        assert!(normalize(&slots(), &[one_sided]).is_err());

        let mut port_zero = NetworkPolicy::default_deny("container-1");
        port_zero.open_ports.insert(PortRule {
            port: 0,
            direction: Direction::Ingress,
            protocol: Protocol::Tcp,
        });
        assert!(normalize(&slots(), &[port_zero]).is_err());
    }

    #[test]
    fn compile_default_deny_has_baseline_rules_only() {
        let set = normalize(&slots(), &[]).unwrap();
        let plan = compile(&set);
        assert_eq!(plan.len(), 4);
        for rules in plan.values() {
            assert_eq!(
                rules,
                &BTreeSet::from([Rule::DefaultDeny, Rule::AllowControlPlaneIngress])
            );
        }
    }

    #[test]
    fn compile_emits_only_mutual_peer_rules() {
        let mut a = NetworkPolicy::default_deny("container-1");
        a.inter_container_allowed = true;
        let mut b = NetworkPolicy::default_deny("container-2");
        b.inter_container_allowed = true;
        let mut c = NetworkPolicy::default_deny("container-3");
        c.inter_container_allowed = true;
        c.inter_container_peers.insert("container-2".into());

        let plan = compile(&normalize(&slots(), &[a, b, c]).unwrap());
        let peers = |slot: &str| -> Vec<String> {
            plan[slot]
                .iter()
                .filter_map(|r| match r {
                    Rule::AllowPeer { container_id } => Some(container_id.clone()),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(peers("container-1"), vec!["container-2"]);
        assert_eq!(peers("container-2"), vec!["container-1", "container-3"]);
        assert_eq!(peers("container-3"), vec!["container-2"]);
        assert!(peers("container-4").is_empty());
    }

    #[test]
    fn diff_narrows_before_widening() {
        let mut old = NetworkPolicy::default_deny("container-1");
        old.egress_allowlist.insert(dest("old.example.com"));
        old.egress_denylist.insert(dest("bad.example.org"));
        let mut new = NetworkPolicy::default_deny("container-1");
        new.egress_allowlist.insert(dest("new.example.com"));
        new.egress_denylist.insert(dest("worse.example.org"));

        let current = compile(&normalize(&slots(), &[old]).unwrap());
        let desired = compile(&normalize(&slots(), &[new]).unwrap());
        let steps = diff(&current, &desired);

        let summary: Vec<(EnforcementAction, Rule)> = steps
            .iter()
            .map(|s| (s.action, s.rules[0].clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (
                    EnforcementAction::Remove,
                    Rule::AllowEgress { destination: dest("old.example.com") }
                ),
                (
                    EnforcementAction::Remove,
                    Rule::DenyEgress { destination: dest("bad.example.org") }
                ),
                (
                    EnforcementAction::Install,
                    Rule::DenyEgress { destination: dest("worse.example.org") }
                ),
                (
                    EnforcementAction::Install,
                    Rule::AllowEgress { destination: dest("new.example.com") }
                ),
            ]
        );
    }

    #[tokio::test]
    async fn apply_installs_every_slot() {
        let (mock, engine) = engine();
        let applied = engine.apply(&target(), &[runpod_policy()]).await.unwrap();
        assert_eq!(applied.len(), 4);
        assert!(mock.installed("container-1").contains(&Rule::DefaultDeny));
        assert!(mock.installed("container-4").contains(&Rule::AllowEgress {
            destination: dest("*.runpod.net")
        }));
        assert_eq!(mock.remove_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_policy_makes_no_enforcer_calls() {
        let (mock, engine) = engine();
        let err = engine
            .apply(&target(), &[NetworkPolicy::default_deny("container-7")])
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Malformed(_)));
        assert_eq!(mock.total_calls(), 0);
    }

    #[tokio::test]
    async fn reconcile_twice_is_idempotent() {
        let (mock, engine) = engine();
        let current = engine.apply(&target(), &[]).await.unwrap();
        let first = engine
            .reconcile(&target(), &[runpod_policy()], &current)
            .await
            .unwrap();
        assert!(first.steps > 0);

        let calls_after_first = mock.total_calls();
        let second = engine
            .reconcile(&target(), &[runpod_policy()], &first.applied)
            .await
            .unwrap();
        assert_eq!(second.steps, 0);
        assert_eq!(mock.total_calls(), calls_after_first);
    }

    #[tokio::test]
    async fn reconcile_leaves_unrelated_slots_untouched() {
        let (mock, engine) = engine();
        let current = engine.apply(&target(), &[]).await.unwrap();
        let before = mock.total_calls();
        engine
            .reconcile(&target(), &[runpod_policy()], &current)
            .await
            .unwrap();
        let touched: BTreeSet<String> = mock.calls()[before..]
            .iter()
            .map(|c| c.container_id.clone())
            .collect();
        assert_eq!(touched, BTreeSet::from(["container-4".to_string()]));
    }

    #[tokio::test]
    async fn partial_failure_rolls_back() {
        let (mock, engine) = engine();
        // The second baseline install fails after the first one landed.
        mock.fail_on_call(Some(2));
        let err = engine.apply(&target(), &[]).await.unwrap_err();
        assert_eq!(
            err,
            PolicyError::PartialApply {
                reason: "enforcement error: mock install failed on call 2".into(),
                rolled_back: true,
            }
        );
        for slot in slots() {
            assert!(mock.installed(&slot).is_empty(), "{slot} not rolled back");
        }
    }

    #[tokio::test]
    async fn first_step_failure_is_not_partial() {
        let (mock, engine) = engine();
        mock.fail_on_call(Some(1));
        let err = engine.apply(&target(), &[]).await.unwrap_err();
        assert!(matches!(err, PolicyError::Enforcement(_)));
    }

    #[tokio::test]
    async fn slow_enforcer_times_out() {
        let (mock, engine) = engine();
        mock.set_delay(Some(Duration::from_secs(2)));
        let err = engine.apply(&target(), &[]).await.unwrap_err();
        assert!(matches!(
            err,
            PolicyError::EnforcementTimeout(_) | PolicyError::PartialApply { .. }
        ));
    }
}
