//! Process-wide control-plane counters, served on `GET /metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics tracker using atomic counters.
///
/// All counters use relaxed ordering; they are monotonic counters read on
/// demand, so strict ordering isn't needed.
pub struct ControlPlaneMetrics {
    pub spawns: AtomicU64,
    pub kills: AtomicU64,
    /// Sandboxes that reached `Failed` during provisioning or readiness gating.
    pub provision_failures: AtomicU64,
    pub destroy_retries: AtomicU64,
    pub policy_applies: AtomicU64,
    pub policy_failures: AtomicU64,
    pub auth_failures: AtomicU64,
    pub lockouts: AtomicU64,
    /// Orphaned or untracked instances destroyed by the reaper.
    pub reaped_instances: AtomicU64,
    pub snapshots: AtomicU64,
    pub rate_limited: AtomicU64,
}

impl Default for ControlPlaneMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPlaneMetrics {
    pub const fn new() -> Self {
        Self {
            spawns: AtomicU64::new(0),
            kills: AtomicU64::new(0),
            provision_failures: AtomicU64::new(0),
            destroy_retries: AtomicU64::new(0),
            policy_applies: AtomicU64::new(0),
            policy_failures: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            lockouts: AtomicU64::new(0),
            reaped_instances: AtomicU64::new(0),
            snapshots: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
        }
    }

    pub fn record_spawn(&self) {
        self.spawns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_kill(&self) {
        self.kills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_provision_failure(&self) {
        self.provision_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroy_retry(&self) {
        self.destroy_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_policy_apply(&self) {
        self.policy_applies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_policy_failure(&self) {
        self.policy_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lockout(&self) {
        self.lockouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reaped(&self) {
        self.reaped_instances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self) {
        self.snapshots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all counters as key-value pairs.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        vec![
            ("spawns".into(), load(&self.spawns)),
            ("kills".into(), load(&self.kills)),
            ("provision_failures".into(), load(&self.provision_failures)),
            ("destroy_retries".into(), load(&self.destroy_retries)),
            ("policy_applies".into(), load(&self.policy_applies)),
            ("policy_failures".into(), load(&self.policy_failures)),
            ("auth_failures".into(), load(&self.auth_failures)),
            ("lockouts".into(), load(&self.lockouts)),
            ("reaped_instances".into(), load(&self.reaped_instances)),
            ("snapshots".into(), load(&self.snapshots)),
            ("rate_limited".into(), load(&self.rate_limited)),
        ]
    }
}

/// Global metrics instance.
static METRICS: ControlPlaneMetrics = ControlPlaneMetrics::new();

/// Returns the global metrics tracker.
pub fn metrics() -> &'static ControlPlaneMetrics {
    &METRICS
}
