//! Single-slot sandbox lifecycle.
//!
//! ```text
//! Absent -> Provisioning -> PolicyPending -> Running -> Destroying -> Absent
//!               |                |                          |
//!               +----------------+--------> Failed <--------+
//! ```
//!
//! `spawn` and `kill` only perform the synchronous transition under the slot
//! lock. Provider waits run on a background task that re-takes the lock to
//! commit each transition; a commit only lands if the record is still in the
//! state the task expects, which is how `kill` redirects an in-flight
//! provision into the destroy path. The slot lock is never held across an
//! `.await`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::LifecycleConfig;
use crate::enforcer::EnforcementTarget;
use crate::error::{LifecycleError, OrchestratorError, PolicyError, ProviderError, Result};
use crate::metrics::metrics;
use crate::policy::{NetworkPolicy, NetworkPolicyEngine};
use crate::provider::{CloudProviderClient, CreateInstanceRequest, InstanceStatus, SnapshotProgress};
use crate::retry::{call_with_retry, with_timeout};
use crate::store::PersistentStore;
use crate::util::now_ts;

const SLOT_KEY: &str = "slot";
const DESIRED_KEY: &str = "desired";
const SNAPSHOT_JOB_KEY: &str = "latest";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SandboxState {
    Absent,
    Provisioning,
    PolicyPending,
    Running,
    Destroying,
    Failed,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxState::Absent => "Absent",
            SandboxState::Provisioning => "Provisioning",
            SandboxState::PolicyPending => "PolicyPending",
            SandboxState::Running => "Running",
            SandboxState::Destroying => "Destroying",
            SandboxState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

const ANY_STATE: &[SandboxState] = &[
    SandboxState::Absent,
    SandboxState::Provisioning,
    SandboxState::PolicyPending,
    SandboxState::Running,
    SandboxState::Destroying,
    SandboxState::Failed,
];

/// The sandbox occupying the slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    pub id: String,
    /// Provider-assigned id, once the create call returned.
    pub instance_id: Option<String>,
    pub snapshot_id: String,
    pub state: SandboxState,
    pub created_at: u64,
    pub last_transition_at: u64,
    pub applied_policy: Option<Vec<NetworkPolicy>>,
    pub failure_reason: Option<String>,
    pub private_ip: Option<String>,
    /// Provider attempts made in the current phase.
    pub attempts: u32,
}

/// Immutable provider image usable by `spawn`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub image_id: String,
    pub version: u64,
    pub created_at: u64,
    pub source_instance_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotJobState {
    /// Persisted, the provider action not yet accepted.
    Starting,
    InProgress,
    Completed,
    Failed,
}

/// The most recent snapshot request and its provider action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotJob {
    pub version: u64,
    pub name: String,
    pub sandbox_id: String,
    pub source_instance_id: String,
    pub action_id: Option<String>,
    pub state: SnapshotJobState,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub image_id: Option<String>,
    pub failure_reason: Option<String>,
}

impl SnapshotJob {
    pub fn in_flight(&self) -> bool {
        matches!(self.state, SnapshotJobState::Starting | SnapshotJobState::InProgress)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct SlotRecord {
    sandbox: Option<Sandbox>,
    /// Instance ids that may still exist at the provider but belong to no record.
    orphans: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    pub state: SandboxState,
    pub sandbox: Option<Sandbox>,
    pub orphaned_instances: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkView {
    pub desired: Vec<NetworkPolicy>,
    pub applied: Option<Vec<NetworkPolicy>>,
}

/// Handle to the background task working on the slot.
struct TaskHandle {
    sandbox_id: String,
    /// Distinguishes a task from its successor for the same sandbox.
    generation: u64,
    cancel: watch::Sender<bool>,
}

struct Slot {
    record: SlotRecord,
    task: Option<TaskHandle>,
    generation: u64,
}

impl Slot {
    fn install_task(&mut self, sandbox_id: &str, cancel: watch::Sender<bool>) -> u64 {
        self.generation += 1;
        self.task = Some(TaskHandle {
            sandbox_id: sandbox_id.to_string(),
            generation: self.generation,
            cancel,
        });
        self.generation
    }

    fn has_task_for(&self, sandbox_id: &str) -> bool {
        self.task.as_ref().is_some_and(|t| t.sandbox_id == sandbox_id)
    }

    fn status(&self) -> SandboxStatus {
        SandboxStatus {
            state: self
                .record
                .sandbox
                .as_ref()
                .map(|s| s.state)
                .unwrap_or(SandboxState::Absent),
            sandbox: self.record.sandbox.clone(),
            orphaned_instances: self.record.orphans.clone(),
        }
    }
}

struct ProvisionJob {
    sandbox_id: String,
    snapshot_id: String,
    instance_id: Option<String>,
    /// Look for an instance already named after the sandbox before creating.
    adopt_first: bool,
}

enum ProvisionOutcome {
    Running,
    Cancelled { instance_id: Option<String> },
    Failed { reason: String },
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow() || cancel.has_changed().is_err()
}

/// Sleep for `delay` unless cancelled first. Returns false on cancellation.
async fn sleep_or_cancel(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    if is_cancelled(cancel) {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cancel.changed() => return false,
    }
    !is_cancelled(cancel)
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct Inner {
    provider: Arc<dyn CloudProviderClient>,
    engine: Arc<NetworkPolicyEngine>,
    config: LifecycleConfig,
    slot: Mutex<Slot>,
    slot_store: PersistentStore<SlotRecord>,
    network_store: PersistentStore<Vec<NetworkPolicy>>,
    snapshot_store: PersistentStore<Snapshot>,
    snapshot_job_store: PersistentStore<SnapshotJob>,
    snapshot_job: Mutex<Option<SnapshotJob>>,
    /// Serializes policy changes.
    network_gate: tokio::sync::Mutex<()>,
    events: watch::Sender<Option<Sandbox>>,
}

#[derive(Clone)]
pub struct SandboxLifecycleController {
    inner: Arc<Inner>,
}

impl SandboxLifecycleController {
    /// Open the controller's stores under `state_dir` and load the persisted slot.
    ///
    /// Call [`recover`](Self::recover) afterwards to resume interrupted work.
    pub fn open(
        state_dir: &Path,
        config: LifecycleConfig,
        provider: Arc<dyn CloudProviderClient>,
        engine: Arc<NetworkPolicyEngine>,
    ) -> Result<Self> {
        let slot_store: PersistentStore<SlotRecord> = PersistentStore::open_in(state_dir, "slot.json")?;
        let network_store = PersistentStore::open_in(state_dir, "network.json")?;
        let snapshot_store = PersistentStore::open_in(state_dir, "snapshots.json")?;
        let snapshot_job_store: PersistentStore<SnapshotJob> =
            PersistentStore::open_in(state_dir, "snapshot_job.json")?;
        let record = slot_store.get(SLOT_KEY)?.unwrap_or_default();
        let snapshot_job = snapshot_job_store.get(SNAPSHOT_JOB_KEY)?;
        let (events, _) = watch::channel(record.sandbox.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                provider,
                engine,
                config,
                slot: Mutex::new(Slot {
                    record,
                    task: None,
                    generation: 0,
                }),
                slot_store,
                network_store,
                snapshot_store,
                snapshot_job_store,
                snapshot_job: Mutex::new(snapshot_job),
                network_gate: tokio::sync::Mutex::new(()),
                events,
            }),
        })
    }

    pub fn engine(&self) -> &NetworkPolicyEngine {
        &self.inner.engine
    }

    /// Committed sandbox views, one per transition.
    pub fn subscribe(&self) -> watch::Receiver<Option<Sandbox>> {
        self.inner.events.subscribe()
    }

    /// Read-only view of the slot. Never touches the network.
    pub fn status(&self) -> SandboxStatus {
        self.inner.lock().status()
    }

    /// Start provisioning a new sandbox and return it in `Provisioning`.
    pub fn spawn(&self, snapshot_id: Option<String>) -> Result<Sandbox> {
        let snapshot_id = self.resolve_snapshot(snapshot_id)?;
        let inner = &self.inner;

        let mut slot = inner.lock();
        let previous = slot.record.clone();
        if let Some(existing) = &slot.record.sandbox {
            match existing.state {
                SandboxState::Absent => {}
                SandboxState::Failed => {
                    if let Some(instance_id) = existing.instance_id.clone() {
                        slot.record.orphans.push(instance_id);
                    }
                }
                state => {
                    return Err(LifecycleError::Conflict(format!(
                        "sandbox {} is {state}",
                        existing.id
                    ))
                    .into());
                }
            }
        }

        let now = now_ts();
        let sandbox = Sandbox {
            id: format!("sandbox-{}", uuid::Uuid::new_v4()),
            instance_id: None,
            snapshot_id: snapshot_id.clone(),
            state: SandboxState::Provisioning,
            created_at: now,
            last_transition_at: now,
            applied_policy: None,
            failure_reason: None,
            private_ip: None,
            attempts: 0,
        };
        slot.record.sandbox = Some(sandbox.clone());
        if let Err(err) = inner.persist(&slot.record) {
            slot.record = previous;
            return Err(err);
        }
        inner.publish(&slot.record);

        if let Err(err) = inner
            .network_store
            .insert(DESIRED_KEY.to_string(), inner.engine.default_template())
        {
            warn!(sandbox_id = %sandbox.id, "failed to reset desired network policy: {err}");
        }

        inner.launch_provision(
            &mut slot,
            ProvisionJob {
                sandbox_id: sandbox.id.clone(),
                snapshot_id,
                instance_id: None,
                adopt_first: false,
            },
        );
        drop(slot);

        metrics().record_spawn();
        info!(sandbox_id = %sandbox.id, snapshot_id = %sandbox.snapshot_id, "sandbox spawn accepted");
        Ok(sandbox)
    }

    fn resolve_snapshot(&self, requested: Option<String>) -> Result<String> {
        if let Some(id) = requested.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
            return Ok(id);
        }
        if let Some(latest) = self.snapshots()?.pop() {
            return Ok(latest.image_id);
        }
        self.inner
            .config
            .default_snapshot_id
            .clone()
            .ok_or_else(|| {
                OrchestratorError::Validation(
                    "no snapshotId given and no snapshot is configured".into(),
                )
            })
    }

    /// Tear the sandbox down. Idempotent: returns the current status when
    /// there is nothing to do or destruction is already under way.
    pub fn kill(&self) -> Result<SandboxStatus> {
        let inner = &self.inner;
        let mut slot = inner.lock();

        let (sandbox_id, state, instance_id) = match &slot.record.sandbox {
            None => return Ok(slot.status()),
            Some(s) => (s.id.clone(), s.state, s.instance_id.clone()),
        };
        let live_task = slot.has_task_for(&sandbox_id);

        match state {
            SandboxState::Absent | SandboxState::Destroying => return Ok(slot.status()),
            SandboxState::Provisioning | SandboxState::PolicyPending if live_task => {
                // The provision task observes the cancel and destroys whatever it created.
                inner.transition(&mut slot, SandboxState::Destroying);
                if let Some(task) = &slot.task {
                    let _ = task.cancel.send(true);
                }
                info!(sandbox_id = %sandbox_id, from = %state, "sandbox kill interrupts provisioning");
            }
            _ if instance_id.is_none() && !live_task => {
                slot.record.sandbox = None;
                inner.save(&slot.record);
                info!(sandbox_id = %sandbox_id, from = %state, "sandbox cleared, no instance was assigned");
            }
            _ => {
                inner.transition(&mut slot, SandboxState::Destroying);
                inner.launch_destroy(&mut slot, sandbox_id.clone(), instance_id);
                info!(sandbox_id = %sandbox_id, from = %state, "sandbox destroy started");
            }
        }

        metrics().record_kill();
        Ok(slot.status())
    }

    /// Apply `policies` to the running sandbox, touching only changed rules.
    pub async fn configure_network(&self, policies: Vec<NetworkPolicy>) -> Result<Vec<NetworkPolicy>> {
        let inner = &self.inner;
        let _gate = inner.network_gate.lock().await;

        let (sandbox_id, target, current) = {
            let slot = inner.lock();
            let sandbox = match &slot.record.sandbox {
                Some(s) if s.state == SandboxState::Running => s,
                other => {
                    let state = other.as_ref().map(|s| s.state).unwrap_or(SandboxState::Absent);
                    return Err(LifecycleError::StateConflict {
                        operation: "configure network",
                        state: state.to_string(),
                    }
                    .into());
                }
            };
            (
                sandbox.id.clone(),
                EnforcementTarget {
                    sandbox_id: sandbox.id.clone(),
                    address: sandbox.private_ip.clone(),
                },
                sandbox.applied_policy.clone().unwrap_or_default(),
            )
        };

        let desired = inner.engine.validate(&policies)?;
        inner
            .network_store
            .insert(DESIRED_KEY.to_string(), desired.clone())?;

        let outcome = match inner.engine.reconcile(&target, &desired, &current).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    sandbox_id = %sandbox_id,
                    state = %SandboxState::Running,
                    attempt = 1,
                    "network reconcile failed, last applied policy kept: {err}"
                );
                return Err(err.into());
            }
        };

        let applied = outcome.applied.clone();
        let committed = inner.commit(&sandbox_id, &[SandboxState::Running], |s| {
            s.applied_policy = Some(applied);
        });
        match committed {
            Some(_) => Ok(outcome.applied),
            None => Err(LifecycleError::StateConflict {
                operation: "configure network",
                state: inner.state_of(&sandbox_id).to_string(),
            }
            .into()),
        }
    }

    /// Desired and currently enforced policy sets.
    pub fn network(&self) -> Result<NetworkView> {
        let applied = self
            .inner
            .lock()
            .record
            .sandbox
            .as_ref()
            .and_then(|s| s.applied_policy.clone());
        let desired = self
            .inner
            .network_store
            .get(DESIRED_KEY)?
            .unwrap_or_else(|| self.inner.engine.default_template());
        Ok(NetworkView { desired, applied })
    }

    /// Start snapshotting the running instance. The provider action is issued
    /// once and awaited in the background; the image joins the catalog when
    /// the action completes. Only one snapshot runs at a time.
    pub fn snapshot(&self) -> Result<SnapshotJob> {
        let inner = &self.inner;

        let (sandbox_id, instance_id) = {
            let slot = inner.lock();
            match &slot.record.sandbox {
                Some(s) if s.state == SandboxState::Running => match &s.instance_id {
                    Some(iid) => (s.id.clone(), iid.clone()),
                    None => {
                        return Err(LifecycleError::StateConflict {
                            operation: "snapshot",
                            state: "Running without an instance".into(),
                        }
                        .into());
                    }
                },
                other => {
                    let state = other.as_ref().map(|s| s.state).unwrap_or(SandboxState::Absent);
                    return Err(LifecycleError::StateConflict {
                        operation: "snapshot",
                        state: state.to_string(),
                    }
                    .into());
                }
            }
        };

        let mut current = inner.lock_job();
        if let Some(job) = current.as_ref().filter(|j| j.in_flight()) {
            return Err(LifecycleError::Conflict(format!(
                "snapshot v{} is still in progress",
                job.version
            ))
            .into());
        }
        // Versions are never reused, so a failed attempt's name cannot match a later image.
        let catalog_version = self.snapshots()?.last().map(|s| s.version).unwrap_or(0);
        let version = catalog_version.max(current.as_ref().map_or(0, |j| j.version)) + 1;
        let job = SnapshotJob {
            version,
            name: format!("sandbox-snapshot-v{version}"),
            sandbox_id: sandbox_id.clone(),
            source_instance_id: instance_id,
            action_id: None,
            state: SnapshotJobState::Starting,
            started_at: now_ts(),
            finished_at: None,
            image_id: None,
            failure_reason: None,
        };
        inner
            .snapshot_job_store
            .insert(SNAPSHOT_JOB_KEY.to_string(), job.clone())?;
        *current = Some(job.clone());
        drop(current);

        inner.launch_snapshot(job.clone());
        info!(sandbox_id = %sandbox_id, version, "snapshot started");
        Ok(job)
    }

    /// The latest snapshot request, finished or not.
    pub fn snapshot_job(&self) -> Option<SnapshotJob> {
        self.inner.lock_job().clone()
    }

    /// Snapshot catalog, oldest first.
    pub fn snapshots(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots = self.inner.snapshot_store.values()?;
        snapshots.sort_by_key(|s| s.version);
        Ok(snapshots)
    }

    /// Resume work interrupted by a restart.
    pub async fn recover(&self) -> Result<()> {
        let inner = &self.inner;
        inner.resume_snapshot();
        let (sandbox_id, state, instance_id, snapshot_id) = {
            let slot = inner.lock();
            match &slot.record.sandbox {
                None => return Ok(()),
                Some(s) => (s.id.clone(), s.state, s.instance_id.clone(), s.snapshot_id.clone()),
            }
        };

        match state {
            SandboxState::Provisioning | SandboxState::PolicyPending => {
                info!(sandbox_id = %sandbox_id, state = %state, "resuming provisioning");
                let mut slot = inner.lock();
                let adopt_first = instance_id.is_none();
                inner.launch_provision(
                    &mut slot,
                    ProvisionJob {
                        sandbox_id,
                        snapshot_id,
                        instance_id,
                        adopt_first,
                    },
                );
            }
            SandboxState::Destroying => {
                info!(sandbox_id = %sandbox_id, "resuming destroy");
                let mut slot = inner.lock();
                inner.launch_destroy(&mut slot, sandbox_id, instance_id);
            }
            SandboxState::Running => {
                let Some(iid) = instance_id else {
                    return Ok(());
                };
                let status = with_timeout(
                    &inner.config.provider_retry,
                    "poll_status",
                    inner.provider.poll_status(&iid),
                )
                .await;
                match status {
                    Err(ProviderError::NotFound(_)) => {
                        warn!(sandbox_id = %sandbox_id, instance_id = %iid, "running instance vanished, clearing slot");
                        inner.clear(&sandbox_id);
                    }
                    Ok(InstanceStatus::Failed { reason }) => {
                        inner.commit(&sandbox_id, &[SandboxState::Running], |s| {
                            s.state = SandboxState::Failed;
                            s.failure_reason = Some(reason);
                        });
                    }
                    Ok(_) => debug!(sandbox_id = %sandbox_id, "running sandbox confirmed"),
                    Err(err) => warn!(sandbox_id = %sandbox_id, "could not confirm running sandbox: {err}"),
                }
            }
            SandboxState::Absent | SandboxState::Failed => {}
        }
        Ok(())
    }

    /// Destroy orphaned instances and tagged instances no record accounts for.
    /// Returns how many instances were destroyed.
    pub async fn reap(&self) -> Result<usize> {
        let inner = &self.inner;
        let mut reaped = 0;

        let orphans = inner.lock().record.orphans.clone();
        for id in orphans {
            let result = with_timeout(
                &inner.config.provider_retry,
                "destroy_instance",
                inner.provider.destroy_instance(&id),
            )
            .await;
            match result {
                Ok(()) | Err(ProviderError::NotFound(_)) => {
                    let mut slot = inner.lock();
                    slot.record.orphans.retain(|o| o != &id);
                    inner.save(&slot.record);
                    metrics().record_reaped();
                    reaped += 1;
                    info!(instance_id = %id, "orphaned instance destroyed");
                }
                Err(err) => warn!(instance_id = %id, "orphan destroy failed: {err}"),
            }
        }

        if !inner.slot_is_stable() {
            return Ok(reaped);
        }

        let instances = with_timeout(
            &inner.config.provider_retry,
            "list_instances",
            inner.provider.list_instances(),
        )
        .await
        .map_err(LifecycleError::from)?;
        for instance in instances {
            if !inner.is_untracked(&instance.id, &instance.name) {
                continue;
            }
            match with_timeout(
                &inner.config.provider_retry,
                "destroy_instance",
                inner.provider.destroy_instance(&instance.id),
            )
            .await
            {
                Ok(()) | Err(ProviderError::NotFound(_)) => {
                    metrics().record_reaped();
                    reaped += 1;
                    warn!(instance_id = %instance.id, name = %instance.name, "untracked instance destroyed");
                }
                Err(err) => {
                    warn!(instance_id = %instance.id, "untracked instance destroy failed: {err}");
                }
            }
        }
        Ok(reaped)
    }
}

// ---------------------------------------------------------------------------
// Slot bookkeeping
// ---------------------------------------------------------------------------

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, record: &SlotRecord) -> Result<()> {
        self.slot_store.insert(SLOT_KEY.to_string(), record.clone())
    }

    fn publish(&self, record: &SlotRecord) {
        self.events.send_replace(record.sandbox.clone());
    }

    /// Persist and publish. A failed write is logged; memory stays authoritative
    /// and the next commit writes the full record again.
    fn save(&self, record: &SlotRecord) {
        if let Err(err) = self.persist(record) {
            error!("failed to persist sandbox slot: {err}");
        }
        self.publish(record);
    }

    fn transition(&self, slot: &mut Slot, to: SandboxState) {
        if let Some(sandbox) = slot.record.sandbox.as_mut() {
            if sandbox.state != to {
                debug!(sandbox_id = %sandbox.id, from = %sandbox.state, to = %to, "sandbox transition");
                sandbox.state = to;
                sandbox.last_transition_at = now_ts();
                sandbox.attempts = 0;
            }
            if to != SandboxState::Failed {
                sandbox.failure_reason = None;
            }
        }
        self.save(&slot.record);
    }

    /// Apply `f` if the slot still holds `sandbox_id` in one of `expected`.
    fn commit<F>(&self, sandbox_id: &str, expected: &[SandboxState], f: F) -> Option<Sandbox>
    where
        F: FnOnce(&mut Sandbox),
    {
        let mut slot = self.lock();
        let sandbox = slot.record.sandbox.as_mut()?;
        if sandbox.id != sandbox_id || !expected.contains(&sandbox.state) {
            return None;
        }
        let before = sandbox.state;
        f(sandbox);
        if sandbox.state != SandboxState::Failed {
            sandbox.failure_reason = None;
        }
        if sandbox.state != before {
            sandbox.last_transition_at = now_ts();
            info!(sandbox_id = %sandbox.id, from = %before, to = %sandbox.state, "sandbox transition");
        }
        let view = sandbox.clone();
        self.save(&slot.record);
        Some(view)
    }

    fn set_attempts(&self, sandbox_id: &str, attempt: u32) {
        let mut slot = self.lock();
        if let Some(sandbox) = slot.record.sandbox.as_mut() {
            if sandbox.id == sandbox_id {
                sandbox.attempts = attempt;
                self.publish(&slot.record);
            }
        }
    }

    fn state_of(&self, sandbox_id: &str) -> SandboxState {
        self.lock()
            .record
            .sandbox
            .as_ref()
            .filter(|s| s.id == sandbox_id)
            .map(|s| s.state)
            .unwrap_or(SandboxState::Absent)
    }

    fn instance_of(&self, sandbox_id: &str) -> Option<String> {
        self.lock()
            .record
            .sandbox
            .as_ref()
            .filter(|s| s.id == sandbox_id)
            .and_then(|s| s.instance_id.clone())
    }

    fn add_orphan(&self, instance_id: String) {
        let mut slot = self.lock();
        if !slot.record.orphans.contains(&instance_id) {
            slot.record.orphans.push(instance_id);
        }
        self.save(&slot.record);
    }

    /// Drop the record: the sandbox is `Absent` again.
    fn clear(&self, sandbox_id: &str) {
        let mut slot = self.lock();
        if slot.record.sandbox.as_ref().is_some_and(|s| s.id == sandbox_id) {
            slot.record.sandbox = None;
            self.save(&slot.record);
            info!(sandbox_id, "sandbox absent");
        }
        drop(slot);
        if let Err(err) = self.network_store.remove(DESIRED_KEY) {
            warn!(sandbox_id, "failed to discard desired network policy: {err}");
        }
    }

    /// Release the slot's task handle unless a newer task replaced it.
    fn finish_task(&self, generation: u64) {
        let mut slot = self.lock();
        if slot.task.as_ref().is_some_and(|t| t.generation == generation) {
            slot.task = None;
        }
    }

    /// No background work is running and the slot is in a resting state.
    fn slot_is_stable(&self) -> bool {
        let slot = self.lock();
        slot.task.is_none()
            && slot.record.sandbox.as_ref().is_none_or(|s| {
                matches!(s.state, SandboxState::Running | SandboxState::Failed)
            })
    }

    fn is_untracked(&self, instance_id: &str, name: &str) -> bool {
        let slot = self.lock();
        if slot.task.is_some() || slot.record.orphans.iter().any(|o| o == instance_id) {
            return false;
        }
        match &slot.record.sandbox {
            None => true,
            Some(s) => {
                matches!(s.state, SandboxState::Running | SandboxState::Failed)
                    && s.instance_id.as_deref() != Some(instance_id)
                    && s.id != name
            }
        }
    }

    fn lock_job(&self) -> MutexGuard<'_, Option<SnapshotJob>> {
        self.snapshot_job.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn store_job(&self, job: &SnapshotJob) {
        let mut current = self.lock_job();
        if let Err(err) = self
            .snapshot_job_store
            .insert(SNAPSHOT_JOB_KEY.to_string(), job.clone())
        {
            error!(version = job.version, "failed to persist snapshot job: {err}");
        }
        *current = Some(job.clone());
    }

    fn launch_snapshot(self: &Arc<Self>, job: SnapshotJob) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_snapshot(job).await });
    }

    /// Pick up a snapshot that was in flight when the process stopped.
    fn resume_snapshot(self: &Arc<Self>) {
        let Some(job) = self.lock_job().clone().filter(SnapshotJob::in_flight) else {
            return;
        };
        if job.action_id.is_some() {
            info!(sandbox_id = %job.sandbox_id, version = job.version, "resuming snapshot wait");
            self.launch_snapshot(job);
        } else {
            // Re-issuing could start a second snapshot if the first request landed.
            self.fail_snapshot(job, "interrupted before the snapshot action was accepted".into());
        }
    }

    fn launch_provision(self: &Arc<Self>, slot: &mut Slot, job: ProvisionJob) {
        let (cancel, cancel_rx) = watch::channel(false);
        let generation = slot.install_task(&job.sandbox_id, cancel);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            Arc::clone(&inner).run_provision(job, cancel_rx).await;
            inner.finish_task(generation);
        });
    }

    fn launch_destroy(self: &Arc<Self>, slot: &mut Slot, sandbox_id: String, instance_id: Option<String>) {
        let (cancel, _) = watch::channel(false);
        let generation = slot.install_task(&sandbox_id, cancel);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.destroy(&sandbox_id, instance_id).await;
            inner.finish_task(generation);
        });
    }

    // -----------------------------------------------------------------------
    // Background work
    // -----------------------------------------------------------------------

    async fn run_provision(self: Arc<Self>, job: ProvisionJob, mut cancel: watch::Receiver<bool>) {
        let sandbox_id = job.sandbox_id.clone();
        match self.provision(&job, &mut cancel).await {
            ProvisionOutcome::Running => {
                info!(sandbox_id = %sandbox_id, "sandbox running");
            }
            ProvisionOutcome::Cancelled { instance_id } => {
                let instance_id = instance_id.or_else(|| self.instance_of(&sandbox_id));
                self.destroy(&sandbox_id, instance_id).await;
            }
            ProvisionOutcome::Failed { reason } => {
                let state = self.state_of(&sandbox_id);
                let attempts = self
                    .lock()
                    .record
                    .sandbox
                    .as_ref()
                    .map(|s| s.attempts)
                    .unwrap_or(0);
                error!(sandbox_id = %sandbox_id, state = %state, attempt = attempts, "provisioning failed: {reason}");
                metrics().record_provision_failure();
                let failed = self.commit(
                    &sandbox_id,
                    &[SandboxState::Provisioning, SandboxState::PolicyPending],
                    |s| {
                        s.state = SandboxState::Failed;
                        s.failure_reason = Some(reason);
                    },
                );
                if failed.is_none() && self.state_of(&sandbox_id) == SandboxState::Destroying {
                    let instance_id = self.instance_of(&sandbox_id);
                    self.destroy(&sandbox_id, instance_id).await;
                }
            }
        }
    }

    async fn create_or_adopt(
        &self,
        request: &CreateInstanceRequest,
        attempt: u32,
        adopt_first: bool,
    ) -> std::result::Result<String, ProviderError> {
        self.set_attempts(&request.name, attempt);
        if attempt > 1 || adopt_first {
            let existing = self.provider.list_instances().await?;
            if let Some(found) = existing.into_iter().find(|i| i.name == request.name) {
                info!(sandbox_id = %request.name, instance_id = %found.id, attempt, "adopted existing instance");
                return Ok(found.id);
            }
        }
        self.provider.create_instance(request).await
    }

    /// Retrying create loop. Unlike `call_with_retry` it stops between attempts
    /// once cancelled; an attempt already in flight is awaited so its instance
    /// id is not lost. `Ok(None)` means cancelled before anything was created.
    async fn create(
        &self,
        job: &ProvisionJob,
        cancel: &mut watch::Receiver<bool>,
    ) -> std::result::Result<Option<String>, ProviderError> {
        let policy = &self.config.provider_retry;
        let request = CreateInstanceRequest {
            name: job.sandbox_id.clone(),
            snapshot_id: job.snapshot_id.clone(),
        };
        let max = policy.max_attempts();
        let mut attempt = 1;
        loop {
            let result = with_timeout(
                policy,
                "create_instance",
                self.create_or_adopt(&request, attempt, job.adopt_first),
            )
            .await;
            match result {
                Ok(id) => return Ok(Some(id)),
                Err(_) if is_cancelled(cancel) => return Ok(None),
                Err(err) if attempt >= max => {
                    warn!(sandbox_id = %job.sandbox_id, attempt, "create retry budget exhausted: {err}");
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        sandbox_id = %job.sandbox_id,
                        state = %SandboxState::Provisioning,
                        attempt,
                        "create failed, retrying: {err}"
                    );
                    if !sleep_or_cancel(policy.backoff(attempt), cancel).await {
                        return Ok(None);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Record the provider id. If the record is gone the id becomes an orphan.
    fn record_instance(&self, sandbox_id: &str, instance_id: &str) -> bool {
        let recorded = self
            .commit(sandbox_id, ANY_STATE, |s| {
                s.instance_id = Some(instance_id.to_string());
            })
            .is_some();
        if !recorded {
            self.add_orphan(instance_id.to_string());
        }
        recorded
    }

    async fn provision(&self, job: &ProvisionJob, cancel: &mut watch::Receiver<bool>) -> ProvisionOutcome {
        let sandbox_id = job.sandbox_id.as_str();

        // Create, or adopt an instance whose create response was lost.
        let instance_id = match &job.instance_id {
            Some(id) => id.clone(),
            None => match self.create(job, cancel).await {
                Ok(Some(id)) => {
                    if !self.record_instance(sandbox_id, &id) {
                        return ProvisionOutcome::Cancelled { instance_id: None };
                    }
                    id
                }
                Ok(None) => return ProvisionOutcome::Cancelled { instance_id: None },
                Err(err) => {
                    return ProvisionOutcome::Failed {
                        reason: format!("create instance: {}", LifecycleError::from(err)),
                    };
                }
            },
        };
        if is_cancelled(cancel) {
            return ProvisionOutcome::Cancelled {
                instance_id: Some(instance_id),
            };
        }

        // Wait for the provider to report the instance active.
        let poll = &self.config.status_poll;
        let mut attempt = 0u32;
        let private_ip = loop {
            attempt += 1;
            self.set_attempts(sandbox_id, attempt);
            match with_timeout(poll, "poll_status", self.provider.poll_status(&instance_id)).await {
                Ok(InstanceStatus::Active { private_ip }) => break private_ip,
                Ok(InstanceStatus::Failed { reason }) => {
                    return ProvisionOutcome::Failed {
                        reason: format!("instance {instance_id} failed: {reason}"),
                    };
                }
                Ok(InstanceStatus::Pending) => {
                    debug!(sandbox_id, instance_id = %instance_id, attempt, "instance pending");
                }
                Err(err) => {
                    warn!(sandbox_id, state = %SandboxState::Provisioning, attempt, "status poll failed: {err}");
                }
            }
            if attempt >= poll.max_attempts() {
                return ProvisionOutcome::Failed {
                    reason: format!("instance {instance_id} not active after {attempt} status polls"),
                };
            }
            if !sleep_or_cancel(poll.backoff(attempt), cancel).await {
                return ProvisionOutcome::Cancelled {
                    instance_id: Some(instance_id),
                };
            }
        };

        // Readiness gate: Running is only committed together with an applied policy.
        let pending = self.commit(
            sandbox_id,
            &[SandboxState::Provisioning, SandboxState::PolicyPending],
            |s| {
                s.state = SandboxState::PolicyPending;
                s.private_ip = private_ip.clone();
                s.attempts = 0;
            },
        );
        if pending.is_none() {
            return ProvisionOutcome::Cancelled {
                instance_id: Some(instance_id),
            };
        }

        let target = EnforcementTarget {
            sandbox_id: sandbox_id.to_string(),
            address: private_ip,
        };
        let template = self.engine.default_template();
        let max = self.config.policy_max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max {
            if is_cancelled(cancel) {
                return ProvisionOutcome::Cancelled {
                    instance_id: Some(instance_id),
                };
            }
            self.set_attempts(sandbox_id, attempt);
            match self.engine.apply(&target, &template).await {
                Ok(applied) => {
                    let running = self.commit(sandbox_id, &[SandboxState::PolicyPending], |s| {
                        s.state = SandboxState::Running;
                        s.applied_policy = Some(applied);
                        s.attempts = 0;
                    });
                    return match running {
                        Some(_) => ProvisionOutcome::Running,
                        None => ProvisionOutcome::Cancelled {
                            instance_id: Some(instance_id),
                        },
                    };
                }
                Err(err @ PolicyError::Malformed(_)) => {
                    return ProvisionOutcome::Failed {
                        reason: format!("default network policy rejected: {err}"),
                    };
                }
                Err(err) => {
                    warn!(sandbox_id, state = %SandboxState::PolicyPending, attempt, "default network policy not applied: {err}");
                    last_error = err.to_string();
                    if attempt < max
                        && !sleep_or_cancel(self.config.provider_retry.backoff(attempt), cancel).await
                    {
                        return ProvisionOutcome::Cancelled {
                            instance_id: Some(instance_id),
                        };
                    }
                }
            }
        }
        ProvisionOutcome::Failed {
            reason: format!("default network policy not applied after {max} attempts: {last_error}"),
        }
    }

    async fn run_snapshot(self: Arc<Self>, mut job: SnapshotJob) {
        let action_id = match job.action_id.clone() {
            Some(id) => id,
            None => {
                // Single attempt: a start that timed out may still have created a snapshot.
                let started = with_timeout(
                    &self.config.provider_retry,
                    "start_snapshot",
                    self.provider.start_snapshot(&job.source_instance_id, &job.name),
                )
                .await;
                match started {
                    Ok(id) => {
                        job.action_id = Some(id.clone());
                        job.state = SnapshotJobState::InProgress;
                        self.store_job(&job);
                        id
                    }
                    Err(err) => {
                        self.fail_snapshot(job, format!("snapshot not started: {err}"));
                        return;
                    }
                }
            }
        };

        let poll = &self.config.snapshot_poll;
        let max = poll.max_attempts();
        for attempt in 1..=max {
            let progress = with_timeout(
                &self.config.provider_retry,
                "snapshot_progress",
                self.provider
                    .snapshot_progress(&job.source_instance_id, &action_id, &job.name),
            )
            .await;
            match progress {
                Ok(SnapshotProgress::Completed { image_id }) => {
                    self.complete_snapshot(job, image_id);
                    return;
                }
                Ok(SnapshotProgress::Failed { reason }) => {
                    self.fail_snapshot(job, reason);
                    return;
                }
                Err(ProviderError::NotFound(msg)) => {
                    self.fail_snapshot(job, format!("snapshot action vanished: {msg}"));
                    return;
                }
                Ok(SnapshotProgress::Pending) => {
                    debug!(version = job.version, action_id = %action_id, attempt, "snapshot pending");
                }
                Err(err) => {
                    warn!(
                        sandbox_id = %job.sandbox_id,
                        version = job.version,
                        attempt,
                        "snapshot progress poll failed: {err}"
                    );
                }
            }
            if attempt < max {
                tokio::time::sleep(poll.backoff(attempt)).await;
            }
        }
        self.fail_snapshot(
            job,
            format!("snapshot action {action_id} not completed after {max} polls"),
        );
    }

    fn complete_snapshot(&self, mut job: SnapshotJob, image_id: String) {
        let snapshot = Snapshot {
            image_id: image_id.clone(),
            version: job.version,
            created_at: now_ts(),
            source_instance_id: job.source_instance_id.clone(),
        };
        if let Err(err) = self
            .snapshot_store
            .insert(format!("v{:010}", job.version), snapshot)
        {
            self.fail_snapshot(job, format!("image {image_id} created but not cataloged: {err}"));
            return;
        }
        job.state = SnapshotJobState::Completed;
        job.image_id = Some(image_id);
        job.finished_at = Some(now_ts());
        self.store_job(&job);
        metrics().record_snapshot();
        info!(
            sandbox_id = %job.sandbox_id,
            version = job.version,
            image_id = job.image_id.as_deref().unwrap_or_default(),
            "snapshot recorded"
        );
    }

    fn fail_snapshot(&self, mut job: SnapshotJob, reason: String) {
        error!(sandbox_id = %job.sandbox_id, version = job.version, "snapshot failed: {reason}");
        job.state = SnapshotJobState::Failed;
        job.failure_reason = Some(reason);
        job.finished_at = Some(now_ts());
        self.store_job(&job);
    }

    /// Destroy `instance_id` and clear the record. The record is never dropped
    /// while the instance may still exist: exhausted retries leave it `Failed`
    /// with the id kept, an untracked id goes onto the orphan list.
    async fn destroy(&self, sandbox_id: &str, instance_id: Option<String>) {
        let tracked = self
            .commit(sandbox_id, ANY_STATE, |s| s.state = SandboxState::Destroying)
            .is_some();

        if let Some(id) = instance_id {
            let result = call_with_retry(&self.config.provider_retry, "destroy_instance", |attempt| {
                self.set_attempts(sandbox_id, attempt);
                if attempt > 1 {
                    metrics().record_destroy_retry();
                }
                self.provider.destroy_instance(&id)
            })
            .await;

            match result {
                Ok(()) | Err(ProviderError::NotFound(_)) => {
                    info!(sandbox_id, instance_id = %id, "instance destroyed");
                }
                Err(err) => {
                    let attempts = self.config.provider_retry.max_attempts();
                    error!(
                        sandbox_id,
                        state = %SandboxState::Destroying,
                        attempt = attempts,
                        instance_id = %id,
                        "instance destroy failed: {err}"
                    );
                    if tracked {
                        let reason = format!("destroy of instance {id} failed: {err}");
                        self.commit(sandbox_id, &[SandboxState::Destroying], |s| {
                            s.state = SandboxState::Failed;
                            s.failure_reason = Some(reason);
                        });
                    } else {
                        self.add_orphan(id);
                    }
                    return;
                }
            }
        }

        if tracked {
            self.clear(sandbox_id);
        }
    }
}
