//! Background maintenance for the control plane.
//!
//! - `reconcile_on_startup()`: resumes interrupted provisioning or destruction
//! - `reaper_tick()`: destroys orphaned and untracked provider instances
//! - `session_gc_tick()`: drops expired session records
//! - `spawn_background_tasks()`: runs the two ticks on their intervals

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::lifecycle::SandboxLifecycleController;
use crate::session_auth::AuthSessionManager;
use crate::util::now_ts;

/// Bring the persisted slot back in line with the provider after a restart.
pub async fn reconcile_on_startup(controller: &SandboxLifecycleController) {
    let before = controller.status().state;
    match controller.recover().await {
        Ok(()) => info!(state = %before, "reconcile: startup recovery complete"),
        Err(err) => error!(state = %before, "reconcile: startup recovery failed: {err}"),
    }
}

/// Destroy instances no sandbox record accounts for.
///
/// Called every `REAPER_INTERVAL_SECS` seconds.
pub async fn reaper_tick(controller: &SandboxLifecycleController) {
    match controller.reap().await {
        Ok(0) => debug!("reaper: nothing to reap"),
        Ok(n) => info!("reaper: destroyed {n} stray instance(s)"),
        Err(err) => error!("reaper: instance sweep failed: {err}"),
    }
}

/// Called every `SESSION_GC_INTERVAL_SECS` seconds.
pub fn session_gc_tick(auth: &AuthSessionManager) {
    match auth.gc_sessions(now_ts()) {
        Ok(0) => {}
        Ok(n) => info!("gc: removed {n} expired session(s)"),
        Err(err) => error!("gc: session cleanup failed: {err}"),
    }
}

/// Spawn the reaper and session GC loops.
pub fn spawn_background_tasks(
    controller: SandboxLifecycleController,
    auth: Arc<AuthSessionManager>,
    reaper_interval: Duration,
    session_gc_interval: Duration,
) -> Vec<JoinHandle<()>> {
    let reaper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(reaper_interval);
        loop {
            interval.tick().await;
            reaper_tick(&controller).await;
        }
    });

    let gc = tokio::spawn(async move {
        let mut interval = tokio::time::interval(session_gc_interval);
        loop {
            interval.tick().await;
            session_gc_tick(&auth);
        }
    });

    vec![reaper, gc]
}
