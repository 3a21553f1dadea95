//! `sandbox-orchestrator`: serves the operator API for one cloud sandbox.

use std::net::SocketAddr;
use std::sync::Arc;

use orchestrator_runtime::OrchestratorConfig;
use orchestrator_runtime::enforcer::AgentPolicyEnforcer;
use orchestrator_runtime::lifecycle::SandboxLifecycleController;
use orchestrator_runtime::operator_api::{ApiConfig, AppState, operator_api_router};
use orchestrator_runtime::policy::NetworkPolicyEngine;
use orchestrator_runtime::provider::DigitalOceanClient;
use orchestrator_runtime::rate_limit::RateLimitConfig;
use orchestrator_runtime::reaper;
use orchestrator_runtime::session_auth::AuthSessionManager;
use orchestrator_runtime::store::ensure_state_dir;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Runtime(#[from] orchestrator_runtime::OrchestratorError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    setup_log();

    let config = OrchestratorConfig::load();
    info!(
        state_dir = %config.state_dir.display(),
        bind_addr = %config.bind_addr,
        containers = config.policy.containers.len(),
        "starting sandbox orchestrator"
    );
    if config.digitalocean.api_token.is_empty() {
        return Err(StartupError::Config("DO_API_TOKEN is not set".into()));
    }
    if config.agent.token.is_empty() {
        warn!("SANDBOX_AGENT_TOKEN is not set; the network agent will reject policy calls");
    }
    ensure_state_dir(&config.state_dir)?;

    let auth = Arc::new(AuthSessionManager::open(&config.state_dir, config.auth.clone())?);
    if !auth.is_enrolled() {
        warn!("no TOTP credential enrolled yet; POST /auth/enroll to create one");
    }

    let provider = Arc::new(DigitalOceanClient::new(config.digitalocean.clone()));
    let enforcer = Arc::new(AgentPolicyEnforcer::new(config.agent.clone()));
    let engine = Arc::new(NetworkPolicyEngine::new(enforcer, config.policy.clone()));
    let controller = SandboxLifecycleController::open(
        &config.state_dir,
        config.lifecycle.clone(),
        provider,
        engine,
    )?;

    reaper::reconcile_on_startup(&controller).await;
    let background = reaper::spawn_background_tasks(
        controller.clone(),
        auth.clone(),
        config.reaper_interval,
        config.session_gc_interval,
    );

    let router = operator_api_router(
        AppState { auth, controller },
        ApiConfig {
            request_timeout: config.request_timeout,
            auth_rate_limit: RateLimitConfig::AUTH,
        },
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: config.bind_addr.clone(),
            source,
        })?;
    info!("operator API listening on {}", config.bind_addr);

    let served = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    for task in background {
        task.abort();
    }
    served.map_err(StartupError::Serve)?;
    info!("sandbox orchestrator stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received, draining connections");
}

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};
    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_err()
    {}
}
