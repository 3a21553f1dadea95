//! Environment-driven configuration.
//!
//! `OrchestratorConfig::load()` reads every variable once at startup; the
//! per-component structs all have `Default` impls so tests can build them
//! directly without touching the environment.

use once_cell::sync::OnceCell;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_DOMAIN: &str = "localhost";
pub const DEFAULT_DO_API_URL: &str = "https://api.digitalocean.com/v2/";
pub const DEFAULT_AGENT_PORT: u16 = 9999;
/// Tag applied to every instance this control plane creates.
pub const SANDBOX_TAG: &str = "sandbox-instance";

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub issuer: String,
    pub account: String,
    pub session_ttl_secs: u64,
    pub lockout_threshold: u32,
    pub lockout_base_secs: u64,
    pub lockout_max_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: format!("Sandbox@{DEFAULT_DOMAIN}"),
            account: "admin".into(),
            session_ttl_secs: 86_400,
            lockout_threshold: 5,
            lockout_base_secs: 30,
            lockout_max_secs: 3_600,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PolicyConfig {
    /// Logical container slots inside one sandbox.
    pub containers: Vec<String>,
    /// Timeout applied to every individual enforcer call.
    pub enforcement_timeout: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            containers: (1..=4).map(|i| format!("container-{i}")).collect(),
            enforcement_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LifecycleConfig {
    /// Retry budget and per-call timeout for provider calls.
    pub provider_retry: RetryPolicy,
    /// Status poll budget; `max_attempts` polls before provisioning is declared failed.
    pub status_poll: RetryPolicy,
    /// Progress poll budget for a snapshot action. Droplet snapshots take minutes.
    pub snapshot_poll: RetryPolicy,
    /// Attempts at installing the default-deny template during readiness gating.
    pub policy_max_attempts: u32,
    /// Snapshot used by `spawn` when neither the request nor the catalog names one.
    pub default_snapshot_id: Option<String>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            provider_retry: RetryPolicy::default(),
            status_poll: RetryPolicy {
                max_attempts: 30,
                initial_backoff: Duration::from_secs(2),
                max_backoff: Duration::from_secs(30),
                timeout: Duration::from_secs(30),
            },
            snapshot_poll: RetryPolicy {
                max_attempts: 120,
                initial_backoff: Duration::from_secs(5),
                max_backoff: Duration::from_secs(30),
                timeout: Duration::from_secs(30),
            },
            policy_max_attempts: 3,
            default_snapshot_id: None,
        }
    }
}

#[derive(Clone)]
pub struct DigitalOceanConfig {
    pub api_url: String,
    pub api_token: String,
    pub vpc_uuid: String,
    pub region: String,
    pub size: String,
    pub timeout: Duration,
}

impl Default for DigitalOceanConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_DO_API_URL.into(),
            api_token: String::new(),
            vpc_uuid: String::new(),
            region: "nyc1".into(),
            size: "s-2vcpu-2gb".into(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for DigitalOceanConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigitalOceanConfig")
            .field("api_url", &self.api_url)
            .field("api_token", &"<redacted>")
            .field("vpc_uuid", &self.vpc_uuid)
            .field("region", &self.region)
            .field("size", &self.size)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Clone)]
pub struct AgentConfig {
    pub port: u16,
    pub token: String,
    pub timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_AGENT_PORT,
            token: String::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("port", &self.port)
            .field("token", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Runtime configuration loaded once at startup from environment variables.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub state_dir: PathBuf,
    pub bind_addr: String,
    pub request_timeout: Duration,
    pub reaper_interval: Duration,
    pub session_gc_interval: Duration,
    pub auth: AuthConfig,
    pub policy: PolicyConfig,
    pub lifecycle: LifecycleConfig,
    pub digitalocean: DigitalOceanConfig,
    pub agent: AgentConfig,
}

static CONFIG: OnceCell<OrchestratorConfig> = OnceCell::new();

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl OrchestratorConfig {
    /// Load configuration from environment variables. Cached after the first call.
    pub fn load() -> &'static OrchestratorConfig {
        CONFIG.get_or_init(Self::from_env)
    }

    pub fn from_env() -> OrchestratorConfig {
        let domain = env_string("ORCHESTRATOR_DOMAIN").unwrap_or_else(|| DEFAULT_DOMAIN.into());
        let provider_timeout = Duration::from_secs(env_or("PROVIDER_TIMEOUT_SECS", 30));
        let initial_backoff = Duration::from_millis(env_or("PROVIDER_BACKOFF_INITIAL_MS", 2_000));
        let max_backoff = Duration::from_millis(env_or("PROVIDER_BACKOFF_MAX_MS", 30_000));
        let max_status_polls = env_or("STATUS_POLL_MAX", 30u32);

        let containers = env_string("SANDBOX_CONTAINERS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| PolicyConfig::default().containers);

        let defaults = AuthConfig::default();

        OrchestratorConfig {
            state_dir: env_string("ORCHESTRATOR_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("orchestrator-state")),
            bind_addr: env_string("ORCHESTRATOR_BIND_ADDR")
                .unwrap_or_else(|| DEFAULT_BIND_ADDR.into()),
            request_timeout: Duration::from_secs(env_or("REQUEST_TIMEOUT_SECS", 30)),
            reaper_interval: Duration::from_secs(env_or("REAPER_INTERVAL_SECS", 60)),
            session_gc_interval: Duration::from_secs(env_or("SESSION_GC_INTERVAL_SECS", 300)),
            auth: AuthConfig {
                issuer: format!("Sandbox@{domain}"),
                account: defaults.account,
                session_ttl_secs: env_or("SESSION_TTL_SECS", defaults.session_ttl_secs),
                lockout_threshold: env_or("TOTP_LOCKOUT_THRESHOLD", defaults.lockout_threshold),
                lockout_base_secs: env_or("TOTP_LOCKOUT_BASE_SECS", defaults.lockout_base_secs),
                lockout_max_secs: env_or("TOTP_LOCKOUT_MAX_SECS", defaults.lockout_max_secs),
            },
            policy: PolicyConfig {
                containers,
                enforcement_timeout: Duration::from_secs(env_or("POLICY_TIMEOUT_SECS", 30)),
            },
            lifecycle: LifecycleConfig {
                provider_retry: RetryPolicy {
                    max_attempts: env_or("PROVIDER_MAX_ATTEMPTS", 5),
                    initial_backoff,
                    max_backoff,
                    timeout: provider_timeout,
                },
                status_poll: RetryPolicy {
                    max_attempts: max_status_polls,
                    initial_backoff,
                    max_backoff,
                    timeout: provider_timeout,
                },
                snapshot_poll: RetryPolicy {
                    max_attempts: env_or("SNAPSHOT_POLL_MAX", 120u32),
                    initial_backoff: Duration::from_secs(5),
                    max_backoff: max_backoff.max(Duration::from_secs(5)),
                    timeout: provider_timeout,
                },
                policy_max_attempts: env_or("POLICY_MAX_ATTEMPTS", 3),
                default_snapshot_id: env_string("SANDBOX_SNAPSHOT_ID"),
            },
            digitalocean: DigitalOceanConfig {
                api_url: env_string("DO_API_URL").unwrap_or_else(|| DEFAULT_DO_API_URL.into()),
                api_token: env_string("DO_API_TOKEN").unwrap_or_default(),
                vpc_uuid: env_string("DO_VPC_UUID").unwrap_or_default(),
                region: env_string("SANDBOX_REGION").unwrap_or_else(|| "nyc1".into()),
                size: env_string("SANDBOX_SIZE").unwrap_or_else(|| "s-2vcpu-2gb".into()),
                timeout: provider_timeout,
            },
            agent: AgentConfig {
                port: env_or("SANDBOX_AGENT_PORT", DEFAULT_AGENT_PORT),
                token: env_string("SANDBOX_AGENT_TOKEN").unwrap_or_default(),
                timeout: Duration::from_secs(env_or("POLICY_TIMEOUT_SECS", 30)),
            },
        }
    }
}
