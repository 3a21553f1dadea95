//! Control-plane runtime for a single TOTP-gated cloud sandbox.
//!
//! This crate provides the session auth, sandbox lifecycle, network policy,
//! provider and HTTP primitives; `orchestrator-bin` wires them into a server.

pub mod config;
pub mod enforcer;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod metrics;
pub mod operator_api;
pub mod policy;
pub mod provider;
pub mod rate_limit;
pub mod reaper;
pub mod retry;
pub mod session_auth;
pub mod store;
pub mod totp;
pub mod util;

pub use config::OrchestratorConfig;
pub use error::{AuthError, LifecycleError, OrchestratorError, PolicyError, ProviderError, Result};
pub use lifecycle::{
    Sandbox, SandboxLifecycleController, SandboxState, SandboxStatus, Snapshot, SnapshotJob,
};
pub use policy::{NetworkPolicy, NetworkPolicyEngine};
pub use session_auth::{AuthSession, AuthSessionManager};
