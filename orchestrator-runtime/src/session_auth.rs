//! TOTP enrollment, login sessions and lockout.
//!
//! Flow:
//! 1. Operator enrolls once: `POST /auth/enroll` returns the shared secret and
//!    an `otpauth://` URI for an authenticator app.
//! 2. Operator exchanges a current code for a session: `POST /auth/verify`.
//! 3. Every control call carries `Authorization: Bearer <token>`.
//!
//! Session tokens are only ever stored as SHA-256 digests.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::Json;
use axum::extract::FromRef;
use axum::http::StatusCode;
use tracing::{info, warn};

use crate::config::AuthConfig;
use crate::error::{AuthError, OrchestratorError, Result};
use crate::metrics::metrics;
use crate::store::PersistentStore;
use crate::totp;
use crate::util::{generate_token, now_ts, sha256_hex};

const CREDENTIAL_KEY: &str = "totp";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Process-wide enrollment secret and lockout counters.
#[derive(Clone, Serialize, Deserialize)]
pub struct TotpCredential {
    /// Base32-encoded shared secret.
    pub secret: String,
    pub failed_attempts: u32,
    pub locked_until: Option<u64>,
    pub enrolled_at: u64,
}

impl fmt::Debug for TotpCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TotpCredential")
            .field("secret", &"<redacted>")
            .field("failed_attempts", &self.failed_attempts)
            .field("locked_until", &self.locked_until)
            .field("enrolled_at", &self.enrolled_at)
            .finish()
    }
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub secret: String,
    pub enrollment_uri: String,
}

impl fmt::Debug for Enrollment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enrollment").finish_non_exhaustive()
    }
}

/// A logged-in control session as handed back to the client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub token: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SessionRecord {
    token_hash: String,
    issued_at: u64,
    expires_at: u64,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct AuthSessionManager {
    config: AuthConfig,
    credential: Mutex<Option<TotpCredential>>,
    credential_store: PersistentStore<TotpCredential>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    session_store: PersistentStore<SessionRecord>,
}

impl AuthSessionManager {
    /// Open (or create) the credential and session stores under `state_dir`.
    pub fn open(state_dir: &Path, config: AuthConfig) -> Result<Self> {
        let credential_store = PersistentStore::open_in(state_dir, "credential.json")?;
        let session_store: PersistentStore<SessionRecord> =
            PersistentStore::open_in(state_dir, "sessions.json")?;

        let credential = credential_store.get(CREDENTIAL_KEY)?;
        let sessions = session_store
            .values()?
            .into_iter()
            .map(|s| (s.token_hash.clone(), s))
            .collect();

        Ok(Self {
            config,
            credential: Mutex::new(credential),
            credential_store,
            sessions: Mutex::new(sessions),
            session_store,
        })
    }

    pub fn is_enrolled(&self) -> bool {
        self.credential
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Generate and store a new shared secret.
    ///
    /// Fails with `AlreadyEnrolled` when a credential exists and `force` is
    /// false. A forced reset revokes every outstanding session.
    pub fn enroll(&self, force: bool) -> Result<Enrollment> {
        let mut credential = self.credential.lock().unwrap_or_else(|e| e.into_inner());
        if credential.is_some() && !force {
            return Err(AuthError::AlreadyEnrolled.into());
        }

        let secret = totp::encode_secret(&totp::generate_secret());
        let record = TotpCredential {
            secret: secret.clone(),
            failed_attempts: 0,
            locked_until: None,
            enrolled_at: now_ts(),
        };
        self.credential_store
            .insert(CREDENTIAL_KEY.to_string(), record.clone())?;
        let reset = credential.replace(record).is_some();
        drop(credential);

        if reset {
            self.revoke_all()?;
            info!("TOTP credential re-enrolled, all sessions revoked");
        } else {
            info!("TOTP credential enrolled");
        }

        Ok(Enrollment {
            enrollment_uri: totp::provisioning_uri(&secret, &self.config.account, &self.config.issuer),
            secret,
        })
    }

    /// Check `code` at `timestamp` and issue a session on success.
    pub fn verify(&self, code: &str, timestamp: u64) -> Result<AuthSession> {
        let mut guard = self.credential.lock().unwrap_or_else(|e| e.into_inner());
        let credential = guard.as_mut().ok_or(AuthError::NotEnrolled)?;

        if let Some(until) = credential.locked_until {
            if timestamp < until {
                return Err(AuthError::LockedOut {
                    retry_after_secs: until - timestamp,
                }
                .into());
            }
        }

        let secret = totp::decode_secret(&credential.secret).ok_or_else(|| {
            OrchestratorError::Storage("stored TOTP secret is not valid base32".into())
        })?;

        if totp::verify(&secret, code, timestamp).is_some() {
            credential.failed_attempts = 0;
            credential.locked_until = None;
            let snapshot = credential.clone();
            drop(guard);
            self.credential_store
                .insert(CREDENTIAL_KEY.to_string(), snapshot)?;
            return self.issue_session(timestamp);
        }

        credential.failed_attempts = credential.failed_attempts.saturating_add(1);
        metrics().record_auth_failure();
        if let Some(backoff) = self.lockout_backoff(credential.failed_attempts) {
            credential.locked_until = Some(timestamp + backoff);
            metrics().record_lockout();
            warn!(
                failed_attempts = credential.failed_attempts,
                lockout_secs = backoff,
                "TOTP verification locked"
            );
        } else {
            warn!(
                failed_attempts = credential.failed_attempts,
                "TOTP verification failed"
            );
        }
        let snapshot = credential.clone();
        drop(guard);
        self.credential_store
            .insert(CREDENTIAL_KEY.to_string(), snapshot)?;
        Err(AuthError::InvalidCode.into())
    }

    /// Exponential lockout once `failed_attempts` reaches the threshold.
    fn lockout_backoff(&self, failed_attempts: u32) -> Option<u64> {
        let threshold = self.config.lockout_threshold.max(1);
        if failed_attempts < threshold {
            return None;
        }
        let exp = (failed_attempts - threshold).min(32);
        let backoff = self
            .config
            .lockout_base_secs
            .saturating_mul(1u64 << exp)
            .min(self.config.lockout_max_secs);
        Some(backoff)
    }

    fn issue_session(&self, now: u64) -> Result<AuthSession> {
        let token = generate_token();
        let record = SessionRecord {
            token_hash: sha256_hex(&token),
            issued_at: now,
            expires_at: now + self.config.session_ttl_secs,
        };
        self.session_store
            .insert(record.token_hash.clone(), record.clone())?;
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.token_hash.clone(), record.clone());

        Ok(AuthSession {
            token,
            issued_at: record.issued_at,
            expires_at: record.expires_at,
        })
    }

    /// Look up a bearer token. No side effects.
    pub fn validate(&self, token: &str) -> std::result::Result<AuthSession, AuthError> {
        self.validate_at(token, now_ts())
    }

    pub fn validate_at(&self, token: &str, now: u64) -> std::result::Result<AuthSession, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Unauthenticated);
        }
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get(&sha256_hex(token)) {
            Some(record) if now < record.expires_at => Ok(AuthSession {
                token: token.to_string(),
                issued_at: record.issued_at,
                expires_at: record.expires_at,
            }),
            _ => Err(AuthError::Unauthenticated),
        }
    }

    /// Invalidate a single session. Returns whether it existed.
    pub fn revoke(&self, token: &str) -> Result<bool> {
        let hash = sha256_hex(token);
        let existed = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&hash)
            .is_some();
        self.session_store.remove(&hash)?;
        Ok(existed)
    }

    pub fn revoke_all(&self) -> Result<()> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.session_store.replace(HashMap::new())
    }

    /// Remove expired sessions. Returns how many were dropped.
    pub fn gc_sessions(&self, now: u64) -> Result<usize> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, s| s.expires_at > now);
        let removed = before - sessions.len();
        if removed > 0 {
            self.session_store.replace(sessions.clone())?;
        }
        Ok(removed)
    }

    /// Failed-attempt counter and lock deadline.
    #[cfg(test)]
    fn lockout_state(&self) -> Option<(u32, Option<u64>)> {
        self.credential
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| (c.failed_attempts, c.locked_until))
    }

    /// Current code for the enrolled secret. Lets tests act as the authenticator app.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn current_code(&self, timestamp: u64) -> Option<String> {
        let guard = self.credential.lock().unwrap_or_else(|e| e.into_inner());
        let secret = totp::decode_secret(&guard.as_ref()?.secret)?;
        Some(totp::code_at(&secret, timestamp))
    }
}

/// Extract a Bearer token from an Authorization header value.
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
        .map(|t| t.trim())
}

// ---------------------------------------------------------------------------
// Axum extractor
// ---------------------------------------------------------------------------

/// Axum extractor that validates the `Authorization: Bearer <token>` header
/// against the state's `AuthSessionManager`.
///
/// Usage in handler:
/// ```ignore
/// async fn my_handler(SessionAuth(session): SessionAuth) -> impl IntoResponse { ... }
/// ```
pub struct SessionAuth(pub AuthSession);

impl<S> axum::extract::FromRequestParts<S> for SessionAuth
where
    Arc<AuthSessionManager>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let reject = |msg: &str| {
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": msg })),
            )
        };

        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| reject("Missing Authorization header"))?;

        let token = extract_bearer_token(auth_header)
            .ok_or_else(|| reject("Invalid Authorization header format"))?;

        let manager = Arc::<AuthSessionManager>::from_ref(state);
        let session = manager
            .validate(token)
            .map_err(|e| reject(&e.to_string()))?;

        Ok(SessionAuth(session))
    }
}
