//! Sliding-window rate limiter for the `/auth` routes.
//!
//! One window per client IP. Stale IPs are dropped periodically so the map
//! cannot grow without bound. The TOTP lockout is the real brute-force
//! defence; this limiter only keeps a single client from hammering the
//! credential store.
//!
//! ```ignore
//! let limiter = Arc::new(RateLimiter::new(RateLimitConfig::AUTH));
//! router.layer(middleware::from_fn_with_state(limiter, rate_limit::rate_limit))
//! ```

use axum::{
    Json,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::metrics::metrics;

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Maximum requests allowed in the window.
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    /// 10 requests per minute per IP.
    pub const AUTH: RateLimitConfig = RateLimitConfig::new(10, 60);

    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(window_secs),
        }
    }
}

struct Window {
    hits: Vec<Instant>,
}

impl Window {
    /// Record a hit if allowed, otherwise return how long until the oldest hit expires.
    fn hit(&mut self, now: Instant, config: &RateLimitConfig) -> Result<(), Duration> {
        self.hits.retain(|t| now.duration_since(*t) < config.window);
        if (self.hits.len() as u32) < config.max_requests {
            self.hits.push(now);
            return Ok(());
        }
        let oldest = self.hits.first().copied().unwrap_or(now);
        Err(config.window.saturating_sub(now.duration_since(oldest)))
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<IpAddr, Window>>,
    last_gc: Mutex<Instant>,
}

const GC_INTERVAL: Duration = Duration::from_secs(300);

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            last_gc: Mutex::new(Instant::now()),
        }
    }

    /// Record a request from `ip`. `Err` carries the retry-after delay.
    pub fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> Result<(), Duration> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        {
            let mut last_gc = self.last_gc.lock().unwrap_or_else(|e| e.into_inner());
            if now.duration_since(*last_gc) >= GC_INTERVAL {
                let window = self.config.window;
                windows.retain(|_, w| w.hits.last().is_some_and(|t| now.duration_since(*t) < window));
                *last_gc = now;
            }
        }
        windows
            .entry(ip)
            .or_insert_with(|| Window { hits: Vec::new() })
            .hit(now, &self.config)
    }

    pub fn tracked_ips(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Peer address of the connection. Client-supplied headers such as
/// `x-forwarded-for` are ignored since they cannot be trusted for keying.
fn client_ip(req: &Request) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
}

/// Middleware rejecting over-limit clients with 429 and `retry-after`.
/// Requests without a known client IP pass through.
pub async fn rate_limit(State(limiter): State<Arc<RateLimiter>>, request: Request, next: Next) -> Response {
    if let Some(ip) = client_ip(&request) {
        if let Err(wait) = limiter.check(ip) {
            metrics().record_rate_limited();
            let secs = wait.as_secs().max(1).to_string();
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", secs)],
                Json(serde_json::json!({ "error": "rate limit exceeded" })),
            )
                .into_response();
        }
    }
    next.run(request).await
}
