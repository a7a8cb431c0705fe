//! Per-identity rate limiting and token quotas.
//!
//! Identity is the most specific of: API-key hash, forwarded-for hop, peer
//! IP. Request counting uses a pruned timestamp window; token charging uses a
//! fixed window that refuses further requests once the quota is spent.

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::debug;

use ubridge_core::config::LimitsConfig;

/// Outcome of a request admission check. Carries everything the HTTP layer
/// needs for the X-RateLimit-* headers.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub ok: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix second when the window resets.
    pub reset_unix: i64,
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct TokenCharge {
    pub ok: bool,
    pub remaining: u64,
}

struct Window {
    /// Request timestamps (unix seconds) within the current window.
    requests: Vec<i64>,
    tokens_used: u64,
    token_window_start: i64,
}

impl Window {
    fn new(now: i64) -> Self {
        Self {
            requests: Vec::new(),
            tokens_used: 0,
            token_window_start: now,
        }
    }

    fn prune(&mut self, now: i64, window_secs: i64) {
        self.requests.retain(|t| now - t < window_secs);
    }

    fn roll_token_window(&mut self, now: i64, token_window_secs: i64) {
        if now - self.token_window_start >= token_window_secs {
            self.tokens_used = 0;
            self.token_window_start = now;
        }
    }
}

pub struct RateLimiter {
    windows: DashMap<String, Window>,
    config: LimitsConfig,
}

impl RateLimiter {
    pub fn new(config: LimitsConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config,
        }
    }

    /// Admission check. Called before any other work; a rejection means no
    /// provider request is issued for this identity.
    pub fn allow_request(&self, identity: &str, now: i64) -> Decision {
        let window_secs = self.config.window_secs as i64;
        let limit = self.config.max_requests;

        // Opportunistic purge when a new identity shows up.
        if !self.windows.contains_key(identity) {
            self.purge(now);
        }

        let mut window = self
            .windows
            .entry(identity.to_string())
            .or_insert_with(|| Window::new(now));
        window.prune(now, window_secs);
        window.roll_token_window(now, self.config.token_window_secs as i64);

        // A spent token quota refuses requests until its window rolls over.
        if window.tokens_used >= self.config.token_quota {
            let reset = window.token_window_start + self.config.token_window_secs as i64;
            debug!(identity, "token quota exhausted");
            return Decision {
                ok: false,
                limit,
                remaining: 0,
                reset_unix: reset,
                retry_after_secs: Some((reset - now).max(1) as u64),
            };
        }

        if window.requests.len() >= limit as usize {
            let oldest = window.requests.first().copied().unwrap_or(now);
            let reset = oldest + window_secs;
            debug!(identity, "request window exhausted");
            return Decision {
                ok: false,
                limit,
                remaining: 0,
                reset_unix: reset,
                retry_after_secs: Some((reset - now).max(1) as u64),
            };
        }

        window.requests.push(now);
        let remaining = limit - window.requests.len() as u32;
        let reset = window.requests.first().copied().unwrap_or(now) + window_secs;
        Decision {
            ok: true,
            limit,
            remaining,
            reset_unix: reset,
            retry_after_secs: None,
        }
    }

    /// Charge completed-turn tokens against the identity's quota.
    pub fn charge_tokens(&self, identity: &str, tokens: u64, now: i64) -> TokenCharge {
        let mut window = self
            .windows
            .entry(identity.to_string())
            .or_insert_with(|| Window::new(now));
        window.roll_token_window(now, self.config.token_window_secs as i64);
        window.tokens_used = window.tokens_used.saturating_add(tokens);
        TokenCharge {
            ok: window.tokens_used <= self.config.token_quota,
            remaining: self.config.token_quota.saturating_sub(window.tokens_used),
        }
    }

    /// Drop identities with no recent requests and a rolled-over token window.
    fn purge(&self, now: i64) {
        let window_secs = self.config.window_secs as i64;
        let token_window_secs = self.config.token_window_secs as i64;
        self.windows.retain(|_, w| {
            let requests_live = w.requests.iter().any(|t| now - t < window_secs);
            let tokens_live = w.tokens_used > 0 && now - w.token_window_start < token_window_secs;
            requests_live || tokens_live
        });
    }

    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }
}

/// Identity for an API-key bearer: a short hash, never the key itself.
pub fn api_key_identity(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("key:{}", &hex::encode(digest)[..16])
}

/// Identity for an unauthenticated caller.
pub fn ip_identity(addr: &str) -> String {
    format!("ip:{addr}")
}
