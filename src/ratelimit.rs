//! Fixed-window request limiter protecting the expensive downstream AI and
//! scraping calls.
//!
//! The window is fixed, not sliding: bursts of up to twice the nominal rate
//! at window boundaries are an accepted tradeoff. State is in-memory only; a
//! process restart resets all counters.

use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Sentinel identifier when no forwarding header is present.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Window configuration. Two profiles ship with the service: a strict one
/// for job submission and a lenient one for status polling.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitProfile {
    pub max_requests: u32,
    pub window_ms: i64,
}

impl RateLimitProfile {
    /// Job submission: 5 requests per hour.
    pub fn strict() -> Self {
        RateLimitProfile {
            max_requests: 5,
            window_ms: 3_600_000,
        }
    }

    /// Status polling: 60 requests per minute.
    pub fn lenient() -> Self {
        RateLimitProfile {
            max_requests: 60,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug)]
struct RateLimitEntry {
    count: u32,
    reset_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct RateLimiter {
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, identifier: &str, profile: RateLimitProfile) -> RateLimitDecision {
        self.check_at(identifier, profile, Utc::now())
    }

    /// Deterministic core, also the test seam. On the first request from an
    /// identifier or once the window has expired the count resets to 1 and a
    /// new window opens; a denied request never resets the window early.
    pub fn check_at(
        &self,
        identifier: &str,
        profile: RateLimitProfile,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let mut entries = self.entries.lock().expect("Couldn't lock rate limit map");

        let entry = entries
            .entry(identifier.to_string())
            .or_insert_with(|| RateLimitEntry {
                count: 0,
                reset_at: now + Duration::milliseconds(profile.window_ms),
            });

        if now >= entry.reset_at {
            entry.count = 1;
            entry.reset_at = now + Duration::milliseconds(profile.window_ms);
        } else {
            entry.count += 1;
        }

        RateLimitDecision {
            allowed: entry.count <= profile.max_requests,
            remaining: profile.max_requests.saturating_sub(entry.count),
            reset_at: entry.reset_at,
        }
    }

    /// Drops expired entries so the map stays bounded. Expiry is otherwise
    /// lazy; this only needs to run occasionally.
    pub fn cleanup(&self) {
        let now = Utc::now();
        let mut entries = self.entries.lock().expect("Couldn't lock rate limit map");
        entries.retain(|_, entry| entry.reset_at > now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Derives the client identifier from forwarded-IP headers: the first
/// `x-forwarded-for` entry, then `x-real-ip`, falling back to the sentinel.
pub fn client_identifier(headers: &HeaderMap) -> String {
    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return ip.to_string();
    }

    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return ip.to_string();
    }

    UNKNOWN_CLIENT.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> RateLimitProfile {
        RateLimitProfile {
            max_requests: 5,
            window_ms: 1000,
        }
    }

    #[test]
    fn window_counts_down_then_denies() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        for expected_remaining in (0u32..5).rev() {
            let decision = limiter.check_at("10.0.0.1", profile(), now);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let denied = limiter.check_at("10.0.0.1", profile(), now);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
    }

    #[test]
    fn fresh_window_resets_count_to_one() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        for _ in 0..6 {
            limiter.check_at("10.0.0.1", profile(), now);
        }

        let later = now + Duration::milliseconds(1001);
        let decision = limiter.check_at("10.0.0.1", profile(), later);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[test]
    fn denial_does_not_reset_the_window() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        let first = limiter.check_at("10.0.0.1", profile(), now);
        for _ in 0..6 {
            let decision = limiter.check_at("10.0.0.1", profile(), now);
            assert_eq!(decision.reset_at, first.reset_at);
        }
    }

    #[test]
    fn identifiers_are_independent() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        for _ in 0..6 {
            limiter.check_at("10.0.0.1", profile(), now);
        }

        let other = limiter.check_at("10.0.0.2", profile(), now);
        assert!(other.allowed);
        assert_eq!(other.remaining, 4);
    }

    #[test]
    fn cleanup_drops_expired_entries() {
        let limiter = RateLimiter::new();
        let expired = Utc::now() - Duration::milliseconds(5000);

        limiter.check_at("10.0.0.1", profile(), expired);
        assert_eq!(limiter.len(), 1);

        limiter.cleanup();
        assert_eq!(limiter.len(), 0);
    }

    #[test]
    fn identifier_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "10.0.0.2".parse().unwrap());
        assert_eq!(client_identifier(&headers), "203.0.113.9");
    }

    #[test]
    fn identifier_falls_back_to_real_ip_then_sentinel() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "10.0.0.2".parse().unwrap());
        assert_eq!(client_identifier(&headers), "10.0.0.2");

        assert_eq!(client_identifier(&HeaderMap::new()), UNKNOWN_CLIENT);
    }
}
