// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Engine configuration.
//!
//! All thresholds, windows, and TTLs the session engine depends on, resolved
//! into one plain struct. Nothing in the engine reads the environment
//! directly; `EngineConfig::from_env()` is called once at startup and the
//! resulting value is injected into every component, so tests can construct
//! arbitrary configurations without touching process state.

use std::env;

/// Resolved engine knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// HMAC key for capability signatures.
    pub signature_secret: String,
    /// Capability signature lifetime in seconds. Deliberately short;
    /// long-lived access comes from rotation, never from long expiries.
    pub access_signature_ttl_secs: i64,
    /// Remaining-lifetime margin below which a heartbeat proactively
    /// rotates the signature, to avoid expiry racing the next heartbeat.
    pub rotation_margin_secs: i64,
    /// Claim-token lifetime in minutes.
    pub default_token_ttl_minutes: i64,
    /// Staleness window after which a session degrades.
    pub heartbeat_timeout_secs: i64,
    /// Staleness window after which a session suspends.
    pub heartbeat_suspend_secs: i64,
    /// Staleness window after which the stale binding is locked.
    pub heartbeat_lock_secs: i64,
    /// Liveness watcher poll interval.
    pub heartbeat_watch_interval_secs: u64,
    /// How long a finished/revoked session stays queryable before archival.
    pub session_archive_grace_secs: i64,
    /// Maximum sessions archived per sweep run.
    pub session_cleanup_batch_size: usize,
    /// Cumulative risk score at which a binding locks.
    pub risk_lock_threshold: i64,
    /// URLs every new session is allowed to reach.
    pub default_whitelist: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            signature_secret: "dev-only-secret".to_string(),
            access_signature_ttl_secs: 300,
            rotation_margin_secs: 60,
            default_token_ttl_minutes: 120,
            heartbeat_timeout_secs: 30,
            heartbeat_suspend_secs: 90,
            heartbeat_lock_secs: 180,
            heartbeat_watch_interval_secs: 5,
            session_archive_grace_secs: 60,
            session_cleanup_batch_size: 25,
            risk_lock_threshold: 12,
            default_whitelist: vec![
                "https://example.org".to_string(),
                "https://school.ac.id/exam".to_string(),
            ],
        }
    }
}

impl EngineConfig {
    /// Resolve configuration from `EXAMGATE_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            signature_secret: env::var("EXAMGATE_SIGNATURE_SECRET")
                .unwrap_or(defaults.signature_secret),
            access_signature_ttl_secs: parse_env(
                "EXAMGATE_ACCESS_SIGNATURE_TTL_SECONDS",
                defaults.access_signature_ttl_secs,
            ),
            rotation_margin_secs: parse_env(
                "EXAMGATE_ROTATION_MARGIN_SECONDS",
                defaults.rotation_margin_secs,
            ),
            default_token_ttl_minutes: parse_env(
                "EXAMGATE_DEFAULT_TOKEN_TTL_MINUTES",
                defaults.default_token_ttl_minutes,
            ),
            heartbeat_timeout_secs: parse_env(
                "EXAMGATE_HEARTBEAT_TIMEOUT_SECONDS",
                defaults.heartbeat_timeout_secs,
            ),
            heartbeat_suspend_secs: parse_env(
                "EXAMGATE_HEARTBEAT_SUSPEND_SECONDS",
                defaults.heartbeat_suspend_secs,
            ),
            heartbeat_lock_secs: parse_env(
                "EXAMGATE_HEARTBEAT_LOCK_SECONDS",
                defaults.heartbeat_lock_secs,
            ),
            heartbeat_watch_interval_secs: parse_env(
                "EXAMGATE_HEARTBEAT_WATCH_INTERVAL_SECONDS",
                defaults.heartbeat_watch_interval_secs,
            ),
            session_archive_grace_secs: parse_env(
                "EXAMGATE_SESSION_ARCHIVE_GRACE_SECONDS",
                defaults.session_archive_grace_secs,
            ),
            session_cleanup_batch_size: parse_env(
                "EXAMGATE_SESSION_CLEANUP_BATCH_SIZE",
                defaults.session_cleanup_batch_size,
            ),
            risk_lock_threshold: parse_env(
                "EXAMGATE_RISK_LOCK_THRESHOLD",
                defaults.risk_lock_threshold,
            ),
            default_whitelist: env::var("EXAMGATE_DEFAULT_WHITELIST")
                .map(|raw| {
                    raw.split(',')
                        .map(|value| value.trim().to_string())
                        .filter(|value| !value.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.default_whitelist),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or(fallback),
        Err(_) => fallback,
    }
}
