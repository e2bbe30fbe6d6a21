// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Data model for the session engine.
//!
//! Row types for every live entity, the session state machine, and the
//! derived per-token monitor status. These are plain serde structs; all
//! mutation rules live in the store.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// ROLES & STATE MACHINE
// =============================================================================

/// Who a claim token (and the binding it produces) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "admin" => Ok(Role::Admin),
            _ => Err(()),
        }
    }
}

/// Session state machine.
///
/// `ACTIVE` is the pre-claim state; the first claim promotes the session to
/// `IN_PROGRESS`. `DEGRADED` and `SUSPENDED` are staleness tiers assigned
/// only by the liveness watcher and cleared by any fresh heartbeat or
/// reconnect. `PAUSED` is admin-only. `LOCKED`, `REVOKED`, and `FINISHED`
/// are terminal sinks that set an end timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    InProgress,
    Degraded,
    Suspended,
    Paused,
    Locked,
    Revoked,
    Finished,
}

impl SessionStatus {
    /// Terminal states accept no further transitions (admin recovery paths
    /// excepted for `LOCKED`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Locked | Self::Revoked | Self::Finished)
    }

    /// States the liveness watcher may move between.
    pub fn is_staleness_family(&self) -> bool {
        matches!(self, Self::InProgress | Self::Degraded | Self::Suspended)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::InProgress => "IN_PROGRESS",
            Self::Degraded => "DEGRADED",
            Self::Suspended => "SUSPENDED",
            Self::Paused => "PAUSED",
            Self::Locked => "LOCKED",
            Self::Revoked => "REVOKED",
            Self::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Binding lock reasons written by the engine itself. Violation locks use
/// `violation_lock_reason` instead.
pub mod lock_reason {
    pub const RISK_THRESHOLD: &str = "RISK_THRESHOLD";
    pub const HEARTBEAT_TIMEOUT: &str = "HEARTBEAT_TIMEOUT";
    pub const SESSION_FINISHED: &str = "SESSION_FINISHED";
    pub const SESSION_REVOKED: &str = "SESSION_REVOKED";
    pub const STUDENT_REVOKED: &str = "STUDENT_REVOKED";
}

/// Lock reason for a violation-triggered lock, e.g. `VIOLATION:OVERLAY_DETECTED`.
pub fn violation_lock_reason(event_type: &str) -> String {
    format!("VIOLATION:{event_type}")
}

// =============================================================================
// LIVE ROWS
// =============================================================================

/// One proctored exam run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamSession {
    pub id: String,
    pub exam_name: String,
    pub created_by: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// A single-use claim credential scoped to one session.
///
/// Student tokens are consumed exactly once. Admin tokens may be re-claimed
/// by the same device to recover a lost binding; that is the one designed
/// exception to single use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionToken {
    pub token: String,
    pub session_id: String,
    pub role: Role,
    pub claimed: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

/// The runtime identity of one physical device attached to one token.
///
/// `signature_version` increments on every rotation and is the sole
/// mechanism invalidating older capability signatures. The risk score is
/// monotonically non-decreasing for the binding's lifetime; only a fresh
/// claim resets it (by creating a new binding).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceBinding {
    pub id: String,
    pub token: String,
    pub role: Role,
    pub fingerprint_hash: String,
    pub signature_version: u32,
    pub risk_score: i64,
    pub locked: bool,
    pub lock_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Immutable record of one liveness ping. Write-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub id: u64,
    pub binding_id: String,
    pub focus: bool,
    pub multi_window: bool,
    pub risk_score: i64,
    pub network_state: Option<String>,
    /// Raw request payload, kept verbatim for the audit trail.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Immutable record of one reported integrity event. Write-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub id: u64,
    pub binding_id: String,
    pub event_type: String,
    pub severity: i64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One allowed destination URL for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub session_id: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// Launch URL and detected provider for a session. Upserting this also
/// whitelists the URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserTarget {
    pub session_id: String,
    pub launch_url: String,
    pub provider: String,
    pub lock_to_host: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Proctor exit-PIN template, keyed by session so a PIN set before a
/// student first connects still applies on claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinTemplate {
    pub session_id: String,
    pub pin_hash: String,
    /// The PIN is valid only on this calendar day; it expires at midnight
    /// purely by date comparison, not by any timer.
    pub effective_date: NaiveDate,
    pub updated_by_binding_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Per-binding copy of the proctor PIN, bound once the device claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProctorPin {
    pub session_id: String,
    pub binding_id: String,
    pub pin_hash: String,
    pub effective_date: NaiveDate,
    pub updated_by_binding_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Cold record of an archived session: the full serialized graph plus the
/// status it ended in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionArchive {
    pub id: u64,
    pub session_id: String,
    pub session_status: SessionStatus,
    pub payload: serde_json::Value,
    pub archived_at: DateTime<Utc>,
}

// =============================================================================
// DERIVED STATE
// =============================================================================

/// Live status of one token as shown on the proctor monitor, in strict
/// precedence order: expired > revoked > issued (unclaimed) > offline
/// (stale beyond the heartbeat timeout) > online.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenLiveStatus {
    Expired,
    Revoked,
    Issued,
    Offline,
    Online,
}

impl TokenLiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::Issued => "issued",
            Self::Offline => "offline",
            Self::Online => "online",
        }
    }
}

impl fmt::Display for TokenLiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
