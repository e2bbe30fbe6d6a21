// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Session store.
//!
//! The authorization core. Every mutation runs inside one storage
//! transaction: begin, read the clock once, apply the state machine, commit.
//! Broadcast events are collected during the transaction and published only
//! after commit, so subscribers never observe a state that was rolled back.
//!
//! Student-facing operations (claim, heartbeat, violation report, reconnect)
//! live here; proctor/admin operations are in [`admin`], and the background
//! sweeps in [`sweep`].

mod admin;
mod sweep;

pub use admin::{
    FinishSessionOutput, LaunchConfig, MonitorOutput, MonitorToken, PinStatusOutput,
    ReissueSignatureOutput, SetProctorPinInput, VerifyPinOutcome,
};
pub use sweep::{ArchiveSweepReport, LivenessSweepReport};

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::broadcast::{EventSink, EventType, RealtimeEvent};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::db::{Database, StoreTx};
use crate::error::EngineError;
use crate::model::{
    lock_reason, violation_lock_reason, DeviceBinding, ExamSession, Heartbeat, ProctorPin, Role,
    SessionStatus, SessionToken, Violation,
};
use crate::risk::{heartbeat_risk_delta, violation_severity, HeartbeatSignals};
use crate::signature::{SignatureCodec, SignaturePayload};
use crate::whitelist;

/// Events queued during a transaction, published after commit.
type PendingEvents = Vec<(EventType, serde_json::Value)>;

/// The session engine. Cheap to clone; all fields are shared handles.
#[derive(Clone)]
pub struct SessionStore {
    db: Arc<dyn Database>,
    codec: SignatureCodec,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
}

// =============================================================================
// INPUTS & OUTPUTS
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateSessionInput {
    pub exam_name: String,
    pub created_by: String,
    /// Total tokens to mint: one reusable admin token plus
    /// `token_count - 1` single-use student tokens.
    pub token_count: usize,
    #[serde(default)]
    pub launch_url: Option<String>,
    /// Overrides the configured claim-token TTL when present.
    #[serde(default)]
    pub token_ttl_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionOutput {
    pub session: ExamSession,
    pub student_tokens: Vec<String>,
    pub admin_tokens: Vec<String>,
    pub whitelist: Vec<String>,
    pub launch_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimSessionInput {
    pub token: String,
    /// Raw device fingerprint; only its hash is stored.
    pub fingerprint: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimSessionOutput {
    pub binding_id: String,
    pub signature: String,
    pub session: ExamSession,
    pub role: Role,
    pub launch_url: Option<String>,
    /// Whether a proctor exit PIN was already set for this session.
    pub proctor_pin_set: bool,
}

// No deny_unknown_fields here: clients attach free-form diagnostic fields
// to heartbeats, and the raw payload is archived anyway.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatInput {
    #[serde(flatten)]
    pub signals: HeartbeatSignals,
    /// Client-declared cumulative risk. Can only raise the score.
    #[serde(default)]
    pub risk_score: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatOutput {
    pub accepted: bool,
    pub locked: bool,
    pub lock_reason: Option<String>,
    pub risk_score: i64,
    pub session_status: SessionStatus,
    /// Present when the signature was proactively rotated.
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportEventInput {
    pub event_type: String,
    /// Explicit severity override; falls back to the fixed table.
    #[serde(default)]
    pub severity: Option<i64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportEventOutput {
    pub accepted: bool,
    pub violation_id: Option<u64>,
    pub risk_score: i64,
    pub locked: bool,
    pub lock_reason: Option<String>,
    pub session_status: SessionStatus,
}

/// Proof of identity for a device that lost its live signature. Exactly one
/// of the optional fields must carry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectInput {
    pub binding_id: String,
    /// A cryptographically valid but stale or expired signature.
    #[serde(default)]
    pub signature: Option<String>,
    /// The original claim token.
    #[serde(default)]
    pub token: Option<String>,
    /// The raw device fingerprint presented at claim time.
    #[serde(default)]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconnectOutput {
    pub signature: String,
    pub session: ExamSession,
    pub risk_score: i64,
}

/// The result of authenticating a capability signature against live state.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub payload: SignaturePayload,
    pub binding: DeviceBinding,
    pub token: SessionToken,
    pub session: ExamSession,
}

// =============================================================================
// STORE
// =============================================================================

impl SessionStore {
    pub fn new(
        db: Arc<dyn Database>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let codec = SignatureCodec::new(&config.signature_secret, config.access_signature_ttl_secs);
        Self {
            db,
            codec,
            config,
            clock,
            sink,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create a session, mint its claim tokens, and seed its whitelist.
    pub async fn create_session(
        &self,
        input: CreateSessionInput,
    ) -> Result<CreateSessionOutput, EngineError> {
        let exam_name = input.exam_name.trim().to_string();
        if exam_name.is_empty() {
            return Err(EngineError::validation(
                "EXAM_NAME_REQUIRED",
                "Exam name is required",
            ));
        }
        let created_by = input.created_by.trim().to_string();
        if created_by.is_empty() {
            return Err(EngineError::validation(
                "CREATED_BY_REQUIRED",
                "Creator identity is required",
            ));
        }
        if input.token_count == 0 {
            return Err(EngineError::validation(
                "TOKEN_COUNT_REQUIRED",
                "At least one token must be issued",
            ));
        }
        if input.token_count > 500 {
            return Err(EngineError::validation(
                "TOKEN_COUNT_TOO_LARGE",
                "Token count exceeds the per-session limit",
            ));
        }

        let now = self.clock.now();
        let ttl_minutes = input
            .token_ttl_minutes
            .filter(|m| *m > 0)
            .unwrap_or(self.config.default_token_ttl_minutes);
        let expires_at = now + Duration::minutes(ttl_minutes);

        let session = ExamSession {
            id: random_id("sess"),
            exam_name,
            created_by,
            status: SessionStatus::Active,
            start_time: now,
            end_time: None,
        };

        let mut tx = self.db.begin().await?;
        let mut events = PendingEvents::new();
        let result = self
            .create_session_tx(&mut *tx, &session, &input, expires_at, now, &mut events)
            .await;

        self.finish(tx, result, events).await
    }

    async fn create_session_tx(
        &self,
        tx: &mut dyn StoreTx,
        session: &ExamSession,
        input: &CreateSessionInput,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        events: &mut PendingEvents,
    ) -> Result<CreateSessionOutput, EngineError> {
        tx.insert_session(session).await?;

        let student_count = input.token_count - 1;
        let mut student_tokens = Vec::with_capacity(student_count);
        for _ in 0..student_count {
            let token = claim_token(Role::Student);
            tx.insert_token(&SessionToken {
                token: token.clone(),
                session_id: session.id.clone(),
                role: Role::Student,
                claimed: false,
                claimed_at: None,
                expires_at: Some(expires_at),
                revoked: false,
                created_at: now,
            })
            .await?;
            student_tokens.push(token);
        }

        // Always exactly one admin token per session.
        let admin_token = claim_token(Role::Admin);
        tx.insert_token(&SessionToken {
            token: admin_token.clone(),
            session_id: session.id.clone(),
            role: Role::Admin,
            claimed: false,
            claimed_at: None,
            expires_at: Some(expires_at),
            revoked: false,
            created_at: now,
        })
        .await?;
        let admin_tokens = vec![admin_token];

        let mut whitelist_urls = Vec::new();
        for url in &self.config.default_whitelist {
            let normalized = whitelist::normalize_url(url)?;
            if tx.add_whitelist_url(&session.id, &normalized, now).await? {
                whitelist_urls.push(normalized);
            }
        }

        let mut launch_url = None;
        if let Some(raw) = input.launch_url.as_deref() {
            let url = self
                .set_browser_target_tx(tx, &session.id, raw, now)
                .await?;
            whitelist_urls.push(url.clone());
            launch_url = Some(url);
        }

        events.push((
            EventType::SessionCreated,
            serde_json::json!({
                "session_id": session.id,
                "exam_name": session.exam_name,
                "student_tokens": student_tokens.len(),
                "admin_tokens": admin_tokens.len(),
            }),
        ));

        Ok(CreateSessionOutput {
            session: session.clone(),
            student_tokens,
            admin_tokens,
            whitelist: whitelist_urls,
            launch_url,
        })
    }

    /// Claim a token: bind this device to the session and mint its first
    /// capability signature.
    pub async fn claim_session(
        &self,
        input: ClaimSessionInput,
    ) -> Result<ClaimSessionOutput, EngineError> {
        let token_value = input.token.trim().to_string();
        if token_value.is_empty() {
            return Err(EngineError::validation(
                "TOKEN_REQUIRED",
                "Claim token is required",
            ));
        }
        if input.fingerprint.trim().is_empty() {
            return Err(EngineError::validation(
                "FINGERPRINT_REQUIRED",
                "Device fingerprint is required",
            ));
        }

        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let mut events = PendingEvents::new();
        let result = self
            .claim_session_tx(&mut *tx, &token_value, &input, now, &mut events)
            .await;

        self.finish(tx, result, events).await
    }

    async fn claim_session_tx(
        &self,
        tx: &mut dyn StoreTx,
        token_value: &str,
        input: &ClaimSessionInput,
        now: DateTime<Utc>,
        events: &mut PendingEvents,
    ) -> Result<ClaimSessionOutput, EngineError> {
        let mut token = tx
            .token_for_update(token_value)
            .await?
            .ok_or_else(|| EngineError::not_found("TOKEN_NOT_FOUND", "Unknown claim token"))?;

        if token.revoked {
            return Err(EngineError::conflict(
                "TOKEN_REVOKED",
                "This token has been revoked",
            ));
        }
        if let Some(expires_at) = token.expires_at {
            if expires_at < now {
                return Err(EngineError::expired(
                    "TOKEN_EXPIRED",
                    "This token has expired",
                ));
            }
        }
        if token.role != input.role {
            return Err(EngineError::conflict(
                "ROLE_MISMATCH",
                "Token was issued for a different role",
            ));
        }

        let mut session = tx
            .session_for_update(&token.session_id)
            .await?
            .ok_or_else(|| EngineError::not_found("SESSION_NOT_FOUND", "Unknown session"))?;
        if session.status.is_terminal() {
            return Err(EngineError::conflict(
                "SESSION_ENDED",
                "Session is no longer accepting participants",
            ));
        }

        let fingerprint_hash = hash_fingerprint(&input.fingerprint);

        if token.claimed {
            // Admin tokens may be re-claimed by the same physical device to
            // recover a lost binding. Students never re-claim.
            if token.role != Role::Admin {
                return Err(EngineError::conflict(
                    "TOKEN_CLAIMED",
                    "This token has already been claimed",
                ));
            }
            let mut binding = tx
                .binding_by_token(&token.token)
                .await?
                .ok_or_else(|| EngineError::internal("claimed token has no binding"))?;
            if binding.fingerprint_hash != fingerprint_hash {
                return Err(EngineError::conflict(
                    "TOKEN_CLAIMED",
                    "This token has already been claimed",
                ));
            }

            binding.locked = false;
            binding.lock_reason = None;
            binding.signature_version += 1;
            binding.last_seen_at = now;
            tx.update_binding(&binding).await?;

            let signature = self.codec.sign(
                &session.id,
                &binding.id,
                binding.signature_version,
                binding.role,
                now,
            );
            let launch_url = tx
                .browser_target(&session.id)
                .await?
                .map(|t| t.launch_url);
            let proctor_pin_set = tx.pin_template(&session.id).await?.is_some();

            events.push((
                EventType::SessionClaimed,
                serde_json::json!({
                    "session_id": session.id,
                    "binding_id": binding.id,
                    "role": binding.role,
                    "reclaim": true,
                }),
            ));

            return Ok(ClaimSessionOutput {
                binding_id: binding.id,
                signature,
                session,
                role: token.role,
                launch_url,
                proctor_pin_set,
            });
        }

        let binding = DeviceBinding {
            id: random_id("bind"),
            token: token.token.clone(),
            role: token.role,
            fingerprint_hash,
            signature_version: 1,
            risk_score: 0,
            locked: false,
            lock_reason: None,
            created_at: now,
            last_seen_at: now,
        };
        tx.insert_binding(&binding).await?;

        token.claimed = true;
        token.claimed_at = Some(now);
        tx.update_token(&token).await?;

        // A PIN set before this device connected still applies: copy the
        // session template onto the new student binding.
        let mut proctor_pin_set = false;
        if token.role == Role::Student {
            if let Some(template) = tx.pin_template(&session.id).await? {
                tx.upsert_proctor_pin(&ProctorPin {
                    session_id: session.id.clone(),
                    binding_id: binding.id.clone(),
                    pin_hash: template.pin_hash,
                    effective_date: template.effective_date,
                    updated_by_binding_id: template.updated_by_binding_id,
                    updated_at: template.updated_at,
                })
                .await?;
                proctor_pin_set = true;
            }
        } else {
            proctor_pin_set = tx.pin_template(&session.id).await?.is_some();
        }

        if session.status == SessionStatus::Active {
            session.status = SessionStatus::InProgress;
            tx.update_session(&session).await?;
        }

        let signature =
            self.codec
                .sign(&session.id, &binding.id, binding.signature_version, binding.role, now);
        let launch_url = tx
            .browser_target(&session.id)
            .await?
            .map(|t| t.launch_url);

        events.push((
            EventType::SessionClaimed,
            serde_json::json!({
                "session_id": session.id,
                "binding_id": binding.id,
                "role": binding.role,
                "reclaim": false,
            }),
        ));

        Ok(ClaimSessionOutput {
            binding_id: binding.id,
            signature,
            session,
            role: token.role,
            launch_url,
            proctor_pin_set,
        })
    }

    /// Record a liveness ping, accumulate risk, and rotate the signature if
    /// it is close to expiry.
    pub async fn handle_heartbeat(
        &self,
        signature: &str,
        input: HeartbeatInput,
        raw_payload: serde_json::Value,
    ) -> Result<HeartbeatOutput, EngineError> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let mut events = PendingEvents::new();
        let result = self
            .handle_heartbeat_tx(&mut *tx, signature, &input, raw_payload, now, &mut events)
            .await;

        self.finish(tx, result, events).await
    }

    async fn handle_heartbeat_tx(
        &self,
        tx: &mut dyn StoreTx,
        signature: &str,
        input: &HeartbeatInput,
        raw_payload: serde_json::Value,
        now: DateTime<Utc>,
        events: &mut PendingEvents,
    ) -> Result<HeartbeatOutput, EngineError> {
        let auth = self.authenticate_tx(tx, signature, now).await?;
        let AuthContext {
            payload,
            mut binding,
            mut session,
            ..
        } = auth;

        // A locked binding or ended session gets a commanding "lock now"
        // answer instead of an error; the client is expected to comply.
        if binding.locked || session.status.is_terminal() {
            return Ok(HeartbeatOutput {
                accepted: false,
                locked: true,
                lock_reason: binding.lock_reason.clone(),
                risk_score: binding.risk_score,
                session_status: session.status,
                signature: None,
            });
        }

        let delta = heartbeat_risk_delta(&input.signals);
        let next_risk = (binding.risk_score + delta).max(input.risk_score);

        tx.insert_heartbeat(&Heartbeat {
            id: 0,
            binding_id: binding.id.clone(),
            focus: input.signals.focus,
            multi_window: input.signals.multi_window,
            risk_score: next_risk,
            network_state: input.signals.network_state.clone(),
            payload: raw_payload,
            created_at: now,
        })
        .await?;

        binding.risk_score = next_risk;
        binding.last_seen_at = now;

        let mut locked = false;
        if next_risk >= self.config.risk_lock_threshold {
            binding.locked = true;
            binding.lock_reason = Some(lock_reason::RISK_THRESHOLD.to_string());
            locked = true;

            session.status = SessionStatus::Locked;
            session.end_time = Some(now);
            tx.update_session(&session).await?;

            events.push((
                EventType::SessionLocked,
                serde_json::json!({
                    "session_id": session.id,
                    "binding_id": binding.id,
                    "reason": lock_reason::RISK_THRESHOLD,
                    "risk_score": next_risk,
                }),
            ));
        } else if session.status.is_staleness_family()
            && session.status != SessionStatus::InProgress
        {
            // A fresh heartbeat recovers any staleness tier.
            session.status = SessionStatus::InProgress;
            tx.update_session(&session).await?;
            events.push((
                EventType::SessionRecovered,
                serde_json::json!({
                    "session_id": session.id,
                    "binding_id": binding.id,
                }),
            ));
        }

        let mut fresh_signature = None;
        if !locked && payload.exp - now.timestamp() <= self.config.rotation_margin_secs {
            binding.signature_version += 1;
            fresh_signature = Some(self.codec.sign(
                &session.id,
                &binding.id,
                binding.signature_version,
                binding.role,
                now,
            ));
        }

        tx.update_binding(&binding).await?;

        events.push((
            EventType::Heartbeat,
            serde_json::json!({
                "session_id": session.id,
                "binding_id": binding.id,
                "risk_score": next_risk,
                "focus": input.signals.focus,
            }),
        ));

        Ok(HeartbeatOutput {
            accepted: true,
            locked,
            lock_reason: binding.lock_reason.clone(),
            risk_score: next_risk,
            session_status: session.status,
            signature: fresh_signature,
        })
    }

    /// Record a reported integrity violation and apply its severity.
    pub async fn report_event(
        &self,
        signature: &str,
        input: ReportEventInput,
    ) -> Result<ReportEventOutput, EngineError> {
        let event_type = input.event_type.trim().to_uppercase();
        if event_type.is_empty() {
            return Err(EngineError::validation(
                "EVENT_TYPE_REQUIRED",
                "Event type is required",
            ));
        }

        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let mut events = PendingEvents::new();
        let result = self
            .report_event_tx(&mut *tx, signature, &event_type, &input, now, &mut events)
            .await;

        self.finish(tx, result, events).await
    }

    async fn report_event_tx(
        &self,
        tx: &mut dyn StoreTx,
        signature: &str,
        event_type: &str,
        input: &ReportEventInput,
        now: DateTime<Utc>,
        events: &mut PendingEvents,
    ) -> Result<ReportEventOutput, EngineError> {
        let auth = self.authenticate_tx(tx, signature, now).await?;
        let AuthContext {
            mut binding,
            mut session,
            ..
        } = auth;

        if binding.locked || session.status.is_terminal() {
            return Ok(ReportEventOutput {
                accepted: false,
                violation_id: None,
                risk_score: binding.risk_score,
                locked: true,
                lock_reason: binding.lock_reason.clone(),
                session_status: session.status,
            });
        }

        let severity = input
            .severity
            .filter(|s| *s >= 0)
            .unwrap_or_else(|| violation_severity(event_type));

        let violation_id = tx
            .insert_violation(&Violation {
                id: 0,
                binding_id: binding.id.clone(),
                event_type: event_type.to_string(),
                severity,
                metadata: input.metadata.clone(),
                created_at: now,
            })
            .await?;

        let next_risk = binding.risk_score + severity;
        binding.risk_score = next_risk;
        binding.last_seen_at = now;

        let mut locked = false;
        if next_risk >= self.config.risk_lock_threshold {
            let reason = violation_lock_reason(event_type);
            binding.locked = true;
            binding.lock_reason = Some(reason.clone());
            locked = true;

            session.status = SessionStatus::Locked;
            session.end_time = Some(now);
            tx.update_session(&session).await?;

            events.push((
                EventType::SessionLocked,
                serde_json::json!({
                    "session_id": session.id,
                    "binding_id": binding.id,
                    "reason": reason,
                    "risk_score": next_risk,
                }),
            ));
        }

        tx.update_binding(&binding).await?;

        events.push((
            EventType::Violation,
            serde_json::json!({
                "session_id": session.id,
                "binding_id": binding.id,
                "event_type": event_type,
                "severity": severity,
                "risk_score": next_risk,
            }),
        ));

        Ok(ReportEventOutput {
            accepted: true,
            violation_id: Some(violation_id),
            risk_score: next_risk,
            locked,
            lock_reason: binding.lock_reason.clone(),
            session_status: session.status,
        })
    }

    /// Re-admit a device whose signature lapsed entirely. The caller must
    /// present one acceptable proof of identity; a binding locked for any
    /// reason other than heartbeat timeout is refused.
    pub async fn reconnect_session(
        &self,
        input: ReconnectInput,
    ) -> Result<ReconnectOutput, EngineError> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let mut events = PendingEvents::new();
        let result = self
            .reconnect_session_tx(&mut *tx, &input, now, &mut events)
            .await;

        self.finish(tx, result, events).await
    }

    async fn reconnect_session_tx(
        &self,
        tx: &mut dyn StoreTx,
        input: &ReconnectInput,
        now: DateTime<Utc>,
        events: &mut PendingEvents,
    ) -> Result<ReconnectOutput, EngineError> {
        let context = tx
            .binding_context(&input.binding_id)
            .await?
            .ok_or_else(|| EngineError::not_found("BINDING_NOT_FOUND", "Unknown binding"))?;
        let mut binding = context.binding;
        let token = context.token;
        let mut session = context.session;

        if session.status.is_terminal() && session.status != SessionStatus::Locked {
            return Err(EngineError::conflict(
                "SESSION_ENDED",
                "Session is no longer active",
            ));
        }

        // Proof of identity, strongest first: a signature that still
        // verifies cryptographically (even if stale or expired), the
        // original claim token, or the claim-time fingerprint.
        let proved = if let Some(presented) = input.signature.as_deref() {
            match self.codec.verify(presented) {
                Ok(payload) => payload.bid == binding.id && payload.sid == session.id,
                Err(_) => false,
            }
        } else if let Some(presented) = input.token.as_deref() {
            presented == token.token
        } else if let Some(presented) = input.fingerprint.as_deref() {
            hash_fingerprint(presented) == binding.fingerprint_hash
        } else {
            false
        };
        if !proved {
            return Err(EngineError::unauthorized(
                "RECONNECT_PROOF_INVALID",
                "Reconnect proof did not match this binding",
            ));
        }

        if binding.locked {
            // Only liveness locks are recoverable by the device itself.
            // Risk and violation locks need an admin reissue.
            if binding.lock_reason.as_deref() != Some(lock_reason::HEARTBEAT_TIMEOUT) {
                return Err(EngineError::forbidden(
                    "BINDING_LOCKED",
                    "Binding is locked and cannot self-recover",
                ));
            }
            binding.locked = false;
            binding.lock_reason = None;
        }

        binding.signature_version += 1;
        binding.last_seen_at = now;
        tx.update_binding(&binding).await?;

        if session.status == SessionStatus::Locked || session.status.is_staleness_family() {
            session.status = SessionStatus::InProgress;
            session.end_time = None;
            tx.update_session(&session).await?;
        }

        let signature = self.codec.sign(
            &session.id,
            &binding.id,
            binding.signature_version,
            binding.role,
            now,
        );

        events.push((
            EventType::SessionReconnected,
            serde_json::json!({
                "session_id": session.id,
                "binding_id": binding.id,
            }),
        ));

        Ok(ReconnectOutput {
            signature,
            session,
            risk_score: binding.risk_score,
        })
    }

    /// Authenticate a capability signature against live state. Runs in its
    /// own read transaction.
    pub async fn authenticate(&self, signature: &str) -> Result<AuthContext, EngineError> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let result = self.authenticate_tx(&mut *tx, signature, now).await;
        // Read-only; discard the transaction either way.
        let _ = tx.rollback().await;
        result
    }

    pub(crate) async fn authenticate_tx(
        &self,
        tx: &mut dyn StoreTx,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthContext, EngineError> {
        let payload = self.codec.verify(signature).map_err(|_| {
            EngineError::unauthorized("SIGNATURE_INVALID", "Signature is not valid")
        })?;

        if payload.exp < now.timestamp() {
            return Err(EngineError::unauthorized(
                "SIGNATURE_EXPIRED",
                "Signature has expired",
            ));
        }

        let context = tx.binding_context(&payload.bid).await?.ok_or_else(|| {
            EngineError::unauthorized("BINDING_NOT_FOUND", "Signature refers to no known binding")
        })?;

        if context.session.id != payload.sid {
            return Err(EngineError::unauthorized(
                "SESSION_MISMATCH",
                "Signature was issued for a different session",
            ));
        }
        if context.binding.role != payload.role {
            return Err(EngineError::unauthorized(
                "ROLE_MISMATCH",
                "Signature role does not match the binding",
            ));
        }
        // Rotation is the revocation mechanism: any version other than the
        // binding's current one is dead, however fresh its expiry.
        if context.binding.signature_version != payload.ver {
            return Err(EngineError::unauthorized(
                "SIGNATURE_STALE",
                "Signature version has been rotated",
            ));
        }

        Ok(AuthContext {
            payload,
            binding: context.binding,
            token: context.token,
            session: context.session,
        })
    }

    /// Authenticate and require the admin role.
    pub(crate) async fn authenticate_admin_tx(
        &self,
        tx: &mut dyn StoreTx,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthContext, EngineError> {
        let auth = self.authenticate_tx(tx, signature, now).await?;
        if auth.binding.role != Role::Admin {
            return Err(EngineError::forbidden(
                "ADMIN_REQUIRED",
                "This operation requires an admin binding",
            ));
        }
        Ok(auth)
    }

    /// Upsert the browser target and whitelist its URL. Returns the
    /// normalized URL.
    pub(crate) async fn set_browser_target_tx(
        &self,
        tx: &mut dyn StoreTx,
        session_id: &str,
        raw_url: &str,
        now: DateTime<Utc>,
    ) -> Result<String, EngineError> {
        let url = whitelist::normalize_url(raw_url)?;
        let provider = whitelist::detect_provider(&url);
        tx.upsert_browser_target(&crate::model::BrowserTarget {
            session_id: session_id.to_string(),
            launch_url: url.clone(),
            provider,
            lock_to_host: true,
            created_at: now,
            updated_at: now,
        })
        .await?;
        tx.add_whitelist_url(session_id, &url, now).await?;
        Ok(url)
    }

    /// Commit-or-rollback epilogue shared by every mutation.
    async fn finish<T>(
        &self,
        tx: Box<dyn StoreTx>,
        result: Result<T, EngineError>,
        events: PendingEvents,
    ) -> Result<T, EngineError> {
        match result {
            Ok(value) => {
                tx.commit().await?;
                self.emit(events);
                Ok(value)
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    pub(crate) fn emit(&self, events: PendingEvents) {
        let now = self.clock.now();
        for (event_type, payload) in events {
            self.sink
                .publish(RealtimeEvent::new(event_type, now, payload));
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Claim token: role prefix plus 10 characters from an unambiguous
/// uppercase alphabet.
pub(crate) fn claim_token(role: Role) -> String {
    let prefix = match role {
        Role::Student => "S-",
        Role::Admin => "A-",
    };
    let mut rng = rand::thread_rng();
    let suffix: String = (0..10)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect();
    format!("{prefix}{suffix}")
}

/// Entity id: short prefix plus 12 random hex characters.
pub(crate) fn random_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 6] = rng.gen();
    format!("{prefix}-{}", hex::encode(bytes))
}

/// Raw fingerprints never hit storage; only this digest does.
pub(crate) fn hash_fingerprint(fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hex::encode(hasher.finalize())
}
