// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Proctor and admin operations.
//!
//! Everything here authenticates a capability signature first; mutating
//! operations additionally require the admin role. PIN handling follows the
//! day-validity rule: a PIN is usable only on the calendar day it was set.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::broadcast::EventType;
use crate::error::EngineError;
use crate::model::{
    lock_reason, DeviceBinding, ExamSession, ProctorPin, Role, SessionStatus, TokenLiveStatus,
};
use crate::whitelist;

use super::{PendingEvents, SessionStore};

// =============================================================================
// INPUTS & OUTPUTS
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetProctorPinInput {
    pub pin: String,
}

/// Result of a PIN check. `valid` is the only outcome that releases the
/// lockdown client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyPinOutcome {
    Valid,
    PinNotSet,
    PinExpired,
    PinInvalid,
}

#[derive(Debug, Clone, Serialize)]
pub struct PinStatusOutput {
    pub set: bool,
    pub effective_date: Option<NaiveDate>,
    pub expired: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchConfig {
    pub launch_url: Option<String>,
    pub provider: Option<String>,
    pub lock_to_host: bool,
    pub whitelist: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinishSessionOutput {
    pub session: ExamSession,
    pub bindings_locked: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReissueSignatureOutput {
    pub binding_id: String,
    pub signature: String,
    pub session_status: SessionStatus,
}

/// One token row as shown on the proctor monitor.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorToken {
    pub token: String,
    pub role: Role,
    pub status: TokenLiveStatus,
    pub binding_id: Option<String>,
    pub risk_score: i64,
    pub locked: bool,
    pub lock_reason: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorOutput {
    pub session: ExamSession,
    pub tokens: Vec<MonitorToken>,
    pub heartbeat_count: usize,
    pub violation_count: usize,
}

// =============================================================================
// OPERATIONS
// =============================================================================

impl SessionStore {
    /// Current whitelist for the caller's session.
    pub async fn get_whitelist(&self, signature: &str) -> Result<Vec<String>, EngineError> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let result = async {
            let auth = self.authenticate_tx(&mut *tx, signature, now).await?;
            let entries = tx.whitelist(&auth.session.id).await?;
            Ok(entries.into_iter().map(|e| e.url).collect())
        }
        .await;
        let _ = tx.rollback().await;
        result
    }

    /// Add one URL to the caller's session whitelist. Admin only.
    pub async fn add_whitelist_url(
        &self,
        signature: &str,
        raw_url: &str,
    ) -> Result<Vec<String>, EngineError> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let mut events = PendingEvents::new();
        let result = async {
            let auth = self.authenticate_admin_tx(&mut *tx, signature, now).await?;
            let url = whitelist::normalize_url(raw_url)?;
            let added = tx.add_whitelist_url(&auth.session.id, &url, now).await?;
            if added {
                events.push((
                    EventType::WhitelistUpdated,
                    serde_json::json!({
                        "session_id": auth.session.id,
                        "url": url,
                    }),
                ));
            }
            let entries = tx.whitelist(&auth.session.id).await?;
            Ok(entries.into_iter().map(|e| e.url).collect())
        }
        .await;

        self.finish(tx, result, events).await
    }

    /// Whether the caller may navigate to `target_url`.
    pub async fn check_launch_target(
        &self,
        signature: &str,
        target_url: &str,
    ) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let result = async {
            let auth = self.authenticate_tx(&mut *tx, signature, now).await?;
            let entries = tx.whitelist(&auth.session.id).await?;
            let urls: Vec<String> = entries.into_iter().map(|e| e.url).collect();
            Ok(whitelist::is_whitelisted(target_url, &urls))
        }
        .await;
        let _ = tx.rollback().await;
        result
    }

    /// Launch URL, provider, and whitelist for the caller's session.
    pub async fn get_launch_config(&self, signature: &str) -> Result<LaunchConfig, EngineError> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let result = async {
            let auth = self.authenticate_tx(&mut *tx, signature, now).await?;
            let target = tx.browser_target(&auth.session.id).await?;
            let entries = tx.whitelist(&auth.session.id).await?;
            Ok(LaunchConfig {
                launch_url: target.as_ref().map(|t| t.launch_url.clone()),
                provider: target.as_ref().map(|t| t.provider.clone()),
                lock_to_host: target.map(|t| t.lock_to_host).unwrap_or(true),
                whitelist: entries.into_iter().map(|e| e.url).collect(),
            })
        }
        .await;
        let _ = tx.rollback().await;
        result
    }

    /// Replace the launch URL. The new URL is auto-whitelisted. Admin only.
    pub async fn update_launch_url(
        &self,
        signature: &str,
        raw_url: &str,
    ) -> Result<LaunchConfig, EngineError> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let mut events = PendingEvents::new();
        let result = async {
            let auth = self.authenticate_admin_tx(&mut *tx, signature, now).await?;
            let url = self
                .set_browser_target_tx(&mut *tx, &auth.session.id, raw_url, now)
                .await?;
            events.push((
                EventType::LaunchUrlUpdated,
                serde_json::json!({
                    "session_id": auth.session.id,
                    "launch_url": url,
                }),
            ));

            let target = tx.browser_target(&auth.session.id).await?;
            let entries = tx.whitelist(&auth.session.id).await?;
            Ok(LaunchConfig {
                launch_url: target.as_ref().map(|t| t.launch_url.clone()),
                provider: target.as_ref().map(|t| t.provider.clone()),
                lock_to_host: target.map(|t| t.lock_to_host).unwrap_or(true),
                whitelist: entries.into_iter().map(|e| e.url).collect(),
            })
        }
        .await;

        self.finish(tx, result, events).await
    }

    /// Set the proctor exit PIN for the whole session. Admin only. The PIN
    /// is stored as a salted digest on the session template and copied to
    /// every already-connected student binding; students that claim later
    /// receive it at claim time.
    pub async fn set_proctor_pin(
        &self,
        signature: &str,
        input: SetProctorPinInput,
    ) -> Result<PinStatusOutput, EngineError> {
        let pin = input.pin.trim().to_string();
        if pin.len() < 4 || !pin.chars().all(|c| c.is_ascii_digit()) {
            return Err(EngineError::validation(
                "PIN_INVALID_FORMAT",
                "PIN must be at least 4 digits",
            ));
        }

        let now = self.clock.now();
        let today = now.date_naive();
        let mut tx = self.db.begin().await?;
        let mut events = PendingEvents::new();
        let result = async {
            let auth = self.authenticate_admin_tx(&mut *tx, signature, now).await?;
            let session_id = auth.session.id.clone();
            let pin_hash = hash_pin(&session_id, &pin);

            tx.upsert_pin_template(&crate::model::PinTemplate {
                session_id: session_id.clone(),
                pin_hash: pin_hash.clone(),
                effective_date: today,
                updated_by_binding_id: Some(auth.binding.id.clone()),
                updated_at: now,
            })
            .await?;

            let bindings = tx.bindings_by_session(&session_id).await?;
            for binding in bindings.iter().filter(|b| b.role == Role::Student) {
                tx.upsert_proctor_pin(&ProctorPin {
                    session_id: session_id.clone(),
                    binding_id: binding.id.clone(),
                    pin_hash: pin_hash.clone(),
                    effective_date: today,
                    updated_by_binding_id: Some(auth.binding.id.clone()),
                    updated_at: now,
                })
                .await?;
            }

            events.push((
                EventType::ProctorPinUpdated,
                serde_json::json!({
                    "session_id": session_id,
                    "effective_date": today,
                }),
            ));

            Ok(PinStatusOutput {
                set: true,
                effective_date: Some(today),
                expired: false,
            })
        }
        .await;

        self.finish(tx, result, events).await
    }

    /// Check a presented exit PIN against the caller's binding copy.
    pub async fn verify_proctor_pin(
        &self,
        signature: &str,
        pin: &str,
    ) -> Result<VerifyPinOutcome, EngineError> {
        let now = self.clock.now();
        let today = now.date_naive();
        let mut tx = self.db.begin().await?;
        let result = async {
            let auth = self.authenticate_tx(&mut *tx, signature, now).await?;
            let stored = tx.proctor_pin(&auth.session.id, &auth.binding.id).await?;
            let Some(stored) = stored else {
                return Ok(VerifyPinOutcome::PinNotSet);
            };
            if stored.effective_date != today {
                return Ok(VerifyPinOutcome::PinExpired);
            }
            if hash_pin(&auth.session.id, pin.trim()) != stored.pin_hash {
                return Ok(VerifyPinOutcome::PinInvalid);
            }
            Ok(VerifyPinOutcome::Valid)
        }
        .await;
        let _ = tx.rollback().await;
        result
    }

    /// Whether a PIN is set for the session and whether it is still on its
    /// effective day.
    pub async fn proctor_pin_status(
        &self,
        signature: &str,
    ) -> Result<PinStatusOutput, EngineError> {
        let now = self.clock.now();
        let today = now.date_naive();
        let mut tx = self.db.begin().await?;
        let result = async {
            let auth = self.authenticate_tx(&mut *tx, signature, now).await?;
            match tx.pin_template(&auth.session.id).await? {
                Some(template) => Ok(PinStatusOutput {
                    set: true,
                    effective_date: Some(template.effective_date),
                    expired: template.effective_date != today,
                }),
                None => Ok(PinStatusOutput {
                    set: false,
                    effective_date: None,
                    expired: false,
                }),
            }
        }
        .await;
        let _ = tx.rollback().await;
        result
    }

    /// End the session normally. Locks every binding so clients release on
    /// their next heartbeat. Admin only.
    pub async fn finish_session(
        &self,
        signature: &str,
    ) -> Result<FinishSessionOutput, EngineError> {
        self.end_session(
            signature,
            SessionStatus::Finished,
            lock_reason::SESSION_FINISHED,
            EventType::SessionFinished,
        )
        .await
    }

    /// End the session forcibly. Admin only.
    pub async fn revoke_session(
        &self,
        signature: &str,
    ) -> Result<FinishSessionOutput, EngineError> {
        self.end_session(
            signature,
            SessionStatus::Revoked,
            lock_reason::SESSION_REVOKED,
            EventType::SessionRevoked,
        )
        .await
    }

    async fn end_session(
        &self,
        signature: &str,
        terminal: SessionStatus,
        binding_reason: &str,
        event: EventType,
    ) -> Result<FinishSessionOutput, EngineError> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let mut events = PendingEvents::new();
        let result = async {
            let auth = self.authenticate_admin_tx(&mut *tx, signature, now).await?;
            let mut session = tx
                .session_for_update(&auth.session.id)
                .await?
                .ok_or_else(|| EngineError::not_found("SESSION_NOT_FOUND", "Unknown session"))?;

            if session.status.is_terminal() {
                return Err(EngineError::conflict(
                    "SESSION_ENDED",
                    "Session has already ended",
                ));
            }

            session.status = terminal;
            session.end_time = Some(now);
            tx.update_session(&session).await?;

            let mut bindings_locked = 0;
            for mut binding in tx.bindings_by_session(&session.id).await? {
                if !binding.locked {
                    binding.locked = true;
                    binding.lock_reason = Some(binding_reason.to_string());
                    tx.update_binding(&binding).await?;
                    bindings_locked += 1;
                }
            }

            events.push((
                event,
                serde_json::json!({
                    "session_id": session.id,
                    "status": session.status,
                    "bindings_locked": bindings_locked,
                }),
            ));

            Ok(FinishSessionOutput {
                session,
                bindings_locked,
            })
        }
        .await;

        self.finish(tx, result, events).await
    }

    /// Revoke a single student token mid-exam. The token stops claiming and
    /// its binding, if any, locks. The session keeps running. Admin only.
    pub async fn revoke_student_token(
        &self,
        signature: &str,
        token_value: &str,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let mut events = PendingEvents::new();
        let result = async {
            let auth = self.authenticate_admin_tx(&mut *tx, signature, now).await?;
            let mut token = tx
                .token_for_update(token_value)
                .await?
                .ok_or_else(|| EngineError::not_found("TOKEN_NOT_FOUND", "Unknown token"))?;

            if token.session_id != auth.session.id {
                return Err(EngineError::not_found("TOKEN_NOT_FOUND", "Unknown token"));
            }
            if token.role != Role::Student {
                return Err(EngineError::conflict(
                    "ROLE_MISMATCH",
                    "Only student tokens can be revoked individually",
                ));
            }

            token.revoked = true;
            tx.update_token(&token).await?;

            if let Some(mut binding) = tx.binding_by_token(&token.token).await? {
                if !binding.locked {
                    binding.locked = true;
                    binding.lock_reason = Some(lock_reason::STUDENT_REVOKED.to_string());
                    tx.update_binding(&binding).await?;
                }
            }

            events.push((
                EventType::StudentSessionRevoked,
                serde_json::json!({
                    "session_id": auth.session.id,
                    "token": token.token,
                }),
            ));

            Ok(())
        }
        .await;

        self.finish(tx, result, events).await
    }

    /// Pause the session. Heartbeats keep recording but staleness tiers do
    /// not apply while paused. Admin only.
    pub async fn pause_session(&self, signature: &str) -> Result<ExamSession, EngineError> {
        self.set_pause_state(signature, true).await
    }

    /// Resume a paused session. Admin only.
    pub async fn resume_session(&self, signature: &str) -> Result<ExamSession, EngineError> {
        self.set_pause_state(signature, false).await
    }

    async fn set_pause_state(
        &self,
        signature: &str,
        pause: bool,
    ) -> Result<ExamSession, EngineError> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let mut events = PendingEvents::new();
        let result = async {
            let auth = self.authenticate_admin_tx(&mut *tx, signature, now).await?;
            let mut session = tx
                .session_for_update(&auth.session.id)
                .await?
                .ok_or_else(|| EngineError::not_found("SESSION_NOT_FOUND", "Unknown session"))?;

            if pause {
                if session.status != SessionStatus::InProgress {
                    return Err(EngineError::conflict(
                        "SESSION_NOT_RUNNING",
                        "Only a running session can be paused",
                    ));
                }
                session.status = SessionStatus::Paused;
            } else {
                if session.status != SessionStatus::Paused {
                    return Err(EngineError::conflict(
                        "SESSION_NOT_PAUSED",
                        "Session is not paused",
                    ));
                }
                session.status = SessionStatus::InProgress;
            }
            tx.update_session(&session).await?;

            events.push((
                if pause {
                    EventType::SessionPaused
                } else {
                    EventType::SessionResumed
                },
                serde_json::json!({ "session_id": session.id }),
            ));

            Ok(session)
        }
        .await;

        self.finish(tx, result, events).await
    }

    /// Unlock a student binding and hand it a fresh signature. The admin
    /// recovery path for risk and violation locks. Restores a LOCKED
    /// session to IN_PROGRESS; FINISHED and REVOKED stay terminal. Admin
    /// only.
    pub async fn reissue_student_signature(
        &self,
        signature: &str,
        binding_id: &str,
    ) -> Result<ReissueSignatureOutput, EngineError> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let mut events = PendingEvents::new();
        let result = async {
            let auth = self.authenticate_admin_tx(&mut *tx, signature, now).await?;
            let context = tx
                .binding_context(binding_id)
                .await?
                .ok_or_else(|| EngineError::not_found("BINDING_NOT_FOUND", "Unknown binding"))?;
            let mut binding = context.binding;
            let mut session = context.session;

            if session.id != auth.session.id {
                return Err(EngineError::not_found("BINDING_NOT_FOUND", "Unknown binding"));
            }
            if matches!(
                session.status,
                SessionStatus::Finished | SessionStatus::Revoked
            ) {
                return Err(EngineError::conflict(
                    "SESSION_ENDED",
                    "Session has already ended",
                ));
            }
            if context.token.revoked {
                return Err(EngineError::conflict(
                    "TOKEN_REVOKED",
                    "The underlying token has been revoked",
                ));
            }

            binding.locked = false;
            binding.lock_reason = None;
            binding.signature_version += 1;
            binding.last_seen_at = now;
            tx.update_binding(&binding).await?;

            if session.status == SessionStatus::Locked {
                session.status = SessionStatus::InProgress;
                session.end_time = None;
                tx.update_session(&session).await?;
            }

            let fresh = self.codec.sign(
                &session.id,
                &binding.id,
                binding.signature_version,
                binding.role,
                now,
            );

            events.push((
                EventType::SignatureReissued,
                serde_json::json!({
                    "session_id": session.id,
                    "binding_id": binding.id,
                }),
            ));

            Ok(ReissueSignatureOutput {
                binding_id: binding.id,
                signature: fresh,
                session_status: session.status,
            })
        }
        .await;

        self.finish(tx, result, events).await
    }

    /// Full proctor monitor view: every token with its live status, plus
    /// aggregate counts. Admin only.
    pub async fn monitor(&self, signature: &str) -> Result<MonitorOutput, EngineError> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;
        let result = async {
            let auth = self.authenticate_admin_tx(&mut *tx, signature, now).await?;
            let session = auth.session;

            let tokens = tx.tokens_by_session(&session.id).await?;
            let bindings = tx.bindings_by_session(&session.id).await?;
            let heartbeat_count = tx.heartbeats_by_session(&session.id).await?.len();
            let violation_count = tx.violations_by_session(&session.id).await?.len();

            let monitor_tokens = tokens
                .into_iter()
                .map(|token| {
                    let binding = bindings.iter().find(|b| b.token == token.token);
                    let status = token_live_status(
                        &token,
                        binding,
                        now,
                        self.config.heartbeat_timeout_secs,
                    );
                    MonitorToken {
                        token: token.token,
                        role: token.role,
                        status,
                        binding_id: binding.map(|b| b.id.clone()),
                        risk_score: binding.map(|b| b.risk_score).unwrap_or(0),
                        locked: binding.map(|b| b.locked).unwrap_or(false),
                        lock_reason: binding.and_then(|b| b.lock_reason.clone()),
                        last_seen_at: binding.map(|b| b.last_seen_at),
                    }
                })
                .collect();

            Ok(MonitorOutput {
                session,
                tokens: monitor_tokens,
                heartbeat_count,
                violation_count,
            })
        }
        .await;
        let _ = tx.rollback().await;
        result
    }
}

/// Live status precedence: expired > revoked > issued > offline > online.
fn token_live_status(
    token: &crate::model::SessionToken,
    binding: Option<&DeviceBinding>,
    now: DateTime<Utc>,
    heartbeat_timeout_secs: i64,
) -> TokenLiveStatus {
    if token.expires_at.map(|t| t < now).unwrap_or(false) {
        return TokenLiveStatus::Expired;
    }
    if token.revoked {
        return TokenLiveStatus::Revoked;
    }
    if !token.claimed {
        return TokenLiveStatus::Issued;
    }
    match binding {
        Some(binding) => {
            let stale = (now - binding.last_seen_at).num_seconds() > heartbeat_timeout_secs;
            if stale {
                TokenLiveStatus::Offline
            } else {
                TokenLiveStatus::Online
            }
        }
        None => TokenLiveStatus::Issued,
    }
}

/// PIN digest, salted with the session id so equal PINs in different
/// sessions produce different hashes.
fn hash_pin(session_id: &str, pin: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("pin:{session_id}:{pin}").as_bytes());
    hex::encode(hasher.finalize())
}
