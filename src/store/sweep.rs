// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Background sweeps.
//!
//! Two periodic jobs run against the store: the liveness sweep, which moves
//! sessions through the staleness tiers when heartbeats stop, and the
//! archival sweep, which moves ended sessions to cold storage after their
//! grace period. Both use one transaction per affected item so a failure on
//! one session never blocks the rest of the pass.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broadcast::EventType;
use crate::db::StoreTx;
use crate::error::EngineError;
use crate::model::{lock_reason, SessionArchive, SessionStatus};

use super::{PendingEvents, SessionStore};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LivenessSweepReport {
    pub checked: usize,
    pub degraded: usize,
    pub suspended: usize,
    pub locked: usize,
    pub recovered: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ArchiveSweepReport {
    pub scanned: usize,
    pub archived: usize,
}

/// Staleness tier a binding belongs in, by seconds since last heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Fresh,
    Degraded,
    Suspended,
    Lock,
}

impl SessionStore {
    /// One liveness pass over every unlocked student binding.
    pub async fn sweep_liveness(&self) -> Result<LivenessSweepReport, EngineError> {
        let now = self.clock.now();
        let mut report = LivenessSweepReport::default();

        // Snapshot the working set, then handle each binding in its own
        // transaction so one failure cannot poison the pass.
        let candidates = {
            let mut tx = self.db.begin().await?;
            let result = tx.live_student_bindings().await;
            let _ = tx.rollback().await;
            result?
        };

        for (binding, _) in candidates {
            report.checked += 1;
            match self.sweep_one_binding(&binding.id, now).await {
                Ok(Some(outcome)) => match outcome {
                    SweepOutcome::Degraded => report.degraded += 1,
                    SweepOutcome::Suspended => report.suspended += 1,
                    SweepOutcome::Locked => report.locked += 1,
                    SweepOutcome::Recovered => report.recovered += 1,
                },
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(binding_id = %binding.id, error = %err, "liveness sweep item failed");
                }
            }
        }

        Ok(report)
    }

    async fn sweep_one_binding(
        &self,
        binding_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SweepOutcome>, EngineError> {
        let mut tx = self.db.begin().await?;
        let mut events = PendingEvents::new();
        let result = self
            .sweep_one_binding_tx(&mut *tx, binding_id, now, &mut events)
            .await;

        self.finish(tx, result, events).await
    }

    async fn sweep_one_binding_tx(
        &self,
        tx: &mut dyn StoreTx,
        binding_id: &str,
        now: DateTime<Utc>,
        events: &mut PendingEvents,
    ) -> Result<Option<SweepOutcome>, EngineError> {
        // Re-read under the transaction; the snapshot may be stale.
        let Some(context) = tx.binding_context(binding_id).await? else {
            return Ok(None);
        };
        let mut binding = context.binding;
        let mut session = context.session;

        if binding.locked || session.status.is_terminal() {
            return Ok(None);
        }

        let stale_secs = (now - binding.last_seen_at).num_seconds();
        let tier = if stale_secs >= self.config.heartbeat_lock_secs {
            Tier::Lock
        } else if stale_secs >= self.config.heartbeat_suspend_secs {
            Tier::Suspended
        } else if stale_secs >= self.config.heartbeat_timeout_secs {
            Tier::Degraded
        } else {
            Tier::Fresh
        };

        if tier == Tier::Lock {
            binding.locked = true;
            binding.lock_reason = Some(lock_reason::HEARTBEAT_TIMEOUT.to_string());
            tx.update_binding(&binding).await?;
            events.push((
                EventType::SessionLocked,
                serde_json::json!({
                    "session_id": session.id,
                    "binding_id": binding.id,
                    "reason": lock_reason::HEARTBEAT_TIMEOUT,
                    "stale_secs": stale_secs,
                }),
            ));
            return Ok(Some(SweepOutcome::Locked));
        }

        // Tier transitions only apply inside the staleness family; a paused
        // session keeps its status no matter how stale its bindings get.
        if !session.status.is_staleness_family() {
            return Ok(None);
        }

        let target = match tier {
            Tier::Fresh => SessionStatus::InProgress,
            Tier::Degraded => SessionStatus::Degraded,
            Tier::Suspended => SessionStatus::Suspended,
            Tier::Lock => unreachable!("handled above"),
        };
        if session.status == target {
            return Ok(None);
        }

        let outcome = match target {
            SessionStatus::InProgress => SweepOutcome::Recovered,
            SessionStatus::Degraded => SweepOutcome::Degraded,
            _ => SweepOutcome::Suspended,
        };
        session.status = target;
        tx.update_session(&session).await?;

        let event = match outcome {
            SweepOutcome::Recovered => EventType::SessionRecovered,
            SweepOutcome::Degraded => EventType::SessionDegraded,
            _ => EventType::SessionSuspended,
        };
        events.push((
            event,
            serde_json::json!({
                "session_id": session.id,
                "binding_id": binding.id,
                "stale_secs": stale_secs,
            }),
        ));

        Ok(Some(outcome))
    }

    /// One archival pass: move ended sessions past their grace period to
    /// cold storage and delete their live rows.
    pub async fn sweep_archives(&self) -> Result<ArchiveSweepReport, EngineError> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::seconds(self.config.session_archive_grace_secs);
        let mut report = ArchiveSweepReport::default();

        let candidates = {
            let mut tx = self.db.begin().await?;
            let result = tx
                .terminal_sessions_for_archive(cutoff, self.config.session_cleanup_batch_size)
                .await;
            let _ = tx.rollback().await;
            result?
        };

        for candidate in candidates {
            report.scanned += 1;
            match self.archive_one_session(&candidate.id, cutoff, now).await {
                Ok(true) => report.archived += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(session_id = %candidate.id, error = %err, "archive sweep item failed");
                }
            }
        }

        Ok(report)
    }

    async fn archive_one_session(
        &self,
        session_id: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let mut tx = self.db.begin().await?;
        let mut events = PendingEvents::new();
        let result = self
            .archive_one_session_tx(&mut *tx, session_id, cutoff, now, &mut events)
            .await;

        self.finish(tx, result, events).await
    }

    async fn archive_one_session_tx(
        &self,
        tx: &mut dyn StoreTx,
        session_id: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        events: &mut PendingEvents,
    ) -> Result<bool, EngineError> {
        // Re-check under the row lock: a concurrent sweep may have archived
        // this session already, which keeps archival exactly-once.
        let Some(session) = tx.session_for_update(session_id).await? else {
            return Ok(false);
        };
        if !matches!(
            session.status,
            SessionStatus::Finished | SessionStatus::Revoked
        ) {
            return Ok(false);
        }
        if !session.end_time.map(|t| t <= cutoff).unwrap_or(false) {
            return Ok(false);
        }

        let tokens = tx.tokens_by_session(session_id).await?;
        let bindings = tx.bindings_by_session(session_id).await?;
        let heartbeats = tx.heartbeats_by_session(session_id).await?;
        let violations = tx.violations_by_session(session_id).await?;
        let whitelist = tx.whitelist(session_id).await?;
        let browser_target = tx.browser_target(session_id).await?;
        let pin_template = tx.pin_template(session_id).await?;
        let proctor_pins = tx.proctor_pins_by_session(session_id).await?;

        let payload = serde_json::json!({
            "session": session,
            "tokens": tokens,
            "bindings": bindings,
            "heartbeats": heartbeats,
            "violations": violations,
            "whitelist": whitelist,
            "browser_target": browser_target,
            "pin_template": pin_template,
            "proctor_pins": proctor_pins,
        });

        tx.insert_archive(&SessionArchive {
            id: 0,
            session_id: session_id.to_string(),
            session_status: session.status,
            payload,
            archived_at: now,
        })
        .await?;

        tx.delete_session_graph(session_id).await?;

        events.push((
            EventType::SessionArchived,
            serde_json::json!({
                "session_id": session_id,
                "status": session.status,
            }),
        ));

        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepOutcome {
    Degraded,
    Suspended,
    Locked,
    Recovered,
}
