// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! In-memory reference storage engine.
//!
//! Serializes whole transactions behind one async mutex: `begin` takes the
//! engine lock and clones the state, writes go to the working copy, and
//! `commit` swaps the copy back in. Rollback (or dropping the transaction)
//! discards the copy. Coarser than the row-level locking a SQL backend
//! provides, but it gives the same observable guarantees, which is what the
//! test suite and the demo binary need.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::db::{BindingContext, Database, StoreTx};
use crate::error::EngineError;
use crate::model::{
    BrowserTarget, DeviceBinding, ExamSession, Heartbeat, PinTemplate, ProctorPin,
    SessionArchive, SessionToken, Violation, WhitelistEntry,
};

#[derive(Debug, Clone, Default)]
struct MemState {
    sessions: HashMap<String, ExamSession>,
    tokens: HashMap<String, SessionToken>,
    bindings: HashMap<String, DeviceBinding>,
    heartbeats: Vec<Heartbeat>,
    violations: Vec<Violation>,
    whitelist: Vec<WhitelistEntry>,
    targets: HashMap<String, BrowserTarget>,
    pin_templates: HashMap<String, PinTemplate>,
    proctor_pins: HashMap<(String, String), ProctorPin>,
    archives: Vec<SessionArchive>,
    next_heartbeat_id: u64,
    next_violation_id: u64,
    next_archive_id: u64,
}

/// The bundled storage engine.
#[derive(Clone, Default)]
pub struct MemoryDb {
    state: Arc<Mutex<MemState>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archived cold records, oldest first. Read-side helper for tests and
    /// tooling; archives are append-only so no transaction is needed.
    pub async fn archives(&self) -> Vec<SessionArchive> {
        self.state.lock().await.archives.clone()
    }

    /// Whether a session still exists in the live rows.
    pub async fn session_exists(&self, id: &str) -> bool {
        self.state.lock().await.sessions.contains_key(id)
    }
}

#[async_trait]
impl Database for MemoryDb {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, EngineError> {
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx { guard, work }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemState>,
    work: MemState,
}

impl MemoryTx {
    fn session_ids_tokens(&self, session_id: &str) -> Vec<String> {
        let mut tokens: Vec<&SessionToken> = self
            .work
            .tokens
            .values()
            .filter(|t| t.session_id == session_id)
            .collect();
        tokens.sort_by(|a, b| (a.created_at, &a.token).cmp(&(b.created_at, &b.token)));
        tokens.into_iter().map(|t| t.token.clone()).collect()
    }

    fn session_binding_ids(&self, session_id: &str) -> Vec<String> {
        let tokens = self.session_ids_tokens(session_id);
        let mut ids: Vec<String> = self
            .work
            .bindings
            .values()
            .filter(|b| tokens.contains(&b.token))
            .map(|b| b.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(mut self: Box<Self>) -> Result<(), EngineError> {
        *self.guard = self.work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), EngineError> {
        // Dropping the working copy is the rollback.
        Ok(())
    }

    async fn insert_session(&mut self, row: &ExamSession) -> Result<(), EngineError> {
        self.work.sessions.insert(row.id.clone(), row.clone());
        Ok(())
    }

    async fn session(&mut self, id: &str) -> Result<Option<ExamSession>, EngineError> {
        Ok(self.work.sessions.get(id).cloned())
    }

    async fn session_for_update(&mut self, id: &str) -> Result<Option<ExamSession>, EngineError> {
        // The engine lock is already held for the whole transaction.
        Ok(self.work.sessions.get(id).cloned())
    }

    async fn update_session(&mut self, row: &ExamSession) -> Result<(), EngineError> {
        match self.work.sessions.get_mut(&row.id) {
            Some(existing) => {
                *existing = row.clone();
                Ok(())
            }
            None => Err(EngineError::internal(format!(
                "update of missing session {}",
                row.id
            ))),
        }
    }

    async fn terminal_sessions_for_archive(
        &mut self,
        ended_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExamSession>, EngineError> {
        let mut ended: Vec<ExamSession> = self
            .work
            .sessions
            .values()
            .filter(|s| {
                matches!(
                    s.status,
                    crate::model::SessionStatus::Finished | crate::model::SessionStatus::Revoked
                ) && s.end_time.map(|t| t <= ended_before).unwrap_or(false)
            })
            .cloned()
            .collect();
        ended.sort_by_key(|s| s.end_time);
        ended.truncate(limit);
        Ok(ended)
    }

    async fn delete_session_graph(&mut self, id: &str) -> Result<(), EngineError> {
        let binding_ids = self.session_binding_ids(id);
        let token_ids = self.session_ids_tokens(id);

        self.work
            .heartbeats
            .retain(|h| !binding_ids.contains(&h.binding_id));
        self.work
            .violations
            .retain(|v| !binding_ids.contains(&v.binding_id));
        for binding_id in &binding_ids {
            self.work.bindings.remove(binding_id);
        }
        for token in &token_ids {
            self.work.tokens.remove(token);
        }
        self.work.whitelist.retain(|w| w.session_id != id);
        self.work.targets.remove(id);
        self.work.pin_templates.remove(id);
        self.work
            .proctor_pins
            .retain(|(session_id, _), _| session_id != id);
        self.work.sessions.remove(id);
        Ok(())
    }

    async fn insert_token(&mut self, row: &SessionToken) -> Result<(), EngineError> {
        self.work.tokens.insert(row.token.clone(), row.clone());
        Ok(())
    }

    async fn token_for_update(&mut self, token: &str) -> Result<Option<SessionToken>, EngineError> {
        Ok(self.work.tokens.get(token).cloned())
    }

    async fn update_token(&mut self, row: &SessionToken) -> Result<(), EngineError> {
        match self.work.tokens.get_mut(&row.token) {
            Some(existing) => {
                *existing = row.clone();
                Ok(())
            }
            None => Err(EngineError::internal(format!(
                "update of missing token {}",
                row.token
            ))),
        }
    }

    async fn tokens_by_session(
        &mut self,
        session_id: &str,
    ) -> Result<Vec<SessionToken>, EngineError> {
        let mut rows: Vec<SessionToken> = self
            .work
            .tokens
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.created_at, &a.token).cmp(&(b.created_at, &b.token)));
        Ok(rows)
    }

    async fn insert_binding(&mut self, row: &DeviceBinding) -> Result<(), EngineError> {
        self.work.bindings.insert(row.id.clone(), row.clone());
        Ok(())
    }

    async fn binding(&mut self, id: &str) -> Result<Option<DeviceBinding>, EngineError> {
        Ok(self.work.bindings.get(id).cloned())
    }

    async fn binding_by_token(
        &mut self,
        token: &str,
    ) -> Result<Option<DeviceBinding>, EngineError> {
        Ok(self
            .work
            .bindings
            .values()
            .find(|b| b.token == token)
            .cloned())
    }

    async fn update_binding(&mut self, row: &DeviceBinding) -> Result<(), EngineError> {
        match self.work.bindings.get_mut(&row.id) {
            Some(existing) => {
                *existing = row.clone();
                Ok(())
            }
            None => Err(EngineError::internal(format!(
                "update of missing binding {}",
                row.id
            ))),
        }
    }

    async fn bindings_by_session(
        &mut self,
        session_id: &str,
    ) -> Result<Vec<DeviceBinding>, EngineError> {
        let tokens = self.session_ids_tokens(session_id);
        let mut rows: Vec<DeviceBinding> = self
            .work
            .bindings
            .values()
            .filter(|b| tokens.contains(&b.token))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(rows)
    }

    async fn binding_context(
        &mut self,
        binding_id: &str,
    ) -> Result<Option<BindingContext>, EngineError> {
        let binding = match self.work.bindings.get(binding_id) {
            Some(b) => b.clone(),
            None => return Ok(None),
        };
        let token = match self.work.tokens.get(&binding.token) {
            Some(t) => t.clone(),
            None => return Ok(None),
        };
        let session = match self.work.sessions.get(&token.session_id) {
            Some(s) => s.clone(),
            None => return Ok(None),
        };
        Ok(Some(BindingContext {
            binding,
            token,
            session,
        }))
    }

    async fn live_student_bindings(
        &mut self,
    ) -> Result<Vec<(DeviceBinding, ExamSession)>, EngineError> {
        let mut out = Vec::new();
        for binding in self.work.bindings.values() {
            if binding.locked || binding.role != crate::model::Role::Student {
                continue;
            }
            let Some(token) = self.work.tokens.get(&binding.token) else {
                continue;
            };
            let Some(session) = self.work.sessions.get(&token.session_id) else {
                continue;
            };
            if session.status.is_terminal() {
                continue;
            }
            out.push((binding.clone(), session.clone()));
        }
        out.sort_by(|a, b| (&a.0.created_at, &a.0.id).cmp(&(&b.0.created_at, &b.0.id)));
        Ok(out)
    }

    async fn insert_heartbeat(&mut self, row: &Heartbeat) -> Result<u64, EngineError> {
        self.work.next_heartbeat_id += 1;
        let mut row = row.clone();
        row.id = self.work.next_heartbeat_id;
        let id = row.id;
        self.work.heartbeats.push(row);
        Ok(id)
    }

    async fn heartbeats_by_session(
        &mut self,
        session_id: &str,
    ) -> Result<Vec<Heartbeat>, EngineError> {
        let binding_ids = self.session_binding_ids(session_id);
        Ok(self
            .work
            .heartbeats
            .iter()
            .filter(|h| binding_ids.contains(&h.binding_id))
            .cloned()
            .collect())
    }

    async fn insert_violation(&mut self, row: &Violation) -> Result<u64, EngineError> {
        self.work.next_violation_id += 1;
        let mut row = row.clone();
        row.id = self.work.next_violation_id;
        let id = row.id;
        self.work.violations.push(row);
        Ok(id)
    }

    async fn violations_by_session(
        &mut self,
        session_id: &str,
    ) -> Result<Vec<Violation>, EngineError> {
        let binding_ids = self.session_binding_ids(session_id);
        Ok(self
            .work
            .violations
            .iter()
            .filter(|v| binding_ids.contains(&v.binding_id))
            .cloned()
            .collect())
    }

    async fn add_whitelist_url(
        &mut self,
        session_id: &str,
        url: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let exists = self
            .work
            .whitelist
            .iter()
            .any(|w| w.session_id == session_id && w.url == url);
        if exists {
            return Ok(false);
        }
        self.work.whitelist.push(WhitelistEntry {
            session_id: session_id.to_string(),
            url: url.to_string(),
            created_at: at,
        });
        Ok(true)
    }

    async fn whitelist(&mut self, session_id: &str) -> Result<Vec<WhitelistEntry>, EngineError> {
        Ok(self
            .work
            .whitelist
            .iter()
            .filter(|w| w.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn upsert_browser_target(&mut self, row: &BrowserTarget) -> Result<(), EngineError> {
        match self.work.targets.get_mut(&row.session_id) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = row.clone();
                existing.created_at = created_at;
            }
            None => {
                self.work.targets.insert(row.session_id.clone(), row.clone());
            }
        }
        Ok(())
    }

    async fn browser_target(
        &mut self,
        session_id: &str,
    ) -> Result<Option<BrowserTarget>, EngineError> {
        Ok(self.work.targets.get(session_id).cloned())
    }

    async fn upsert_pin_template(&mut self, row: &PinTemplate) -> Result<(), EngineError> {
        self.work
            .pin_templates
            .insert(row.session_id.clone(), row.clone());
        Ok(())
    }

    async fn pin_template(
        &mut self,
        session_id: &str,
    ) -> Result<Option<PinTemplate>, EngineError> {
        Ok(self.work.pin_templates.get(session_id).cloned())
    }

    async fn upsert_proctor_pin(&mut self, row: &ProctorPin) -> Result<(), EngineError> {
        self.work.proctor_pins.insert(
            (row.session_id.clone(), row.binding_id.clone()),
            row.clone(),
        );
        Ok(())
    }

    async fn proctor_pin(
        &mut self,
        session_id: &str,
        binding_id: &str,
    ) -> Result<Option<ProctorPin>, EngineError> {
        Ok(self
            .work
            .proctor_pins
            .get(&(session_id.to_string(), binding_id.to_string()))
            .cloned())
    }

    async fn proctor_pins_by_session(
        &mut self,
        session_id: &str,
    ) -> Result<Vec<ProctorPin>, EngineError> {
        let mut rows: Vec<ProctorPin> = self
            .work
            .proctor_pins
            .values()
            .filter(|p| p.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.binding_id.cmp(&b.binding_id));
        Ok(rows)
    }

    async fn insert_archive(&mut self, row: &SessionArchive) -> Result<u64, EngineError> {
        self.work.next_archive_id += 1;
        let mut row = row.clone();
        row.id = self.work.next_archive_id;
        let id = row.id;
        self.work.archives.push(row);
        Ok(id)
    }
}
