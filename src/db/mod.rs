// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Storage interface.
//!
//! The session store never talks to a database driver directly; it consumes
//! this narrow transactional interface. Every multi-step mutation runs
//! inside one [`StoreTx`], and implementations must give `SELECT ... FOR
//! UPDATE` semantics to the `*_for_update` methods so competing claims and
//! racing sweeps serialize instead of corrupting state. Any relational
//! engine with row-level locking can back this trait; the bundled
//! [`MemoryDb`] reference engine backs the binary and the test suite.

mod memory;

pub use memory::MemoryDb;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::model::{
    BrowserTarget, DeviceBinding, ExamSession, Heartbeat, PinTemplate, ProctorPin,
    SessionArchive, SessionToken, Violation, WhitelistEntry,
};

/// The joined view authentication needs: a binding, the token it claimed,
/// and the session that token belongs to.
#[derive(Debug, Clone)]
pub struct BindingContext {
    pub binding: DeviceBinding,
    pub token: SessionToken,
    pub session: ExamSession,
}

/// Opens transactions.
#[async_trait]
pub trait Database: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, EngineError>;
}

/// One atomic unit of work. Dropping a transaction without committing
/// discards it.
#[async_trait]
pub trait StoreTx: Send {
    async fn commit(self: Box<Self>) -> Result<(), EngineError>;
    async fn rollback(self: Box<Self>) -> Result<(), EngineError>;

    // -- sessions -----------------------------------------------------------

    async fn insert_session(&mut self, row: &ExamSession) -> Result<(), EngineError>;
    async fn session(&mut self, id: &str) -> Result<Option<ExamSession>, EngineError>;
    /// Read with a row lock held until commit.
    async fn session_for_update(&mut self, id: &str) -> Result<Option<ExamSession>, EngineError>;
    async fn update_session(&mut self, row: &ExamSession) -> Result<(), EngineError>;
    /// Terminal sessions whose end time is older than `ended_before`,
    /// oldest first, at most `limit`. Implementations must skip rows
    /// already locked by a concurrent sweep (`FOR UPDATE SKIP LOCKED`).
    async fn terminal_sessions_for_archive(
        &mut self,
        ended_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExamSession>, EngineError>;
    /// Delete a session and every dependent live row. The sole deletion
    /// path for session data.
    async fn delete_session_graph(&mut self, id: &str) -> Result<(), EngineError>;

    // -- tokens -------------------------------------------------------------

    async fn insert_token(&mut self, row: &SessionToken) -> Result<(), EngineError>;
    /// Read with a row lock so two concurrent claims of one token
    /// serialize.
    async fn token_for_update(&mut self, token: &str) -> Result<Option<SessionToken>, EngineError>;
    async fn update_token(&mut self, row: &SessionToken) -> Result<(), EngineError>;
    async fn tokens_by_session(&mut self, session_id: &str)
        -> Result<Vec<SessionToken>, EngineError>;

    // -- bindings -----------------------------------------------------------

    async fn insert_binding(&mut self, row: &DeviceBinding) -> Result<(), EngineError>;
    async fn binding(&mut self, id: &str) -> Result<Option<DeviceBinding>, EngineError>;
    async fn binding_by_token(&mut self, token: &str)
        -> Result<Option<DeviceBinding>, EngineError>;
    async fn update_binding(&mut self, row: &DeviceBinding) -> Result<(), EngineError>;
    async fn bindings_by_session(
        &mut self,
        session_id: &str,
    ) -> Result<Vec<DeviceBinding>, EngineError>;
    /// Binding joined through its token to its session.
    async fn binding_context(&mut self, binding_id: &str)
        -> Result<Option<BindingContext>, EngineError>;
    /// Every unlocked student binding whose session is non-terminal,
    /// paired with that session. The liveness watcher's working set.
    async fn live_student_bindings(
        &mut self,
    ) -> Result<Vec<(DeviceBinding, ExamSession)>, EngineError>;

    // -- heartbeats & violations -------------------------------------------

    /// Returns the assigned row id.
    async fn insert_heartbeat(&mut self, row: &Heartbeat) -> Result<u64, EngineError>;
    async fn heartbeats_by_session(
        &mut self,
        session_id: &str,
    ) -> Result<Vec<Heartbeat>, EngineError>;
    /// Returns the assigned row id.
    async fn insert_violation(&mut self, row: &Violation) -> Result<u64, EngineError>;
    async fn violations_by_session(
        &mut self,
        session_id: &str,
    ) -> Result<Vec<Violation>, EngineError>;

    // -- whitelist ----------------------------------------------------------

    /// Insert if absent. Returns whether a row was added.
    async fn add_whitelist_url(
        &mut self,
        session_id: &str,
        url: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, EngineError>;
    async fn whitelist(&mut self, session_id: &str) -> Result<Vec<WhitelistEntry>, EngineError>;

    // -- browser target -----------------------------------------------------

    async fn upsert_browser_target(&mut self, row: &BrowserTarget) -> Result<(), EngineError>;
    async fn browser_target(&mut self, session_id: &str)
        -> Result<Option<BrowserTarget>, EngineError>;

    // -- proctor pins -------------------------------------------------------

    async fn upsert_pin_template(&mut self, row: &PinTemplate) -> Result<(), EngineError>;
    async fn pin_template(&mut self, session_id: &str)
        -> Result<Option<PinTemplate>, EngineError>;
    async fn upsert_proctor_pin(&mut self, row: &ProctorPin) -> Result<(), EngineError>;
    async fn proctor_pin(
        &mut self,
        session_id: &str,
        binding_id: &str,
    ) -> Result<Option<ProctorPin>, EngineError>;
    async fn proctor_pins_by_session(
        &mut self,
        session_id: &str,
    ) -> Result<Vec<ProctorPin>, EngineError>;

    // -- archive ------------------------------------------------------------

    /// Returns the assigned archive id.
    async fn insert_archive(&mut self, row: &SessionArchive) -> Result<u64, EngineError>;
}
