// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! examgate - Session authority for proctored-exam lockdown clients
//!
//! Exam devices claim single-use tokens, receive short-lived capability
//! signatures, and stay admitted only while they keep heartbeating cleanly.
//! Risk accumulates from integrity signals and violation reports; crossing
//! the threshold locks the device out. Background sweeps degrade, suspend,
//! and finally lock silent devices, and move ended sessions to cold storage.
//!
//! # Core Modules
//!
//! - [`store`] - The session engine: claims, heartbeats, risk, admin control
//! - [`signature`] - HMAC capability signature codec
//! - [`risk`] - Heartbeat and violation risk scoring
//! - [`whitelist`] - Exam browser destination checks
//! - [`db`] - Narrow transactional storage interface and the bundled engine
//! - [`broadcast`] - Realtime event fan-out to proctor monitors
//! - [`watcher`] - Liveness and archival background loops
//! - [`server`] - HTTP/WebSocket adapter
//! - [`error`] - Error taxonomy with stable reason codes

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod risk;
pub mod server;
pub mod signature;
pub mod store;
pub mod watcher;
pub mod whitelist;

// Re-export the engine surface most callers need
pub use broadcast::{BroadcastHub, EventSink, EventType, MemorySink, NullSink, RealtimeEvent};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use db::{Database, MemoryDb, StoreTx};
pub use error::EngineError;
pub use model::{
    DeviceBinding, ExamSession, Role, SessionArchive, SessionStatus, SessionToken,
    TokenLiveStatus,
};
pub use risk::{heartbeat_risk_delta, violation_severity, HeartbeatSignals};
pub use signature::{SignatureCodec, SignatureError, SignaturePayload};
pub use store::{
    AuthContext, ClaimSessionInput, ClaimSessionOutput, CreateSessionInput, CreateSessionOutput,
    HeartbeatInput, HeartbeatOutput, ReconnectInput, ReconnectOutput, ReportEventInput,
    ReportEventOutput, SessionStore, SetProctorPinInput, VerifyPinOutcome,
};
pub use watcher::{spawn_archival_sweep, spawn_liveness_watcher};
