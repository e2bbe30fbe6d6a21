// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Realtime broadcaster.
//!
//! Fan-out of every state change to connected monitor subscribers. This is
//! observability only: subscribers cannot affect engine state, publishing is
//! best-effort, and a subscriber that connects late simply misses earlier
//! events. Mutations publish after their transaction commits and ignore the
//! outcome, so a slow or absent monitor can never block or fail a request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;

/// The fixed event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionCreated,
    SessionClaimed,
    Heartbeat,
    Violation,
    SessionLocked,
    SessionDegraded,
    SessionSuspended,
    SessionRecovered,
    SessionPaused,
    SessionResumed,
    SignatureReissued,
    SessionReconnected,
    WhitelistUpdated,
    ProctorPinUpdated,
    LaunchUrlUpdated,
    SessionFinished,
    SessionRevoked,
    StudentSessionRevoked,
    SessionArchived,
}

/// One broadcast event: `{type, timestamp, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl RealtimeEvent {
    pub fn new(event_type: EventType, timestamp: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            timestamp,
            payload,
        }
    }
}

/// Injected, replaceable event sink. Implementations must never block the
/// caller and must swallow their own failures.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: RealtimeEvent);
}

/// Fan-out hub over a tokio broadcast channel. Send errors (no subscribers,
/// lagged receivers) are deliberately ignored.
pub struct BroadcastHub {
    tx: broadcast::Sender<RealtimeEvent>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events. No replay of the past.
    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastHub {
    fn publish(&self, event: RealtimeEvent) {
        let _ = self.tx.send(event);
    }
}

/// Sink that drops everything. For tools that run the store headless.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: RealtimeEvent) {}
}

/// Sink that records everything, for asserting on emitted events in tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<RealtimeEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RealtimeEvent> {
        self.events.lock().expect("sink lock poisoned").clone()
    }

    /// Event types in the order they were published.
    pub fn types(&self) -> Vec<EventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: RealtimeEvent) {
        self.events.lock().expect("sink lock poisoned").push(event);
    }
}
