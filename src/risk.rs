// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Risk scoring engine.
//!
//! Pure, stateless scoring of client integrity signals. Heartbeat flags map
//! to additive deltas; violation types map to fixed severities. The session
//! store owns how scores accumulate (it takes the max of the computed score
//! and anything the client self-reports, so a client can only ever raise its
//! own score, never lower it).

use serde::{Deserialize, Serialize};

/// Integrity flags carried by one heartbeat. Every field is optional on
/// the wire; absent flags read as their default, so a minimal ping does
/// not score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSignals {
    /// Whether the exam app currently holds focus.
    pub focus: bool,
    /// Split-screen / multi-window mode detected.
    pub multi_window: bool,
    /// Client-reported network state ("stable", "unstable", ...).
    pub network_state: Option<String>,
    /// Screen overlay detected on top of the exam app.
    pub overlay_detected: bool,
    /// An accessibility service is driving the device.
    pub accessibility_active: bool,
    /// Debugger attached.
    pub debug_detected: bool,
    /// Running inside an emulator.
    pub emulator_detected: bool,
    /// Rooted device.
    pub rooted: bool,
}

impl Default for HeartbeatSignals {
    fn default() -> Self {
        Self {
            focus: true,
            multi_window: false,
            network_state: None,
            overlay_detected: false,
            accessibility_active: false,
            debug_detected: false,
            emulator_detected: false,
            rooted: false,
        }
    }
}

/// Additive risk delta for one heartbeat. Each signal contributes
/// independently.
pub fn heartbeat_risk_delta(signals: &HeartbeatSignals) -> i64 {
    let mut score = 0;

    if !signals.focus {
        score += 3;
    }
    if signals.multi_window {
        score += 5;
    }
    if signals.network_state.as_deref() == Some("unstable") {
        score += 2;
    }
    if signals.overlay_detected {
        score += 5;
    }
    if signals.accessibility_active {
        score += 5;
    }
    if signals.debug_detected || signals.emulator_detected || signals.rooted {
        score += 2;
    }

    score
}

/// Fixed severity for a reported violation type. Unknown types count 1 so a
/// client cannot hide behind an unrecognized label.
pub fn violation_severity(event_type: &str) -> i64 {
    match event_type {
        "APP_BACKGROUND" => 3,
        "OVERLAY_DETECTED" => 5,
        "ACCESSIBILITY_ACTIVE" => 5,
        "NETWORK_DROP" => 2,
        "REPEATED_VIOLATION" => 6,
        "MULTI_WINDOW" => 4,
        "FOCUS_LOST" => 3,
        "MEDIA_PROJECTION_ATTEMPT" => 2,
        _ => 1,
    }
}
