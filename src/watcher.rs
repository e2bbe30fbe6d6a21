// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Background task runners.
//!
//! Thin tokio loops around the store sweeps. Each loop logs its report at
//! debug when something changed and warns on errors; an error never stops
//! the loop.

use std::time::Duration;
use tokio::task::JoinHandle;

use crate::store::SessionStore;

/// Spawn the liveness watcher: polls binding staleness on a fixed interval
/// and drives the staleness tiers.
pub fn spawn_liveness_watcher(store: SessionStore) -> JoinHandle<()> {
    let interval_secs = store.config().heartbeat_watch_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match store.sweep_liveness().await {
                Ok(report) => {
                    if report.degraded + report.suspended + report.locked + report.recovered > 0 {
                        tracing::debug!(
                            checked = report.checked,
                            degraded = report.degraded,
                            suspended = report.suspended,
                            locked = report.locked,
                            recovered = report.recovered,
                            "liveness sweep"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "liveness sweep failed");
                }
            }
        }
    })
}

/// Spawn the archival sweep: moves ended sessions to cold storage once
/// their grace period has passed.
pub fn spawn_archival_sweep(store: SessionStore) -> JoinHandle<()> {
    let interval_secs = store.config().session_archive_grace_secs.max(1) as u64;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match store.sweep_archives().await {
                Ok(report) => {
                    if report.archived > 0 {
                        tracing::debug!(
                            scanned = report.scanned,
                            archived = report.archived,
                            "archive sweep"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "archive sweep failed");
                }
            }
        }
    })
}
