// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

use examgate::broadcast::BroadcastHub;
use examgate::clock::SystemClock;
use examgate::config::EngineConfig;
use examgate::db::MemoryDb;
use examgate::server::Server;
use examgate::store::SessionStore;
use examgate::watcher::{spawn_archival_sweep, spawn_liveness_watcher};

const DEFAULT_PORT: u16 = 8719;

/// Session authority for proctored-exam lockdown clients.
#[derive(Parser, Debug)]
#[command(name = "examgate", version, about)]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Bind address. Use 0.0.0.0 to accept connections from exam devices.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Disable the background liveness and archival sweeps
    #[arg(long)]
    no_sweeps: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "examgate=info,tower_http=warn".into()),
        )
        .init();

    let config = EngineConfig::from_env();
    if config.signature_secret == "dev-only-secret" {
        tracing::warn!(
            "EXAMGATE_SIGNATURE_SECRET is not set; using the development secret. \
            Do not run a real exam with this key."
        );
    }

    let hub = Arc::new(BroadcastHub::default());
    let store = SessionStore::new(
        Arc::new(MemoryDb::new()),
        config,
        Arc::new(SystemClock),
        hub.clone(),
    );

    if !args.no_sweeps {
        spawn_liveness_watcher(store.clone());
        spawn_archival_sweep(store.clone());
    }

    Server::new(args.port, store, hub)
        .with_bind_address(args.bind)
        .start()
        .await
}
