// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! The Measurement Collection Module binary. Domain logic (sensor polling,
//! measurement ingestion) is out of scope; this wires up the Module
//! Scaffold end to end.

use std::sync::Arc;

use clap::Parser;
use hems_common::ModuleId;
use hems_ipc::registry::ChannelRegistry;
use hems_worker::{WorkerApp, WorkerArgs};
use hems_workers::{register_ping_handler, register_trivial_settings_handlers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = WorkerArgs::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.debug { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .init();

    let registry = Arc::new(ChannelRegistry::new());
    let app = WorkerApp::new(ModuleId::Collection, registry, args.debug, false)?;
    register_trivial_settings_handlers(&app);
    register_ping_handler(&app);
    app.run().await?;
    Ok(())
}
