// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! The Data Storage Module binary. Persistence itself is out of scope;
//! this wires up the Module Scaffold end to end and answers the
//! Supervisor's direct "get settings" query (SPEC_FULL.md §4.5) with
//! "none available", since there is no real persistence layer behind it.

use std::sync::Arc;

use clap::Parser;
use hems_common::ModuleId;
use hems_ipc::handler::{HandlerCtx, HandlerOutcome};
use hems_ipc::registry::ChannelRegistry;
use hems_worker::{WorkerApp, WorkerArgs};
use hems_workers::{register_ping_handler, register_trivial_settings_handlers};

/// Subtype the Supervisor queries directly, ahead of the broadcast
/// settings handshake, to learn whether a prior run left settings behind.
/// Matches the constant of the same name and value in `hems-supervisor`.
const MSG_GET_SETTINGS: i32 = 0;
const GET_SETTINGS_NONE_AVAILABLE: i32 = 1;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = WorkerArgs::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.debug { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .init();

    let registry = Arc::new(ChannelRegistry::new());
    let app = WorkerApp::new(ModuleId::Storage, registry, args.debug, false)?;

    // The Supervisor asks for this before Storage's own SETTINGS_INIT has
    // run, so it must be answerable from the pre-init whitelist.
    app.allow_before_init(MSG_GET_SETTINGS);
    app.register_handler(
        MSG_GET_SETTINGS,
        Arc::new(|_ctx: HandlerCtx| async move {
            Ok(HandlerOutcome::Response {
                code: GET_SETTINGS_NONE_AVAILABLE,
                payload: Vec::new(),
            })
        }),
    );

    register_trivial_settings_handlers(&app);
    register_ping_handler(&app);
    app.run().await?;
    Ok(())
}
