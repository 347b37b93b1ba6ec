// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared scaffolding for the six thin worker binaries. None of these
//! modules' actual domain logic (persistence, measurement collection,
//! inference, automation rules, model training, or UI surface) is in
//! scope here — each binary exists only to demonstrate the Module
//! Scaffold (`hems-worker`) wired up end to end, per spec.md §1's
//! explicit non-goal of implementing the workers' own domains.

use std::sync::Arc;

use hems_ipc::handler::{HandlerCtx, HandlerOutcome};
use hems_ipc::settings::SettingsCode;
use hems_log::{Level, Logger};
use hems_worker::WorkerApp;

/// Subtype a demo `ping` handler listens on, echoing its payload back with
/// response code `0`. Stands in for a module's real message handlers.
pub const PING: i32 = 1;

/// Registers the three mandatory settings handlers with the simplest
/// correct behavior: no persisted settings to report, every proposed
/// settings value is accepted, and a committed value is merely logged.
/// Workers with real settings to manage replace these with their own.
pub fn register_trivial_settings_handlers(app: &Arc<WorkerApp>) {
    app.register_settings_handlers(
        Arc::new(|_ctx: HandlerCtx| async move {
            Ok(HandlerOutcome::Response {
                code: SettingsCode::NoneAvailable.to_wire(),
                payload: Vec::new(),
            })
        }),
        Arc::new(|_ctx: HandlerCtx| async move {
            Ok(HandlerOutcome::Response {
                code: SettingsCode::Accepted.to_wire(),
                payload: Vec::new(),
            })
        }),
        {
            let app = app.clone();
            Arc::new(move |ctx: HandlerCtx| {
                let logger = app.logger().clone();
                async move {
                    logger.log(
                        &format!("Committed settings: {}", String::from_utf8_lossy(&ctx.payload)),
                        Level::Dbg,
                    );
                    Ok(HandlerOutcome::Command)
                }
            })
        },
    );
}

/// Registers a demo request handler on [`PING`] that simply echoes its
/// payload, illustrating the shape of an ordinary module handler.
pub fn register_ping_handler(app: &Arc<WorkerApp>) {
    app.register_handler(
        PING,
        Arc::new(|ctx: HandlerCtx| async move { Ok(HandlerOutcome::ok(ctx.payload)) }),
    );
}
