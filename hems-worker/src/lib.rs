// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! The Module Scaffold every worker binary builds on: CLI parsing,
//! messenger/logger wiring, mandatory settings-handler registration, and
//! the startup/shutdown sequence, grounded on
//! `original_source/src/hems/modules/automation/automation.cpp` and
//! `original_source/src/hems/modules/automation/main.cpp`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hems_common::{ExitLatch, ModuleId};
use hems_ipc::envelope::{SETTINGS_CHECK, SETTINGS_COMMIT, SETTINGS_INIT};
use hems_ipc::handler::BoxedHandler;
use hems_ipc::registry::ChannelRegistry;
use hems_ipc::Messenger;
use hems_log::{Level, Logger, RemoteLogger};

/// Shared `--debug`/`--help` surface every worker binary's `main` parses,
/// matching `original_source/src/hems/modules/automation/main.cpp`.
#[derive(Debug, clap::Parser)]
#[command(about = "A HEMS worker module", disable_help_flag = false)]
pub struct WorkerArgs {
    /// Launch with the debug configuration: log and print debug messages.
    #[arg(short, long)]
    pub debug: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Messenger(#[from] hems_ipc::error::MessengerError),
    #[error("settings handlers must be registered before run() (mandatory per spec.md §4.9)")]
    SettingsHandlersMissing,
}

/// Wraps a [`Messenger`] and a [`Logger`] with the bookkeeping every
/// worker needs: mandatory `SETTINGS_INIT`/`SETTINGS_CHECK`/
/// `SETTINGS_COMMIT` handlers, the start-handlers gate, and a clean
/// shutdown path driven by an [`ExitLatch`].
pub struct WorkerApp {
    module: ModuleId,
    messenger: Arc<Messenger>,
    logger: Arc<dyn Logger>,
    exit: Arc<ExitLatch>,
    settings_registered: AtomicBool,
    test_mode: bool,
}

impl WorkerApp {
    /// Opens this module's queues (already created by the Supervisor) and
    /// wires up a [`RemoteLogger`]. `test_mode` skips mandatory
    /// settings-handler enforcement and opens the gate immediately,
    /// mirroring the original's `test_mode` constructor argument.
    pub fn new(module: ModuleId, registry: Arc<ChannelRegistry>, debug: bool, test_mode: bool) -> Result<Arc<Self>, WorkerError> {
        let messenger = Messenger::new(module, registry, test_mode)?;
        let logger: Arc<dyn Logger> = Arc::new(RemoteLogger::new(module, debug, messenger.clone()));
        let exit = Arc::new(ExitLatch::new());

        logger.log(&format!("Starting {}.", module.long_name()), Level::Log);

        Ok(Arc::new(Self {
            module,
            messenger,
            logger,
            exit,
            settings_registered: AtomicBool::new(false),
            test_mode,
        }))
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }

    pub fn exit_latch(&self) -> &Arc<ExitLatch> {
        &self.exit
    }

    /// Registers the three mandatory settings handlers, per spec.md §4.9
    /// ("every worker must handle the settings handshake regardless of
    /// whether it has any settings of its own"). Must be called before
    /// [`Self::run`] outside of test mode.
    pub fn register_settings_handlers(&self, init: BoxedHandler, check: BoxedHandler, commit: BoxedHandler) {
        self.messenger.register_handler(SETTINGS_INIT, init);
        self.messenger.register_handler(SETTINGS_CHECK, check);
        self.messenger.register_handler(SETTINGS_COMMIT, commit);
        self.settings_registered.store(true, Ordering::Release);
    }

    /// Registers a handler for an ordinary (non-negative) subtype.
    pub fn register_handler(&self, subtype: i32, handler: BoxedHandler) {
        self.messenger.register_handler(subtype, handler);
    }

    /// Marks `subtype` acceptable even before this worker's first
    /// `SETTINGS_INIT`, per spec.md §8 invariant 5.
    pub fn allow_before_init(&self, subtype: i32) {
        self.messenger.allow_before_init(subtype);
    }

    /// Begins listening for messages, opens the start-handlers gate, and
    /// blocks until the exit latch fires, then drains in-flight handlers
    /// and returns. Mirrors `automation.cpp`'s constructor-then-`exit_sem`
    /// sequence, with the gate opening in place of calling
    /// `start_handlers()` from a separate method.
    pub async fn run(self: Arc<Self>) -> Result<(), WorkerError> {
        if !self.test_mode && !self.settings_registered.load(Ordering::Acquire) {
            return Err(WorkerError::SettingsHandlersMissing);
        }

        let inbound = tokio::spawn(self.messenger.clone().run_inbound_loop());
        let response = tokio::spawn(self.messenger.clone().run_response_loop());

        self.logger.log("Listening for messages.", Level::Log);
        self.messenger.open_gate();
        self.logger.log("Begin handling incoming messages.", Level::Log);

        hems_common::exit::install_signal_handlers(self.exit.clone());
        self.exit.wait().await;

        self.logger.log(&format!("Shutting down {}.", self.module.long_name()), Level::Log);
        let _ = self.messenger.send_end_listen_loop(self.module);
        let _ = inbound.await;
        response.abort();

        self.logger.log(
            &format!(
                "Successfully shut down {}, stop listening for messages.",
                self.module.long_name()
            ),
            Level::Log,
        );
        Ok(())
    }
}
