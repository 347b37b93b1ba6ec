// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! The Supervisor: creates the fabric's queues, launches and watches every
//! worker process, and runs the settings handshake, grounded on
//! `original_source/src/hems/modules/launcher/launcher.cpp`.

pub mod cli;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hems_common::{ExitLatch, ModuleId};
use hems_ipc::handler::{HandlerCtx, HandlerOutcome};
use hems_ipc::registry::ChannelRegistry;
use hems_ipc::settings::Settings;
use hems_ipc::{default_send_timeout, Messenger};
use hems_log::{Level, LocalLogger, LogEvent, Logger, LOG_EVENT_SUBTYPE};
use tokio::sync::Notify;
use tokio::time::timeout;

use cli::{SupervisorArgs, WorkerSpec};

const GRACEFUL_SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Storage's `MSG_GET_SETTINGS` subtype, used by [`Supervisor::init_settings`]
/// to ask Storage directly for any settings from a prior run before
/// broadcasting them to the rest of the fabric, per SPEC_FULL.md §4.5
/// ("issues this as subtype 0 against storage's pre-init whitelist").
/// Storage's own handling of this subtype is a domain-specific concern
/// outside this crate's scope.
const MSG_GET_SETTINGS: i32 = 0;
const GET_SETTINGS_SUCCESS: i32 = 0;
const GET_SETTINGS_NONE_AVAILABLE: i32 = 1;

pub struct Supervisor {
    messenger: Arc<Messenger>,
    logger: Arc<LocalLogger>,
    exit: Arc<ExitLatch>,
    debug: bool,
    worker_specs: Vec<WorkerSpec>,
    children: std::sync::Mutex<HashMap<ModuleId, tokio::process::Child>>,
    watch_count: AtomicUsize,
    watch_notify: Notify,
    exit_status: AtomicI32,
}

impl Supervisor {
    pub fn new(args: SupervisorArgs) -> anyhow::Result<Arc<Self>> {
        let logger = Arc::new(LocalLogger::new(ModuleId::Supervisor, args.debug, &args.log));
        logger.log(&format!("Starting {}.", ModuleId::Supervisor.long_name()), Level::Log);

        ChannelRegistry::unlink_all();
        ChannelRegistry::create_all()?;
        logger.log("Message queues created successfully.", Level::Dbg);

        let registry = Arc::new(ChannelRegistry::new());
        let messenger = Messenger::new(ModuleId::Supervisor, registry, false)?;
        messenger.register_handler(LOG_EVENT_SUBTYPE, Arc::new({
            let logger = logger.clone();
            move |ctx: HandlerCtx| {
                let logger = logger.clone();
                async move {
                    if let Ok(event) = hems_ipc::codec::decode::<LogEvent>(&ctx.payload) {
                        logger.log_from_source(&event.message, event.level, event.source);
                    }
                    Ok(HandlerOutcome::Command)
                }
            }
        }));

        Ok(Arc::new(Self {
            messenger,
            logger,
            exit: Arc::new(ExitLatch::new()),
            debug: args.debug,
            worker_specs: args.worker_specs(),
            children: std::sync::Mutex::new(HashMap::new()),
            watch_count: AtomicUsize::new(0),
            watch_notify: Notify::new(),
            exit_status: AtomicI32::new(0),
        }))
    }

    pub fn exit_latch(&self) -> &Arc<ExitLatch> {
        &self.exit
    }

    /// Runs the Supervisor to completion, returning the process exit code.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<i32> {
        let inbound = tokio::spawn(self.messenger.clone().run_inbound_loop());
        let response = tokio::spawn(self.messenger.clone().run_response_loop());
        self.logger.log("Listening for messages.", Level::Log);

        if !self.debug {
            self.launch_workers()?;
        }

        let init_settings = tokio::spawn(self.clone().init_settings());

        self.messenger.open_gate();
        self.logger.log("Begin handling incoming messages.", Level::Log);

        hems_common::exit::install_signal_handlers(self.exit.clone());

        let status = self.exit.wait().await;
        self.exit_status.store(status, Ordering::Release);

        self.logger.log(&format!("Shutting down {}.", ModuleId::Supervisor.long_name()), Level::Log);
        init_settings.abort();

        if !self.debug {
            self.shut_down_workers().await;
        }

        let _ = self.messenger.send_end_listen_loop(ModuleId::Supervisor);
        let _ = inbound.await;
        response.abort();

        self.logger.log(
            &format!("Successfully shut down {}, stop listening for messages.", ModuleId::Supervisor.long_name()),
            Level::Log,
        );

        ChannelRegistry::unlink_all();
        Ok(self.exit_status.load(Ordering::Acquire))
    }

    fn launch_workers(self: &Arc<Self>) -> anyhow::Result<()> {
        for spec in &self.worker_specs {
            if !spec.path.exists() {
                self.logger.log(
                    &format!("Cannot find binary '{}' for {}, aborting.", spec.path.display(), spec.module.long_name()),
                    Level::Err,
                );
                anyhow::bail!("missing worker binary for {:?}", spec.module);
            }

            let child = tokio::process::Command::new(&spec.path)
                .args(&spec.args)
                .spawn()
                .map_err(|e| anyhow::anyhow!("could not start {:?}: {e}", spec.module))?;

            self.children.lock().unwrap().insert(spec.module, child);
            self.watch_count.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(self.clone().watch_worker(spec.module));
        }
        Ok(())
    }

    async fn watch_worker(self: Arc<Self>, module: ModuleId) {
        let child = self.children.lock().unwrap().remove(&module);
        let Some(mut child) = child else { return };

        let status = child.wait().await;

        let exit_code = match status {
            Ok(status) => status.code().unwrap_or(1),
            Err(e) => {
                self.logger.log(&format!("Error watching {}: {e}", module.long_name()), Level::Err);
                1
            }
        };

        self.watch_count.fetch_sub(1, Ordering::SeqCst);
        self.watch_notify.notify_waiters();

        if exit_code != 0 {
            self.logger.log(
                &format!("{} terminated with status {exit_code}, aborting.", module.long_name()),
                Level::Err,
            );
        }
        self.exit.exit(exit_code);
    }

    async fn shut_down_workers(&self) {
        {
            let children = self.children.lock().unwrap();
            for (module, child) in children.iter() {
                self.logger.log(&format!("Signaling {} to shut down.", module.long_name()), Level::Log);
                if let Some(pid) = child.id() {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::Signal::SIGTERM,
                    );
                }
            }
        }

        self.logger.log("Waiting for modules to shut down gracefully ...", Level::Log);
        loop {
            if self.watch_count.load(Ordering::SeqCst) == 0 {
                break;
            }
            let notified = self.watch_notify.notified();
            if self.watch_count.load(Ordering::SeqCst) == 0 {
                break;
            }
            if timeout(GRACEFUL_SHUTDOWN_WAIT, notified).await.is_err() {
                self.logger.log(
                    "There was a timeout waiting for modules to shut down gracefully, terminating.",
                    Level::Err,
                );
                let children = self.children.lock().unwrap();
                for child in children.values() {
                    if let Some(pid) = child.id() {
                        let _ = nix::sys::signal::kill(
                            nix::unistd::Pid::from_raw(pid as i32),
                            nix::sys::signal::Signal::SIGKILL,
                        );
                    }
                }
                break;
            }
        }

        if self.watch_count.load(Ordering::SeqCst) == 0 {
            self.logger.log("All modules shut down.", Level::Log);
        }
    }

    /// Asks Storage directly for any settings from a prior run, then runs
    /// the fabric-wide `SETTINGS_INIT` handshake, mirroring
    /// `launcher.cpp`'s `init_settings()`. Runs concurrently with the rest
    /// of construction, as in the original (a separate thread there, a
    /// separate task here).
    async fn init_settings(self: Arc<Self>) {
        self.logger.log("Initializing settings: Waiting for Data Storage Module ...", Level::Log);

        let stored = self
            .messenger
            .send_request(ModuleId::Storage, MSG_GET_SETTINGS, &[], default_send_timeout() * 2)
            .await;

        let current = match stored {
            Ok((GET_SETTINGS_SUCCESS, bytes)) => match hems_ipc::codec::decode::<Settings>(&bytes) {
                Ok(settings) => {
                    self.logger.log(&format!("Prior settings found: {settings}."), Level::Log);
                    settings
                }
                Err(e) => {
                    self.logger.log(&format!("Error decoding prior settings ({e}). Terminating."), Level::Err);
                    self.exit.exit(1);
                    return;
                }
            },
            Ok((GET_SETTINGS_NONE_AVAILABLE, _)) => {
                self.logger.log("No prior settings found.", Level::Log);
                Settings(serde_json::Value::Null)
            }
            Ok((code, _)) => {
                self.logger.log(&format!("Error retrieving settings for initialization ({code}). Terminating."), Level::Err);
                self.exit.exit(1);
                return;
            }
            Err(e) => {
                self.logger.log(&format!("Error retrieving settings for initialization ({e}). Terminating."), Level::Err);
                self.exit.exit(1);
                return;
            }
        };

        if let Err(e) = self.messenger.broadcast_settings_init(&current, default_send_timeout()).await {
            self.logger.log(&format!("Error during settings initialization ({e}). Terminating."), Level::Err);
            self.exit.exit(1);
            return;
        }

        self.logger.log("Settings initialization finished.", Level::Log);
    }
}
