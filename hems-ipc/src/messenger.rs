// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! The Messenger Core: per-module request/response/command dispatch over
//! the Channel Registry, grounded on
//! `original_source/include/hems/common/messenger.h` and
//! `original_source/src/hems/modules/launcher/launcher.cpp` (the
//! settings-init sequencing), generalized per SPEC_FULL.md §4.4.
//!
//! Two deliberate departures from the original, both recorded in
//! SPEC_FULL.md §9:
//! - request/response correlation uses a [`CorrelationTable`] of one-shot
//!   channels instead of a condvar and a notified-id set;
//! - completed command-handler tasks are joined over an `mpsc` channel
//!   drained alongside a `JoinSet`, instead of the original's
//!   `JOIN_RCV_CMD` self-addressed envelope trick.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use hems_common::ModuleId;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;

use crate::codec;
use crate::envelope::{
    Envelope, Kind, END_LISTEN_LOOP, SETTINGS_CHECK, SETTINGS_COMMIT, SETTINGS_INIT,
};
use crate::error::{MessengerError, SendError};
use crate::handler::{BoxedHandler, HandlerCtx, HandlerOutcome};
use crate::registry::{ChannelRegistry, Family};
use crate::settings::{Settings, SettingsCode, SettingsError};
use crate::CorrelationTable;

/// Subtypes a handler may process before [`Messenger::open_gate`] is
/// called, per spec.md §4.4 ("the settings handshake runs ahead of the
/// module's own handlers").
fn pre_init_whitelist() -> HashSet<i32> {
    [SETTINGS_INIT, SETTINGS_CHECK, SETTINGS_COMMIT, END_LISTEN_LOOP]
        .into_iter()
        .collect()
}

/// Gate that blocks a module's ordinary handlers until its settings
/// handshake has completed. Realized as a `Notify` latch over a boolean,
/// mirroring [`hems_common::ExitLatch`]'s shape.
#[derive(Default)]
struct StartGate {
    open: Mutex<bool>,
    notify: Notify,
}

impl StartGate {
    fn new() -> Self {
        Self::default()
    }

    fn release(&self) {
        let mut open = self.open.lock().unwrap();
        if !*open {
            *open = true;
            drop(open);
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            if *self.open.lock().unwrap() {
                return;
            }
            let notified = self.notify.notified();
            if *self.open.lock().unwrap() {
                return;
            }
            notified.await;
        }
    }
}

/// Default send timeout, overridable per call and, per spec.md §7,
/// overridable process-wide via `HEMS_SEND_TIMEOUT_MS`.
pub fn default_send_timeout() -> Duration {
    Duration::from_millis(hems_common::config::default_send_timeout_ms())
}

pub struct Messenger {
    owner: ModuleId,
    registry: Arc<ChannelRegistry>,
    next_id: AtomicU32,
    correlation: Arc<CorrelationTable>,
    handlers: Mutex<HashMap<i32, BoxedHandler>>,
    gate: StartGate,
    /// `true` in worker-under-test builds, where the settings handshake is
    /// skipped and the gate opens immediately.
    test_mode: bool,
    inflight: Mutex<JoinSet<()>>,
    done_tx: mpsc::UnboundedSender<()>,
    done_rx: Mutex<mpsc::UnboundedReceiver<()>>,
    /// Set once this worker has processed its first `SETTINGS_INIT`, per
    /// spec.md §8 invariant 5. Workers in `test_mode` behave as always
    /// initialized.
    initialized: AtomicBool,
    /// Extra subtypes (beyond the reserved control subtypes) this worker
    /// accepts before it is initialized, registered via
    /// [`Messenger::allow_before_init`].
    pre_init_extra: Mutex<HashSet<i32>>,
    /// This module's currently applied settings, per spec.md §5. Set from
    /// the `SETTINGS_INIT` payload, then kept in sync on every matching
    /// `SETTINGS_COMMIT`.
    current_settings: Mutex<Option<Settings>>,
    /// The last settings proposal this module's `SETTINGS_CHECK` handler
    /// accepted, per spec.md §5. A `SETTINGS_COMMIT` only takes effect if
    /// its payload equals this value.
    proposed_settings: Mutex<Option<Settings>>,
}

impl Messenger {
    /// Opens this module's own inbound and response queues read-write.
    /// Queues must already have been created by the Supervisor.
    pub fn new(owner: ModuleId, registry: Arc<ChannelRegistry>, test_mode: bool) -> Result<Arc<Self>, MessengerError> {
        registry.open(owner, Family::Inbound, true)?;
        registry.open(owner, Family::Response, true)?;

        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            owner,
            registry,
            next_id: AtomicU32::new(1),
            correlation: Arc::new(CorrelationTable::new()),
            handlers: Mutex::new(HashMap::new()),
            gate: StartGate::new(),
            test_mode,
            inflight: Mutex::new(JoinSet::new()),
            done_tx,
            done_rx: Mutex::new(done_rx),
            initialized: AtomicBool::new(test_mode),
            pre_init_extra: Mutex::new(HashSet::new()),
            current_settings: Mutex::new(None),
            proposed_settings: Mutex::new(None),
        }))
    }

    /// Registers `subtype` as acceptable even before this worker's first
    /// `SETTINGS_INIT`, per spec.md §8 invariant 5 ("pre-init whitelist").
    pub fn allow_before_init(&self, subtype: i32) {
        self.pre_init_extra.lock().unwrap().insert(subtype);
    }

    pub fn owner(&self) -> ModuleId {
        self.owner
    }

    /// Registers a handler for `subtype` (or a reserved negative control
    /// subtype). Later registrations replace earlier ones for the same
    /// subtype.
    pub fn register_handler(&self, subtype: i32, handler: BoxedHandler) {
        self.handlers.lock().unwrap().insert(subtype, handler);
    }

    /// Opens the gate so non-whitelisted handlers may run. Called once the
    /// module's settings handshake has completed successfully.
    pub fn open_gate(&self) {
        self.gate.release();
    }

    fn next_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn write_payload(&self, payload: &[u8]) -> Result<String, MessengerError> {
        if payload.is_empty() {
            return Ok(String::new());
        }
        let name = hems_shm::generate_segment_name();
        hems_shm::write(&name, payload)?;
        Ok(name)
    }

    fn read_and_destroy_payload(segment_name: &str, len: u32) -> Vec<u8> {
        if segment_name.is_empty() {
            return Vec::new();
        }
        match hems_shm::read(segment_name, len as usize) {
            Ok(bytes) => {
                let _ = hems_shm::destroy(segment_name);
                bytes
            }
            Err(e) => {
                tracing::warn!(segment = segment_name, error = %e, "failed to read payload segment");
                Vec::new()
            }
        }
    }

    /// Sends a request to `target` and waits up to `timeout` for its
    /// response, returning the decoded payload. `subtype` must not be a
    /// reserved (negative) value; callers needing those use the dedicated
    /// `broadcast_settings*` methods.
    pub async fn send_request(
        &self,
        target: ModuleId,
        subtype: i32,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(i32, Vec<u8>), SendError> {
        if subtype < 0 {
            return Err(SendError::NegativeSubtype);
        }
        self.request(target, subtype, payload, timeout).await
    }

    /// Internal request path used both by [`Self::send_request`] and by
    /// the reserved-subtype protocol flows (`SETTINGS_INIT`,
    /// `SETTINGS_CHECK`), which must be able to address subtypes ordinary
    /// callers may not send directly.
    async fn request(
        &self,
        target: ModuleId,
        subtype: i32,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(i32, Vec<u8>), SendError> {
        let id = self.next_id();
        let segment_name = self.write_payload(payload).map_err(|_| SendError::MqError)?;
        let envelope = Envelope {
            kind: Kind::Request,
            id,
            sender: self.owner,
            subtype_or_code: subtype,
            segment_name,
            payload_len: payload.len() as u32,
        };

        let rx = self.correlation.register(id);
        self.post(target, Family::Inbound, &envelope)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                let bytes = Self::read_and_destroy_payload(&response.segment_name, response.payload_len);
                Ok((response.subtype_or_code, bytes))
            }
            Ok(Err(_)) => Err(SendError::MqError),
            Err(_) => {
                self.correlation.forget(id);
                Err(SendError::SendTimeout)
            }
        }
    }

    /// Sends a fire-and-forget command to `target`.
    pub fn send_command(&self, target: ModuleId, subtype: i32, payload: &[u8]) -> Result<(), SendError> {
        if subtype < 0 {
            return Err(SendError::NegativeSubtype);
        }
        self.command(target, subtype, payload)
    }

    /// Internal command path, used by [`Self::send_command`] and by the
    /// `SETTINGS_COMMIT`/`END_LISTEN_LOOP` control flows.
    fn command(&self, target: ModuleId, subtype: i32, payload: &[u8]) -> Result<(), SendError> {
        let segment_name = self.write_payload(payload).map_err(|_| SendError::MqError)?;
        let envelope = Envelope {
            kind: Kind::Command,
            id: self.next_id(),
            sender: self.owner,
            subtype_or_code: subtype,
            segment_name,
            payload_len: payload.len() as u32,
        };
        self.post(target, Family::Inbound, &envelope)
    }

    /// Sends a response envelope back to `to`, matching `request_id`.
    fn send_response_to(&self, to: ModuleId, request_id: u32, code: i32, payload: &[u8]) -> Result<(), SendError> {
        let segment_name = self.write_payload(payload).map_err(|_| SendError::MqError)?;
        let envelope = Envelope {
            kind: Kind::Response,
            id: request_id,
            sender: self.owner,
            subtype_or_code: code,
            segment_name,
            payload_len: payload.len() as u32,
        };
        self.post(to, Family::Response, &envelope)
    }

    fn post(&self, target: ModuleId, family: Family, envelope: &Envelope) -> Result<(), SendError> {
        let channel = self
            .registry
            .open(target, family, false)
            .map_err(|_| SendError::MqError)?;
        channel
            .send(&envelope.to_bytes(), envelope.priority())
            .map_err(|_| SendError::MqError)
    }

    /// Broadcasts `SETTINGS_INIT` to every worker module in parallel,
    /// carrying `settings` (the Supervisor's own `current_settings`,
    /// fetched from Storage beforehand) as the request payload. Supervisor-
    /// only, per spec.md §8 scenario S5; any other caller gets
    /// `InvalidCaller` without a single envelope being sent.
    ///
    /// Per SPEC_FULL.md §9 Open Question 1, only `SendTimeout` fails the
    /// broadcast; a worker's non-success response is logged and otherwise
    /// ignored, since this is a one-shot bootstrap with no prior approved
    /// state to protect.
    pub async fn broadcast_settings_init(&self, settings: &Settings, timeout: Duration) -> Result<(), SendError> {
        if self.owner != ModuleId::Supervisor {
            return Err(SendError::InvalidCaller);
        }
        let payload = codec::encode(settings).map_err(|_| SendError::MqError)?;

        let outcomes = join_all(ModuleId::WORKERS.iter().map(|&module| {
            let payload = payload.clone();
            async move { (module, self.request(module, SETTINGS_INIT, &payload, timeout).await) }
        }))
        .await;

        for (module, outcome) in outcomes {
            match outcome {
                Ok(_) => {}
                Err(SendError::SendTimeout) => return Err(SendError::SendTimeout),
                Err(e) => {
                    tracing::error!(?module, error = %e, "settings init failed for this worker");
                }
            }
        }
        Ok(())
    }

    /// Runs the two-phase settings change of spec.md §4.5: broadcasts
    /// `SETTINGS_CHECK` to every worker in parallel; if any worker times out
    /// or rejects the proposal, the whole call aborts with that outcome and
    /// no `SETTINGS_COMMIT` is sent to anyone (invariant 7). Only once every
    /// worker accepts is `SETTINGS_COMMIT` broadcast.
    pub async fn broadcast_settings(&self, settings: &Settings, timeout: Duration) -> Result<(), SettingsError> {
        let payload = codec::encode(settings).map_err(|_| SettingsError::MqError)?;

        let checks = join_all(ModuleId::WORKERS.iter().map(|&module| {
            let payload = payload.clone();
            async move { (module, self.request(module, SETTINGS_CHECK, &payload, timeout).await) }
        }))
        .await;

        for (module, outcome) in &checks {
            match outcome {
                Ok((code, _)) if SettingsCode::from_wire(*code) == Some(SettingsCode::Accepted) => {}
                Ok((code, _)) => {
                    tracing::error!(module = ?module, code, "settings check rejected; aborting broadcast without committing");
                    return Err(match SettingsCode::from_wire(*code) {
                        Some(SettingsCode::InternalError) => SettingsError::InternalError,
                        _ => SettingsError::Invalid,
                    });
                }
                Err(SendError::SendTimeout) => {
                    tracing::error!(module = ?module, "settings check timed out; aborting broadcast without committing");
                    return Err(SettingsError::Timeout);
                }
                Err(e) => {
                    tracing::error!(module = ?module, error = %e, "settings check failed; aborting broadcast without committing");
                    return Err(SettingsError::MqError);
                }
            }
        }

        for module in ModuleId::WORKERS {
            if let Err(e) = self.command(module, SETTINGS_COMMIT, &payload) {
                tracing::error!(?module, error = %e, "settings commit send failed");
            }
        }
        Ok(())
    }

    /// Tells `target`'s inbound loop to finish processing and return.
    /// Posted at the highest priority so it is delivered ahead of whatever
    /// is already queued, per spec.md §4.1.
    pub fn send_end_listen_loop(&self, target: ModuleId) -> Result<(), SendError> {
        self.command(target, END_LISTEN_LOOP, &[])
    }

    /// Runs the inbound command/request dispatch loop until `END_LISTEN_LOOP`
    /// is received. Intended to be spawned as its own task by the owning
    /// worker or Supervisor.
    pub async fn run_inbound_loop(self: Arc<Self>) -> Result<(), MessengerError> {
        let channel = self.registry.open(self.owner, Family::Inbound, true)?;
        let whitelist = pre_init_whitelist();

        loop {
            self.drain_completed();

            let bytes = {
                let channel = channel.clone();
                tokio::task::spawn_blocking(move || channel.receive())
                    .await
                    .map_err(|_| MessengerError::HandlerFailed(0))??
            };
            let envelope = Envelope::from_bytes(&bytes)?;

            if envelope.subtype_or_code == END_LISTEN_LOOP {
                self.drain_all().await;
                return Ok(());
            }

            let handler = self.handlers.lock().unwrap().get(&envelope.subtype_or_code).cloned();
            let Some(handler) = handler else {
                tracing::warn!(subtype = envelope.subtype_or_code, "no handler registered; dropping");
                continue;
            };

            let pre_init_ok = whitelist.contains(&envelope.subtype_or_code)
                || self.pre_init_extra.lock().unwrap().contains(&envelope.subtype_or_code);
            if !self.initialized.load(Ordering::Acquire) && !pre_init_ok {
                tracing::debug!(subtype = envelope.subtype_or_code, "dropping: worker not yet settings-initialized");
                continue;
            }

            let allowed_now = whitelist.contains(&envelope.subtype_or_code) || self.test_mode;
            let messenger = self.clone();
            let done_tx = self.done_tx.clone();
            let task = async move {
                if !allowed_now {
                    messenger.gate.wait().await;
                }
                Self::dispatch(messenger, handler, envelope).await;
                let _ = done_tx.send(());
            };
            self.inflight.lock().unwrap().spawn(task);
        }
    }

    async fn dispatch(messenger: Arc<Self>, handler: BoxedHandler, envelope: Envelope) {
        let payload = Self::read_and_destroy_payload(&envelope.segment_name, envelope.payload_len);
        let subtype = envelope.subtype_or_code;

        // Decoded once up front since `payload` is moved into the handler
        // context below, and both SETTINGS_INIT and SETTINGS_CHECK/COMMIT
        // need it afterwards too.
        let decoded: Option<Settings> = if matches!(subtype, SETTINGS_INIT | SETTINGS_CHECK | SETTINGS_COMMIT) {
            codec::decode::<Settings>(&payload).ok()
        } else {
            None
        };

        if subtype == SETTINGS_COMMIT {
            let proposed = messenger.proposed_settings.lock().unwrap().clone();
            if decoded.is_none() || decoded != proposed {
                tracing::error!(
                    sender = ?envelope.sender,
                    "dropping settings commit that does not match the last approved proposal"
                );
                return;
            }
        }

        if subtype == SETTINGS_INIT {
            if let Some(settings) = decoded.clone() {
                *messenger.current_settings.lock().unwrap() = Some(settings);
            }
        }

        let ctx = HandlerCtx {
            sender: envelope.sender,
            subtype,
            payload,
        };
        let is_request = envelope.kind == Kind::Request;
        let result = handler.call(ctx).await;

        if subtype == SETTINGS_INIT && result.is_ok() {
            messenger.initialized.store(true, Ordering::Release);
        }
        if subtype == SETTINGS_CHECK {
            if let Ok(HandlerOutcome::Response { code, .. }) = &result {
                if SettingsCode::from_wire(*code) == Some(SettingsCode::Accepted) {
                    *messenger.proposed_settings.lock().unwrap() = decoded.clone();
                }
            }
        }
        if subtype == SETTINGS_COMMIT && result.is_ok() {
            *messenger.current_settings.lock().unwrap() = decoded;
        }

        match result {
            Ok(HandlerOutcome::Response { code, payload }) if is_request => {
                if let Err(e) = messenger.send_response_to(envelope.sender, envelope.id, code, &payload) {
                    tracing::error!(error = %e, "failed to send handler response");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(subtype = envelope.subtype_or_code, error = %e, "handler failed");
                if is_request {
                    let _ = messenger.send_response_to(envelope.sender, envelope.id, -1, &[]);
                }
            }
        }
    }

    /// Runs the response dispatch loop, delivering each incoming response
    /// to its waiter in the correlation table.
    pub async fn run_response_loop(self: Arc<Self>) -> Result<(), MessengerError> {
        let channel = self.registry.open(self.owner, Family::Response, true)?;
        loop {
            let bytes = {
                let channel = channel.clone();
                tokio::task::spawn_blocking(move || channel.receive())
                    .await
                    .map_err(|_| MessengerError::HandlerFailed(0))??
            };
            let envelope = Envelope::from_bytes(&bytes)?;
            if envelope.id == 0 {
                return Ok(());
            }
            if !self.correlation.deliver(envelope.clone()) {
                tracing::debug!(id = envelope.id, "response had no waiter; discarding");
            }
        }
    }

    /// Drains command-handler task completions without blocking, replacing
    /// the original's `JOIN_RCV_CMD` self-message trick with a plain
    /// channel poll.
    fn drain_completed(&self) {
        let mut rx = self.done_rx.lock().unwrap();
        while rx.try_recv().is_ok() {}
        let mut inflight = self.inflight.lock().unwrap();
        while inflight.try_join_next().is_some() {}
    }

    /// Waits for every in-flight handler task to finish, used when the
    /// inbound loop receives `END_LISTEN_LOOP`.
    async fn drain_all(&self) {
        let mut inflight = std::mem::take(&mut *self.inflight.lock().unwrap());
        while inflight.join_next().await.is_some() {}
        let mut rx = self.done_rx.lock().unwrap();
        while rx.try_recv().is_ok() {}
    }
}
