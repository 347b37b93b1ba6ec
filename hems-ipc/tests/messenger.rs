// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! Integration tests realizing the Testable Properties scenarios from
//! SPEC_FULL.md §8 (S1-S5). These exercise real POSIX message queues, so
//! every test serializes on `GUARD` to avoid two tests racing over the
//! same queue names, and every test unlinks its queues on the way out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use hems_common::ModuleId;
use hems_ipc::envelope::{SETTINGS_CHECK, SETTINGS_INIT};
use hems_ipc::handler::{HandlerCtx, HandlerOutcome};
use hems_ipc::registry::ChannelRegistry;
use hems_ipc::settings::{Settings, SettingsCode};
use hems_ipc::{Messenger, SendError};

fn guard() -> &'static Mutex<()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD.get_or_init(|| Mutex::new(()))
}

const PING: i32 = 1;

async fn echo_handler(ctx: HandlerCtx) -> anyhow::Result<HandlerOutcome> {
    Ok(HandlerOutcome::ok(ctx.payload))
}

/// S1: a request/response round trip completes and carries the original
/// payload back unchanged.
#[tokio::test]
async fn s1_request_response_roundtrip() {
    let _lock = guard().lock().unwrap();
    ChannelRegistry::unlink_all();
    ChannelRegistry::create_all().unwrap();

    let registry = Arc::new(ChannelRegistry::new());
    let server = Messenger::new(ModuleId::Collection, registry.clone(), true).unwrap();
    server.register_handler(PING, Arc::new(echo_handler));
    server.open_gate();
    let server_loop = tokio::spawn(server.clone().run_inbound_loop());

    let client = Messenger::new(ModuleId::Automation, registry.clone(), true).unwrap();
    let client_loop = tokio::spawn(client.clone().run_response_loop());

    let (code, bytes) = client
        .send_request(ModuleId::Collection, PING, b"hello", Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(code, 0);
    assert_eq!(bytes, b"hello");

    client.send_end_listen_loop(ModuleId::Collection).ok();
    server_loop.abort();
    client_loop.abort();
    ChannelRegistry::unlink_all();
}

/// S2: a request to a module that never answers times out rather than
/// hanging forever.
#[tokio::test]
async fn s2_request_times_out() {
    let _lock = guard().lock().unwrap();
    ChannelRegistry::unlink_all();
    ChannelRegistry::create_all().unwrap();

    let registry = Arc::new(ChannelRegistry::new());
    let client = Messenger::new(ModuleId::Automation, registry.clone(), true).unwrap();
    let client_loop = tokio::spawn(client.clone().run_response_loop());

    // Storage never runs an inbound loop in this test, so nothing will
    // ever answer.
    let result = client
        .send_request(ModuleId::Storage, PING, b"?", Duration::from_millis(100))
        .await;
    assert_eq!(result.unwrap_err(), SendError::SendTimeout);

    client_loop.abort();
    ChannelRegistry::unlink_all();
}

/// S3: broadcasting settings to a module that accepts the check results in
/// the commit being delivered.
#[tokio::test]
async fn s3_settings_commit_on_accept() {
    let _lock = guard().lock().unwrap();
    ChannelRegistry::unlink_all();
    ChannelRegistry::create_all().unwrap();

    let registry = Arc::new(ChannelRegistry::new());
    let worker = Messenger::new(ModuleId::Storage, registry.clone(), true).unwrap();
    let committed = Arc::new(tokio::sync::Notify::new());

    worker.register_handler(
        SETTINGS_CHECK,
        Arc::new(|_ctx: HandlerCtx| async move {
            Ok(HandlerOutcome::Response {
                code: SettingsCode::Accepted.to_wire(),
                payload: Vec::new(),
            })
        }),
    );
    let notify_for_commit = committed.clone();
    worker.register_handler(
        hems_ipc::envelope::SETTINGS_COMMIT,
        Arc::new(move |_ctx: HandlerCtx| {
            let notify = notify_for_commit.clone();
            async move {
                notify.notify_one();
                Ok(HandlerOutcome::Command)
            }
        }),
    );
    worker.open_gate();
    let worker_loop = tokio::spawn(worker.clone().run_inbound_loop());

    let supervisor = Messenger::new(ModuleId::Supervisor, registry.clone(), true).unwrap();
    let supervisor_resp_loop = tokio::spawn(supervisor.clone().run_response_loop());

    let settings = Settings(serde_json::json!({"ok": true}));

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        supervisor.broadcast_settings(&settings, Duration::from_millis(500)),
    )
    .await
    .expect("broadcast_settings should not hang");
    assert!(result.is_ok());

    tokio::time::timeout(Duration::from_millis(500), committed.notified())
        .await
        .expect("commit handler should have fired");

    worker_loop.abort();
    supervisor_resp_loop.abort();
    ChannelRegistry::unlink_all();
}

/// S4: if one worker's `SETTINGS_CHECK` rejects the proposal, no
/// `SETTINGS_COMMIT` is issued to any worker, including the one that would
/// have accepted.
#[tokio::test]
async fn s4_settings_rejection_commits_nobody() {
    let _lock = guard().lock().unwrap();
    ChannelRegistry::unlink_all();
    ChannelRegistry::create_all().unwrap();

    let registry = Arc::new(ChannelRegistry::new());

    let accepting = Messenger::new(ModuleId::Storage, registry.clone(), true).unwrap();
    let accepting_commits = Arc::new(AtomicUsize::new(0));
    accepting.register_handler(
        SETTINGS_CHECK,
        Arc::new(|_ctx: HandlerCtx| async move {
            Ok(HandlerOutcome::Response {
                code: SettingsCode::Accepted.to_wire(),
                payload: Vec::new(),
            })
        }),
    );
    {
        let counter = accepting_commits.clone();
        accepting.register_handler(
            hems_ipc::envelope::SETTINGS_COMMIT,
            Arc::new(move |_ctx: HandlerCtx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(HandlerOutcome::Command)
                }
            }),
        );
    }
    accepting.open_gate();
    let accepting_loop = tokio::spawn(accepting.clone().run_inbound_loop());

    let rejecting = Messenger::new(ModuleId::Ui, registry.clone(), true).unwrap();
    rejecting.register_handler(
        SETTINGS_CHECK,
        Arc::new(|_ctx: HandlerCtx| async move {
            Ok(HandlerOutcome::Response {
                code: SettingsCode::Invalid.to_wire(),
                payload: Vec::new(),
            })
        }),
    );
    rejecting.open_gate();
    let rejecting_loop = tokio::spawn(rejecting.clone().run_inbound_loop());

    let supervisor = Messenger::new(ModuleId::Supervisor, registry.clone(), true).unwrap();
    let supervisor_resp_loop = tokio::spawn(supervisor.clone().run_response_loop());

    let settings = Settings(serde_json::json!({"rejected": true}));
    let result = tokio::time::timeout(
        Duration::from_secs(1),
        supervisor.broadcast_settings(&settings, Duration::from_millis(500)),
    )
    .await
    .expect("broadcast_settings should not hang");
    assert_eq!(result, Err(hems_ipc::settings::SettingsError::Invalid));

    // Give both workers' inbound loops a moment to have received any
    // SETTINGS_COMMIT they were going to receive, then confirm neither did.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepting_commits.load(Ordering::SeqCst), 0);

    accepting_loop.abort();
    rejecting_loop.abort();
    supervisor_resp_loop.abort();
    ChannelRegistry::unlink_all();
}

/// Invariant 5: a worker drops every inbound subtype not in its pre-init
/// whitelist until its first `SETTINGS_INIT` has been processed.
#[tokio::test]
async fn drops_subtype_before_settings_init() {
    let _lock = guard().lock().unwrap();
    ChannelRegistry::unlink_all();
    ChannelRegistry::create_all().unwrap();

    let registry = Arc::new(ChannelRegistry::new());
    let worker = Messenger::new(ModuleId::Inference, registry.clone(), false).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    worker.register_handler(
        PING,
        Arc::new(move |ctx: HandlerCtx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerOutcome::ok(ctx.payload))
            }
        }),
    );
    worker.register_handler(
        SETTINGS_INIT,
        Arc::new(|_ctx: HandlerCtx| async move {
            Ok(HandlerOutcome::Response {
                code: SettingsCode::NoneAvailable.to_wire(),
                payload: Vec::new(),
            })
        }),
    );
    worker.open_gate();
    let worker_loop = tokio::spawn(worker.clone().run_inbound_loop());

    let client = Messenger::new(ModuleId::Automation, registry.clone(), true).unwrap();
    let client_loop = tokio::spawn(client.clone().run_response_loop());

    let before = client
        .send_request(ModuleId::Inference, PING, b"x", Duration::from_millis(200))
        .await;
    assert_eq!(before.unwrap_err(), SendError::SendTimeout);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    let supervisor = Messenger::new(ModuleId::Supervisor, registry.clone(), true).unwrap();
    let supervisor_resp_loop = tokio::spawn(supervisor.clone().run_response_loop());

    let init_settings = Settings(serde_json::json!({"rate_ms": 250}));
    supervisor
        .broadcast_settings_init(&init_settings, Duration::from_millis(200))
        .await
        .unwrap();

    let after = client
        .send_request(ModuleId::Inference, PING, b"y", Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(after, (0, b"y".to_vec()));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    client.send_end_listen_loop(ModuleId::Inference).ok();
    worker_loop.abort();
    client_loop.abort();
    supervisor_resp_loop.abort();
    ChannelRegistry::unlink_all();
}

/// S5: a non-Supervisor messenger is refused when it tries to broadcast
/// `SETTINGS_INIT`, and no envelopes are sent as a result.
#[tokio::test]
async fn s5_broadcast_settings_init_restricted_to_supervisor() {
    let _lock = guard().lock().unwrap();
    ChannelRegistry::unlink_all();
    ChannelRegistry::create_all().unwrap();

    let registry = Arc::new(ChannelRegistry::new());
    let worker = Messenger::new(ModuleId::Training, registry.clone(), false).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    worker.register_handler(
        SETTINGS_INIT,
        Arc::new(move |_ctx: HandlerCtx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerOutcome::Response {
                    code: SettingsCode::NoneAvailable.to_wire(),
                    payload: Vec::new(),
                })
            }
        }),
    );
    worker.open_gate();
    let worker_loop = tokio::spawn(worker.clone().run_inbound_loop());

    let client = Messenger::new(ModuleId::Automation, registry.clone(), true).unwrap();
    let client_loop = tokio::spawn(client.clone().run_response_loop());

    let settings = Settings(serde_json::json!({}));
    let result = client.broadcast_settings_init(&settings, Duration::from_millis(200)).await;
    assert_eq!(result.unwrap_err(), SendError::InvalidCaller);

    // Give the worker's inbound loop a moment to have received anything it
    // was going to receive, then confirm it never did.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    worker_loop.abort();
    client_loop.abort();
    ChannelRegistry::unlink_all();
}

/// `SETTINGS_INIT` against a worker with nothing stored returns "none
/// available" rather than an error (Open Question #1's resolution).
#[tokio::test]
async fn settings_init_none_available() {
    let _lock = guard().lock().unwrap();
    ChannelRegistry::unlink_all();
    ChannelRegistry::create_all().unwrap();

    let registry = Arc::new(ChannelRegistry::new());
    let worker = Messenger::new(ModuleId::Training, registry.clone(), true).unwrap();
    worker.register_handler(
        SETTINGS_INIT,
        Arc::new(|_ctx: HandlerCtx| async move {
            Ok(HandlerOutcome::Response {
                code: SettingsCode::NoneAvailable.to_wire(),
                payload: Vec::new(),
            })
        }),
    );
    worker.open_gate();
    let worker_loop = tokio::spawn(worker.clone().run_inbound_loop());

    let supervisor = Messenger::new(ModuleId::Supervisor, registry.clone(), true).unwrap();
    let supervisor_resp_loop = tokio::spawn(supervisor.clone().run_response_loop());

    let settings = Settings(serde_json::json!({}));
    supervisor
        .broadcast_settings_init(&settings, Duration::from_millis(500))
        .await
        .unwrap();

    worker_loop.abort();
    supervisor_resp_loop.abort();
    ChannelRegistry::unlink_all();
}
