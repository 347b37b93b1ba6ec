// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! Integration tests realizing SPEC_FULL.md §8's S6 (worker exit code
//! propagation) plus a basic construction/shutdown check. Both tests touch
//! real POSIX message queues through `Supervisor::new`, so they serialize on
//! `guard()`.

use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use clap::Parser;
use hems_supervisor::cli::SupervisorArgs;
use hems_supervisor::Supervisor;

fn guard() -> &'static Mutex<()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD.get_or_init(|| Mutex::new(()))
}

/// S6: when a worker process exits with a nonzero status, the Supervisor
/// notices and shuts down the rest of the fabric, propagating that code.
#[tokio::test]
async fn s6_propagates_nonzero_worker_exit_code() {
    let _lock = guard().lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("log.txt");

    let mut argv = vec![
        "hems-supervisor".to_string(),
        "--log".to_string(),
        log_path.to_str().unwrap().to_string(),
    ];
    for module in ["automation", "collection", "inference", "storage", "training", "ui"] {
        argv.push("--worker-path".to_string());
        argv.push(format!("{module}=/bin/sh"));
    }
    // Automation crashes immediately with a distinct code; every other
    // module sleeps well past the test's timeout so only Automation's exit
    // can be what trips the shutdown.
    argv.push("--worker-arg".to_string());
    argv.push("automation=-c".to_string());
    argv.push("--worker-arg".to_string());
    argv.push("automation=exit 9".to_string());
    for module in ["collection", "inference", "storage", "training", "ui"] {
        argv.push("--worker-arg".to_string());
        argv.push(format!("{module}=-c"));
        argv.push("--worker-arg".to_string());
        argv.push(format!("{module}=sleep 5"));
    }

    let args = SupervisorArgs::parse_from(argv);
    let supervisor = Supervisor::new(args).unwrap();

    let status = tokio::time::timeout(Duration::from_secs(3), supervisor.run())
        .await
        .expect("supervisor should shut down promptly after a worker crashes")
        .unwrap();

    assert_eq!(status, 9);
}

/// Debug mode never launches worker processes; an externally triggered
/// exit (standing in for a delivered signal) still shuts the Supervisor
/// down cleanly and returns its status.
#[tokio::test]
async fn debug_mode_skips_worker_launch_and_shuts_down_cleanly() {
    let _lock = guard().lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("log.txt");

    let args = SupervisorArgs::parse_from([
        "hems-supervisor",
        "--debug",
        "--log",
        log_path.to_str().unwrap(),
    ]);
    let supervisor = Supervisor::new(args).unwrap();
    let exit = supervisor.exit_latch().clone();

    let handle = tokio::spawn(supervisor.clone().run());
    tokio::time::sleep(Duration::from_millis(50)).await;
    exit.exit(0);

    let status = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("supervisor should shut down promptly")
        .unwrap()
        .unwrap();
    assert_eq!(status, 0);
}
