// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use hems_supervisor::cli::SupervisorArgs;
use hems_supervisor::Supervisor;

#[tokio::main]
async fn main() {
    let args = SupervisorArgs::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let supervisor = match Supervisor::new(args) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to start supervisor: {e}");
            std::process::exit(1);
        }
    };

    let status = match supervisor.run().await {
        Ok(status) => status,
        Err(e) => {
            eprintln!("supervisor exited with error: {e}");
            1
        }
    };

    std::process::exit(status);
}
