// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! Supervisor CLI surface, grounded on
//! `original_source/src/hems/modules/launcher/main.cpp`. The original
//! hardcodes one `--<module>` path flag per worker; this generalizes that
//! to repeatable `--worker-path MODULE=PATH` / `--worker-arg MODULE=ARG`
//! options so the set of workers isn't baked into the binary's argument
//! parser.

use std::collections::HashMap;
use std::path::PathBuf;

use hems_common::ModuleId;

#[derive(Debug, clap::Parser)]
#[command(about = "The HEMS Supervisor: starts and supervises every worker module.")]
pub struct SupervisorArgs {
    /// Launch with the debug configuration: log and print debug messages,
    /// and do not launch worker processes automatically.
    #[arg(short, long)]
    pub debug: bool,

    /// Write log messages into a file at this path.
    #[arg(long, default_value = "log.txt")]
    pub log: String,

    /// Path to a worker binary, given as MODULE=PATH. May be repeated.
    #[arg(long = "worker-path", value_parser = parse_worker_path)]
    pub worker_path: Vec<(ModuleId, PathBuf)>,

    /// An extra argument to pass a worker binary, given as MODULE=ARG. May
    /// be repeated to build up a full argument list for one module.
    #[arg(long = "worker-arg", value_parser = parse_worker_arg)]
    pub worker_arg: Vec<(ModuleId, String)>,
}

fn split_module(s: &str) -> Result<(ModuleId, &str), String> {
    let (name, rest) = s.split_once('=').ok_or_else(|| format!("expected MODULE=VALUE, got {s:?}"))?;
    let module = name.parse::<ModuleId>()?;
    Ok((module, rest))
}

fn parse_worker_path(s: &str) -> Result<(ModuleId, PathBuf), String> {
    let (module, path) = split_module(s)?;
    Ok((module, PathBuf::from(path)))
}

fn parse_worker_arg(s: &str) -> Result<(ModuleId, String), String> {
    let (module, arg) = split_module(s)?;
    Ok((module, arg.to_string()))
}

#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub module: ModuleId,
    pub path: PathBuf,
    pub args: Vec<String>,
}

impl SupervisorArgs {
    /// Builds one [`WorkerSpec`] per worker module, falling back to the
    /// module's short name as the binary path when `--worker-path` wasn't
    /// given for it, matching the original's hardcoded per-module
    /// defaults (e.g. `storage_path = "storage"`).
    pub fn worker_specs(&self) -> Vec<WorkerSpec> {
        let mut specs: HashMap<ModuleId, WorkerSpec> = ModuleId::WORKERS
            .into_iter()
            .map(|module| {
                (
                    module,
                    WorkerSpec {
                        module,
                        path: PathBuf::from(module.name()),
                        args: Vec::new(),
                    },
                )
            })
            .collect();

        for (module, path) in &self.worker_path {
            if let Some(spec) = specs.get_mut(module) {
                spec.path = path.clone();
            }
        }
        for (module, arg) in &self.worker_arg {
            if let Some(spec) = specs.get_mut(module) {
                spec.args.push(arg.clone());
            }
        }

        let mut specs: Vec<WorkerSpec> = specs.into_values().collect();
        specs.sort_by_key(|s| s.module.to_wire());
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_to_module_name_as_path() {
        let args = SupervisorArgs::parse_from(["hems-supervisor"]);
        let specs = args.worker_specs();
        assert_eq!(specs.len(), ModuleId::WORKERS.len());
        let storage = specs.iter().find(|s| s.module == ModuleId::Storage).unwrap();
        assert_eq!(storage.path, PathBuf::from("storage"));
        assert!(storage.args.is_empty());
    }

    #[test]
    fn worker_path_and_arg_override_defaults() {
        let args = SupervisorArgs::parse_from([
            "hems-supervisor",
            "--worker-path",
            "storage=./bin/storage",
            "--worker-arg",
            "storage=--db",
            "--worker-arg",
            "storage=hems.db",
        ]);
        let specs = args.worker_specs();
        let storage = specs.iter().find(|s| s.module == ModuleId::Storage).unwrap();
        assert_eq!(storage.path, PathBuf::from("./bin/storage"));
        assert_eq!(storage.args, vec!["--db".to_string(), "hems.db".to_string()]);
    }
}
