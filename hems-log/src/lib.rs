// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! The Log Forwarder: a domain-level logging pipeline distinct from this
//! workspace's ambient `tracing` instrumentation. Every module logs
//! through a [`Logger`]; workers use [`RemoteLogger`], which forwards
//! [`LogEvent`]s to the Supervisor over the fabric, while the Supervisor
//! itself uses [`LocalLogger`], which writes directly to a file and to
//! stdout/stderr. Grounded on
//! `original_source/include/hems/common/logger.h` and
//! `original_source/src/hems/modules/launcher/local_logger.cpp`.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::sync::Mutex;

use chrono::Local;
use colored::{Color, Colorize};
use hems_common::ModuleId;
use serde::{Deserialize, Serialize};

/// Reserved command subtype a `RemoteLogger` posts `LogEvent`s against.
pub const LOG_EVENT_SUBTYPE: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    Log,
    Dbg,
    Err,
}

impl Level {
    pub const fn name(self) -> &'static str {
        match self {
            Level::Log => "LOG",
            Level::Dbg => "DBG",
            Level::Err => "ERR",
        }
    }

    fn color(self) -> Color {
        match self {
            Level::Log => Color::Blue,
            Level::Dbg => Color::Yellow,
            Level::Err => Color::Red,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub source: ModuleId,
    pub level: Level,
    pub message: String,
}

/// Every module logs through this trait regardless of how the message
/// ultimately reaches a file or terminal.
pub trait Logger: Send + Sync {
    fn log(&self, message: &str, level: Level);
}

/// Forwards log events to the Supervisor as a command, per
/// `original_source/include/hems/common/logger.h`'s `remote_logger`. Used
/// by every module except the Supervisor itself.
pub struct RemoteLogger {
    owner: ModuleId,
    debug: bool,
    messenger: std::sync::Arc<hems_ipc::Messenger>,
}

impl RemoteLogger {
    pub fn new(owner: ModuleId, debug: bool, messenger: std::sync::Arc<hems_ipc::Messenger>) -> Self {
        Self { owner, debug, messenger }
    }
}

impl Logger for RemoteLogger {
    fn log(&self, message: &str, level: Level) {
        if !self.debug && level == Level::Dbg {
            return;
        }
        let event = LogEvent {
            source: self.owner,
            level,
            message: message.to_string(),
        };
        let Ok(payload) = hems_ipc::codec::encode(&event) else {
            tracing::error!("failed to encode log event");
            return;
        };
        if let Err(e) = self.messenger.send_command(ModuleId::Supervisor, LOG_EVENT_SUBTYPE, &payload) {
            tracing::error!(error = %e, "failed to forward log event to supervisor");
        }
    }
}

const SOURCE_WIDTH: usize = 10;
const LEVEL_WIDTH: usize = 5;

/// Writes to a log file and mirrors to stdout (LOG/DBG) or stderr (ERR),
/// per `original_source/src/hems/modules/launcher/local_logger.cpp`'s
/// exact `[timestamp] [LEVEL] [source] message` format and column widths.
/// Used only by the Supervisor, which owns every other module's log
/// stream via `RemoteLogger`.
pub struct LocalLogger {
    owner: ModuleId,
    debug: bool,
    file: Mutex<Option<File>>,
}

impl LocalLogger {
    pub fn new(owner: ModuleId, debug: bool, log_path: &str) -> Self {
        let file = match OpenOptions::new().create(true).append(true).open(log_path) {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!(
                    "Could not open or create {log_path}, log messages will only be printed, not written: {e}"
                );
                None
            }
        };
        Self { owner, debug, file: Mutex::new(file) }
    }

    fn format(message: &str, level: Level, source: ModuleId) -> (String, String) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.6f");
        let plain_time = format!("[{timestamp}] ");
        let color_time = format!("[{}] ", timestamp.to_string().blue());

        let level_name = level.name();
        let level_pad = " ".repeat(LEVEL_WIDTH.saturating_sub(level_name.len()));
        let plain_level = format!("[{level_name}] {level_pad}");
        let color_level = format!("[{}] {level_pad}", level_name.color(level.color()));

        let source_name = source.name().to_uppercase();
        let source_pad = " ".repeat(SOURCE_WIDTH.saturating_sub(source_name.len()));
        let plain_source = format!("[{source_name}] {source_pad}");
        let color_source = format!("[{}] {source_pad}", source_name.as_str().color(module_color(source)));

        let plain = format!("{plain_time}{plain_level}{plain_source}{message}\n");
        let color_message = if level == Level::Err {
            message.red().to_string()
        } else {
            message.to_string()
        };
        let colored = format!("{color_time}{color_level}{color_source}{color_message}\n");
        (plain, colored)
    }

    fn log_from(&self, message: &str, level: Level, source: ModuleId) {
        if !self.debug && level == Level::Dbg {
            return;
        }
        let (plain, colored) = Self::format(message, level, source);

        if let Some(file) = self.file.lock().unwrap().as_mut() {
            let _ = file.write_all(plain.as_bytes());
            let _ = file.flush();
        }

        match level {
            Level::Err => eprint!("{colored}"),
            _ => print!("{colored}"),
        }
    }

    /// Logs a message attributed to a module other than this logger's
    /// owner, used when relaying a `LogEvent` received from a worker.
    pub fn log_from_source(&self, message: &str, level: Level, source: ModuleId) {
        self.log_from(message, level, source);
    }
}

impl Logger for LocalLogger {
    fn log(&self, message: &str, level: Level) {
        self.log_from(message, level, self.owner);
    }
}

fn module_color(module: ModuleId) -> Color {
    match module {
        ModuleId::Supervisor => Color::TrueColor { r: 0, g: 150, b: 136 },
        ModuleId::Storage => Color::TrueColor { r: 175, g: 95, b: 255 },
        ModuleId::Collection => Color::TrueColor { r: 255, g: 175, b: 0 },
        ModuleId::Ui => Color::TrueColor { r: 95, g: 215, b: 255 },
        ModuleId::Inference => Color::TrueColor { r: 255, g: 95, b: 135 },
        ModuleId::Automation => Color::TrueColor { r: 135, g: 255, b: 95 },
        ModuleId::Training => Color::TrueColor { r: 0, g: 135, b: 255 },
    }
}
