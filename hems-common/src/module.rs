// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Identifies one of the seven fixed participants in the fabric.
///
/// Order matches the original program's declaration (the Supervisor, here
/// named `Supervisor`, was originally `LAUNCHER`): Supervisor, Automation,
/// Collection, Inference, Storage, Training, Ui.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum ModuleId {
    Supervisor = 0,
    Automation = 1,
    Collection = 2,
    Inference = 3,
    Storage = 4,
    Training = 5,
    Ui = 6,
}

impl ModuleId {
    pub const ALL: [ModuleId; 7] = [
        ModuleId::Supervisor,
        ModuleId::Automation,
        ModuleId::Collection,
        ModuleId::Inference,
        ModuleId::Storage,
        ModuleId::Training,
        ModuleId::Ui,
    ];

    /// All modules other than the Supervisor.
    pub const WORKERS: [ModuleId; 6] = [
        ModuleId::Automation,
        ModuleId::Collection,
        ModuleId::Inference,
        ModuleId::Storage,
        ModuleId::Training,
        ModuleId::Ui,
    ];

    /// Short, stable name used to derive channel and segment names.
    pub const fn name(self) -> &'static str {
        match self {
            ModuleId::Supervisor => "supervisor",
            ModuleId::Automation => "automation",
            ModuleId::Collection => "collection",
            ModuleId::Inference => "inference",
            ModuleId::Storage => "storage",
            ModuleId::Training => "training",
            ModuleId::Ui => "ui",
        }
    }

    /// Descriptive name used only in log lines.
    pub const fn long_name(self) -> &'static str {
        match self {
            ModuleId::Supervisor => "HEMS Supervisor",
            ModuleId::Automation => "Automation and Recommendation Module",
            ModuleId::Collection => "Measurement Collection Module",
            ModuleId::Inference => "Knowledge Inference Module",
            ModuleId::Storage => "Data Storage Module",
            ModuleId::Training => "Model Training Module",
            ModuleId::Ui => "User Interface Module",
        }
    }

    pub const fn from_wire(tag: u8) -> Option<ModuleId> {
        match tag {
            0 => Some(ModuleId::Supervisor),
            1 => Some(ModuleId::Automation),
            2 => Some(ModuleId::Collection),
            3 => Some(ModuleId::Inference),
            4 => Some(ModuleId::Storage),
            5 => Some(ModuleId::Training),
            6 => Some(ModuleId::Ui),
            _ => None,
        }
    }

    pub const fn to_wire(self) -> u8 {
        self as u8
    }

    pub const fn is_worker(self) -> bool {
        !matches!(self, ModuleId::Supervisor)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ModuleId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModuleId::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| format!("unknown module name: {s}"))
    }
}
