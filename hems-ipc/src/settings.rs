// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! Settings protocol types, grounded on
//! `original_source/include/hems/common/messenger.h` and the
//! `init_settings()` flow in
//! `original_source/src/hems/modules/launcher/launcher.cpp`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A settings document. Wraps an arbitrary JSON value rather than a fixed
/// struct since every worker defines its own settings shape; matches the
/// "opaque to the fabric" contract of spec.md §4.5.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings(pub serde_json::Value);

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Response codes for `SETTINGS_CHECK` and `SETTINGS_INIT`, carried in
/// `Envelope::subtype_or_code` on the response envelope. `Invalid` and
/// `InternalError` are kept distinct per spec.md §8's error table, since a
/// `broadcast_settings` caller needs to know which one to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsCode {
    /// The proposed settings are acceptable, or (for `SETTINGS_INIT`) the
    /// module already has settings stored and returned them.
    Accepted,
    /// The proposed settings fail the worker's own validation; the commit
    /// must not proceed.
    Invalid,
    /// The worker could not evaluate the proposal due to a fault on its own
    /// side (not a rejection of the proposal itself); the commit must not
    /// proceed.
    InternalError,
    /// The module has no settings stored yet (valid only as an
    /// `SETTINGS_INIT` response).
    NoneAvailable,
}

impl SettingsCode {
    pub const fn to_wire(self) -> i32 {
        match self {
            SettingsCode::Accepted => 0,
            SettingsCode::Invalid => 1,
            SettingsCode::InternalError => 2,
            SettingsCode::NoneAvailable => 3,
        }
    }

    pub const fn from_wire(code: i32) -> Option<Self> {
        match code {
            0 => Some(SettingsCode::Accepted),
            1 => Some(SettingsCode::Invalid),
            2 => Some(SettingsCode::InternalError),
            3 => Some(SettingsCode::NoneAvailable),
            _ => None,
        }
    }
}

/// Why a [`crate::Messenger::broadcast_settings`] call did not end in a
/// commit, per spec.md §4.4's `broadcast_settings` signature and §8's
/// invariant 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("a worker timed out on SETTINGS_CHECK")]
    Timeout,
    #[error("a worker rejected the proposed settings as invalid")]
    Invalid,
    #[error("a worker failed to evaluate the proposed settings")]
    InternalError,
    #[error("message queue error while broadcasting settings")]
    MqError,
}
