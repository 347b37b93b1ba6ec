// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types for the fabric. Per spec.md §7, the send path reports plain
//! value outcomes rather than throwing, mirroring the original program's
//! `send_result` enum; everything else (setup, registry, codec failures)
//! uses a `thiserror` enum the way the rest of this workspace does.

use std::fmt;

/// Outcome of a send-path operation (`send`, `send_response`,
/// `broadcast_settings*`). Deliberately not a `std::error::Error` impl:
/// these are expected, frequently-checked results, not exceptional
/// failures, matching the original's plain enum return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The underlying POSIX message queue operation failed.
    MqError,
    /// No response arrived within the caller's timeout.
    SendTimeout,
    /// A caller attempted to send a reserved (negative) subtype directly.
    NegativeSubtype,
    /// The sender is not permitted to address this recipient in its
    /// current state (e.g. a non-Supervisor caller during settings init).
    InvalidCaller,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SendError::MqError => "message queue operation failed",
            SendError::SendTimeout => "no response within timeout",
            SendError::NegativeSubtype => "reserved subtype may not be sent directly",
            SendError::InvalidCaller => "caller not permitted in current state",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for SendError {}

#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error(transparent)]
    Registry(#[from] crate::registry::RegistryError),
    #[error(transparent)]
    Shm(#[from] hems_shm::ShmError),
    #[error(transparent)]
    Envelope(#[from] crate::envelope::EnvelopeError),
    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),
    #[error("handler panicked or returned no value for subtype {0}")]
    HandlerFailed(i32),
    #[error("no handler registered for subtype {0}")]
    NoHandler(i32),
}
