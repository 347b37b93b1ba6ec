// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! The fixed-size envelope posted on every message queue, grounded on
//! `original_source/include/hems/common/messenger.h` (`msg_t`). The
//! envelope itself carries no user payload — only the name of the shared
//! segment (`hems_shm`) that does.

use hems_common::ModuleId;
use hems_shm::N_SEG;

/// Reserved, negative control subtypes. Non-negative subtypes are free for
/// each worker to define.
pub const END_LISTEN_LOOP: i32 = -1;
pub const SETTINGS_INIT: i32 = -2;
pub const SETTINGS_CHECK: i32 = -3;
pub const SETTINGS_COMMIT: i32 = -4;
/// Kept only for wire-format parity with the original program; this
/// implementation joins completed command-handler tasks over an in-process
/// channel instead of looping a synthetic envelope through the owner's own
/// queue (see SPEC_FULL.md §4.4), so this subtype is never sent or matched
/// against at runtime.
pub const JOIN_RCV_CMD: i32 = -5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Command,
    Request,
    Response,
}

impl Kind {
    const fn to_wire(self) -> u8 {
        match self {
            Kind::Command => 0,
            Kind::Request => 1,
            Kind::Response => 2,
        }
    }

    const fn from_wire(tag: u8) -> Option<Kind> {
        match tag {
            0 => Some(Kind::Command),
            1 => Some(Kind::Request),
            2 => Some(Kind::Response),
            _ => None,
        }
    }
}

/// Wire size of an `Envelope`: 1 (kind) + 4 (id) + 1 (sender) + 4
/// (subtype_or_code) + `N_SEG` (segment_name) + 4 (payload_len).
pub const WIRE_SIZE: usize = 1 + 4 + 1 + 4 + N_SEG + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: Kind,
    /// `0` is reserved as a sentinel that terminates the response-listen
    /// loop; a real request/response pair never uses it.
    pub id: u32,
    pub sender: ModuleId,
    /// Subtype for command/request envelopes, response code for response
    /// envelopes.
    pub subtype_or_code: i32,
    /// Name of the shared-memory segment holding the payload, or empty.
    pub segment_name: String,
    pub payload_len: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("buffer too short for an envelope: got {0} bytes, need {WIRE_SIZE}")]
    TooShort(usize),
    #[error("unknown envelope kind tag {0}")]
    UnknownKind(u8),
    #[error("unknown module tag {0}")]
    UnknownModule(u8),
    #[error("segment name is not valid UTF-8/ASCII")]
    InvalidSegmentName,
}

impl Envelope {
    pub fn priority(&self) -> u32 {
        priority_for_subtype(self.subtype_or_code)
    }

    pub fn to_bytes(&self) -> [u8; WIRE_SIZE] {
        let mut buf = [0u8; WIRE_SIZE];
        let mut off = 0;

        buf[off] = self.kind.to_wire();
        off += 1;

        buf[off..off + 4].copy_from_slice(&self.id.to_le_bytes());
        off += 4;

        buf[off] = self.sender.to_wire();
        off += 1;

        buf[off..off + 4].copy_from_slice(&self.subtype_or_code.to_le_bytes());
        off += 4;

        let name_bytes = self.segment_name.as_bytes();
        debug_assert!(name_bytes.len() < N_SEG, "segment name exceeds N_SEG - 1");
        buf[off..off + name_bytes.len()].copy_from_slice(name_bytes);
        off += N_SEG;

        buf[off..off + 4].copy_from_slice(&self.payload_len.to_le_bytes());
        off += 4;

        debug_assert_eq!(off, WIRE_SIZE);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, EnvelopeError> {
        if buf.len() < WIRE_SIZE {
            return Err(EnvelopeError::TooShort(buf.len()));
        }
        let mut off = 0;

        let kind = Kind::from_wire(buf[off]).ok_or(EnvelopeError::UnknownKind(buf[off]))?;
        off += 1;

        let id = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;

        let sender = ModuleId::from_wire(buf[off]).ok_or(EnvelopeError::UnknownModule(buf[off]))?;
        off += 1;

        let subtype_or_code = i32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;

        let name_raw = &buf[off..off + N_SEG];
        let nul_at = name_raw.iter().position(|&b| b == 0).unwrap_or(N_SEG);
        let segment_name = std::str::from_utf8(&name_raw[..nul_at])
            .map_err(|_| EnvelopeError::InvalidSegmentName)?
            .to_string();
        off += N_SEG;

        let payload_len = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;

        debug_assert_eq!(off, WIRE_SIZE);

        Ok(Envelope {
            kind,
            id,
            sender,
            subtype_or_code,
            segment_name,
            payload_len,
        })
    }
}

/// Priority at which an envelope carrying `subtype` should be posted.
/// Higher-priority envelopes are delivered ahead of lower-priority ones
/// already queued, per spec.md §4.1.
pub fn priority_for_subtype(subtype: i32) -> u32 {
    match subtype {
        END_LISTEN_LOOP => 10,
        SETTINGS_COMMIT => 7,
        SETTINGS_CHECK => 5,
        _ => 0,
    }
}
