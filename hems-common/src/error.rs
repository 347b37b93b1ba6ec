// Copyright 2023-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors shared across the fabric's own crates, grounded on the error enum
/// style of `ddcommon::unix_utils::process` (`ReapError`, `PollError`).
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
