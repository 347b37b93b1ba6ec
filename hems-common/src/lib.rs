// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! Types and helpers shared across every HEMS fabric crate: the module
//! identifier enumeration, the exit latch and signal handlers,
//! environment-based configuration helpers and a small shared error type.

pub mod config;
pub mod error;
pub mod exit;
pub mod module;

pub use error::Error;
pub use exit::ExitLatch;
pub use module::ModuleId;
