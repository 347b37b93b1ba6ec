// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! The inter-process messaging fabric: envelopes, the channel registry,
//! payload codec, request/response correlation, settings protocol types,
//! and the Messenger Core that ties them together.

pub mod codec;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod messenger;
pub mod registry;
pub mod settings;

pub use correlation::CorrelationTable;
pub use envelope::{Envelope, Kind};
pub use error::{MessengerError, SendError};
pub use handler::{Handler, HandlerCtx, HandlerOutcome};
pub use messenger::{default_send_timeout, Messenger};
pub use registry::{ChannelRegistry, Family};
pub use settings::{Settings, SettingsCode};
