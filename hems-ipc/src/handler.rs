// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! The handler surface a worker registers against, unifying commands and
//! requests under one signature, mirroring the original's
//! `(text_iarchive&, text_oarchive*)` pattern where a null `oarchive*`
//! means "this is a command, no response expected" (see
//! `original_source/include/hems/common/messenger.h`).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use hems_common::ModuleId;

/// Everything a handler needs about the message it was invoked for.
#[derive(Debug, Clone)]
pub struct HandlerCtx {
    pub sender: ModuleId,
    pub subtype: i32,
    pub payload: Vec<u8>,
}

/// A handler's outcome. Commands return `Command`; requests must return
/// `Response` with a response code and the encoded reply payload. The
/// code carries protocol-level status (e.g. a [`crate::settings::SettingsCode`]);
/// ordinary request handlers that have nothing to report use code `0`.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Command,
    Response { code: i32, payload: Vec<u8> },
}

impl HandlerOutcome {
    pub fn ok(payload: Vec<u8>) -> Self {
        HandlerOutcome::Response { code: 0, payload }
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<HandlerOutcome>> + Send>>;

/// A registered handler. Boxed as a trait object since handlers close over
/// per-worker state (settings, storage handles, etc).
pub trait Handler: Send + Sync {
    fn call(&self, ctx: HandlerCtx) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(HandlerCtx) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HandlerOutcome>> + Send + 'static,
{
    fn call(&self, ctx: HandlerCtx) -> HandlerFuture {
        Box::pin(self(ctx))
    }
}

pub type BoxedHandler = Arc<dyn Handler>;
