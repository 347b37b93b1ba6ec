// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! Request/response correlation, grounded on spec.md §9's own suggested
//! alternative to the original's condvar + notified-id-set design: a table
//! of one-shot channels keyed by request id. `tokio::sync::oneshot` gives
//! each waiter its own wakeup without a shared condvar or a set that every
//! response has to be checked against.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::envelope::Envelope;

#[derive(Default)]
pub struct CorrelationTable {
    waiters: Mutex<HashMap<u32, oneshot::Sender<Envelope>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in the response to `id`, returning the receiving
    /// half. Must be called before the request envelope is sent, so no
    /// response can race ahead of the registration.
    pub fn register(&self, id: u32) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(id, tx);
        rx
    }

    /// Delivers a response envelope to its waiter, if one is still
    /// registered. Returns `false` if the id is unknown (e.g. the waiter
    /// already timed out and was removed), matching the original's
    /// tolerant drop of unmatched responses.
    pub fn deliver(&self, envelope: Envelope) -> bool {
        let sender = self.waiters.lock().unwrap().remove(&envelope.id);
        match sender {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Removes a waiter without delivering, used when a wait times out so
    /// a later stray response doesn't find a stale entry.
    pub fn forget(&self, id: u32) {
        self.waiters.lock().unwrap().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hems_common::ModuleId;

    fn envelope(id: u32) -> Envelope {
        Envelope {
            kind: crate::envelope::Kind::Response,
            id,
            sender: ModuleId::Storage,
            subtype_or_code: 0,
            segment_name: String::new(),
            payload_len: 0,
        }
    }

    #[tokio::test]
    async fn delivers_to_registered_waiter() {
        let table = CorrelationTable::new();
        let rx = table.register(1);
        assert!(table.deliver(envelope(1)));
        let got = rx.await.unwrap();
        assert_eq!(got.id, 1);
    }

    #[test]
    fn delivery_to_unknown_id_is_tolerated() {
        let table = CorrelationTable::new();
        assert!(!table.deliver(envelope(99)));
    }

    #[test]
    fn forget_removes_waiter() {
        let table = CorrelationTable::new();
        let _rx = table.register(5);
        table.forget(5);
        assert!(!table.deliver(envelope(5)));
    }
}
