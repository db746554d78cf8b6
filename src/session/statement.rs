// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde_json::Value;
use tokio::sync::watch;

/// Terminal outcome of an asynchronous operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Value(T),
    Error(String),
    Cancelled,
}

/// A write-once completion slot with any number of waiters.
///
/// The slot starts pending; the first `resolve` wins and every later one is
/// ignored, so a completed result is immutable. Waiters observe exactly the
/// terminal outcome.
#[derive(Debug)]
pub struct Completion<T> {
    tx: watch::Sender<Option<Outcome<T>>>,
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Resolve the slot. Returns `false` when it was already resolved.
    pub fn resolve(&self, outcome: Outcome<T>) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = outcome.take();
                true
            } else {
                false
            }
        })
    }

    /// Non-blocking look at the slot; `None` is the pending marker.
    pub fn peek(&self) -> Option<Outcome<T>> {
        self.tx.borrow().clone()
    }

    pub fn is_pending(&self) -> bool {
        self.tx.borrow().is_none()
    }

    /// Wait for the terminal outcome.
    pub async fn wait(&self) -> Outcome<T> {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(v) = rx.borrow_and_update().clone() {
                return v;
            }
            if rx.changed().await.is_err() {
                return Outcome::Cancelled;
            }
        }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One REPL code submission.
///
/// Ids are dense per session, assigned in submission order starting at 0.
/// The result slot resolves with the driver's JSON document (an object with
/// a `status` field) once polling finishes.
#[derive(Debug)]
pub struct Statement {
    pub id: u32,
    pub code: String,
    pub result: Completion<Value>,
}

impl Statement {
    pub fn new(id: u32, code: &str) -> Self {
        Self {
            id,
            code: code.to_string(),
            result: Completion::new(),
        }
    }
}
