// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, anyhow};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::models::common::{Message, WireMessage};

struct PendingRpc {
    tx: oneshot::Sender<Result<Message>>,
    /// Expected reply class, kept for the debug logs only.
    name: &'static str,
}

/// Receive-side router for one channel.
///
/// Pending calls are registered *before* their frames are written, so the
/// reply cannot race the registration. The map is concurrent because
/// registration happens on caller tasks while completion happens on the
/// channel's read loop.
#[derive(Default)]
pub struct Dispatcher {
    pending: DashMap<i64, PendingRpc>,
    handlers: DashMap<&'static str, mpsc::UnboundedSender<Message>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outstanding call. Must happen before the frames hit the
    /// socket.
    pub fn register_rpc(
        &self,
        id: i64,
        tx: oneshot::Sender<Result<Message>>,
        name: &'static str,
    ) {
        debug!("registered rpc id={id} expecting {name}");
        if self.pending.insert(id, PendingRpc { tx, name }).is_some() {
            warn!("rpc id={id} was already registered; previous call dropped");
        }
    }

    /// Forget a registration whose send failed before reaching the wire.
    pub fn discard_rpc(&self, id: i64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Resolve an outstanding call with a reply or a remote error. Unknown
    /// ids are logged and dropped.
    pub fn complete(&self, id: i64, result: Result<Message>) {
        match self.pending.remove(&id) {
            Some((_, p)) => {
                debug!("completing rpc id={id} ({})", p.name);
                // The caller may have given up on the receiver; that is fine.
                let _ = p.tx.send(result);
            },
            None => warn!("no pending rpc for id={id}, dropping reply"),
        }
    }

    /// Fail every outstanding call. Called exactly once, when the channel
    /// goes inactive or is closed.
    pub fn discard_all(&self, cause: &str) {
        let ids: Vec<i64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, p)) = self.pending.remove(&id) {
                debug!("failing rpc id={id} ({}): {cause}", p.name);
                let _ = p.tx.send(Err(anyhow!("{cause}")));
            }
        }
    }

    /// Subscribe to server-initiated messages of one wire class.
    pub fn register_handler(
        &self,
        name: &'static str,
        tx: mpsc::UnboundedSender<Message>,
    ) {
        self.handlers.insert(name, tx);
    }

    /// Route one server-initiated message by its class name.
    pub fn dispatch_inbound(&self, msg: Message) {
        let name = msg.tag();
        match self.handlers.get(name) {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    warn!("handler for {name} is gone, dropping message");
                }
            },
            None => warn!("no handler registered for inbound {name}, dropping"),
        }
    }

    /// Number of calls still awaiting a reply.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}
