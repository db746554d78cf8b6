// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tracing::info;

use crate::{cfg::config::Config, session::interactive::InteractiveSession};

/// In-memory registry of interactive sessions.
///
/// Ids are unique within one manager and assigned once. Nothing is durable:
/// a manager restart loses every session, and the remote drivers must be
/// recreated.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<u32, Arc<InteractiveSession>>,
    next_id: AtomicU32,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id and start a session from the given config. The
    /// returned session is in `Starting`; readiness is observed through its
    /// state.
    pub fn create_session(&self, cfg: &Config) -> Arc<InteractiveSession> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = InteractiveSession::create(id, cfg.clone());
        self.sessions.insert(id, Arc::clone(&session));
        info!(
            "created session {id} (kind={}, owner={})",
            session.kind, session.owner
        );
        session
    }

    pub fn get(&self, id: u32) -> Option<Arc<InteractiveSession>> {
        self.sessions.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Stop a session and drop it from the registry.
    pub async fn stop_session(&self, id: u32) -> Result<()> {
        let (_, session) = self
            .sessions
            .remove(&id)
            .with_context(|| format!("unknown session id={id}"))?;
        session.stop().await
    }

    /// Stop every registered session sequentially.
    pub async fn stop_all(&self) -> Result<()> {
        for id in self.sessions.iter().map(|e| *e.key()).collect::<Vec<_>>() {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.stop().await?;
            }
        }
        Ok(())
    }

    pub fn active(&self) -> usize {
        self.sessions.len()
    }
}
