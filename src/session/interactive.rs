// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde_json::Value;
use tokio::{sync::Mutex, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    cfg::{config::Config, enums::SessionKind},
    client::rpc::Rpc,
    models::{
        common::{Message, WireBody},
        header::NullMessage,
        repl::{
            AddFile, AddJar, BypassHandle, BypassJob, BypassJobState, BypassJobStatus,
            CancelJob, Ping, ReplCode, ReplJobResult, ReplResult, ReplState,
            ReplStateReply,
        },
    },
    session::{
        JobStatus, Operation, SessionError, SessionState,
        statement::{Outcome, Statement},
    },
};

/// Fixed backoff between result polls.
const POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Everything guarded by the per-session mutex: the state field and the
/// statement/operation tables. State reads outside the mutex go through the
/// atomic snapshot and are advisory only.
struct Inner {
    state: SessionState,
    statements: Vec<Arc<Statement>>,
    operations: HashMap<u64, Operation>,
}

/// One interactive session: a remote driver plus the manager-side tracking
/// structures.
///
/// Created in `Starting`; a background task connects the RPC channel, pings
/// the driver and flips the session to `Idle`. Any transport failure drives
/// the session through `Error` to `Dead` and the session must be recreated;
/// nothing is recovered across a lost channel.
pub struct InteractiveSession {
    pub id: u32,
    pub owner: String,
    pub proxy_user: Option<String>,
    pub kind: SessionKind,
    pub created: DateTime<Utc>,
    last_activity: AtomicI64,
    inner: Mutex<Inner>,
    state_snapshot: AtomicU8,
    rpc: OnceCell<Arc<Rpc>>,
    /// Operation ids are monotonic from 1 and never reused, even after
    /// cancellation.
    next_op_id: AtomicU64,
    /// Weak self-reference for spawning statement tasks from `&self`.
    self_weak: OnceCell<Weak<InteractiveSession>>,
    cfg: Config,
}

impl InteractiveSession {
    /// Build the session and start connecting in the background. The caller
    /// observes `Starting` until the readiness ping succeeds.
    pub fn create(id: u32, cfg: Config) -> Arc<Self> {
        let now = Utc::now();
        let session = Arc::new(Self {
            id,
            owner: cfg.session.owner.clone(),
            proxy_user: cfg.session.proxy_user.clone(),
            kind: cfg.session.kind,
            created: now,
            last_activity: AtomicI64::new(now.timestamp_millis()),
            inner: Mutex::new(Inner {
                state: SessionState::Starting,
                statements: Vec::new(),
                operations: HashMap::new(),
            }),
            state_snapshot: AtomicU8::new(SessionState::Starting.as_u8()),
            rpc: OnceCell::new(),
            next_op_id: AtomicU64::new(1),
            self_weak: OnceCell::new(),
            cfg,
        });
        let _ = session.self_weak.set(Arc::downgrade(&session));

        let boot = Arc::clone(&session);
        tokio::spawn(async move { boot.connect_and_ping().await });

        session
    }

    /// Advisory state snapshot; not linearized with in-flight transitions.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state_snapshot.load(Ordering::SeqCst))
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_activity.load(Ordering::SeqCst))
            .unwrap_or_else(Utc::now)
    }

    /* -------------------- startup & channel monitor -------------------- */

    async fn connect_and_ping(self: Arc<Self>) {
        info!(
            "session {}: connecting to {}",
            self.id, self.cfg.rpc.driver_address
        );
        let rpc = match Rpc::connect(&self.cfg).await {
            Ok(rpc) => rpc,
            Err(e) => {
                warn!("session {}: connect failed: {e:#}", self.id);
                self.fail_to_dead().await;
                return;
            },
        };

        if self.rpc.set(Arc::clone(&rpc)).is_err() {
            rpc.close();
            return;
        }

        let monitor = Arc::clone(&self);
        let token = rpc.close_token();
        tokio::spawn(async move {
            token.cancelled().await;
            monitor.on_channel_inactive().await;
        });

        match rpc.call::<NullMessage>(Ping).await {
            Ok(_) => {
                if self
                    .transition_from(SessionState::Starting, SessionState::Idle)
                    .await
                {
                    info!("session {} is ready", self.id);
                } else {
                    // Stopped while still starting; drop the fresh channel.
                    rpc.close();
                }
            },
            Err(e) => {
                warn!("session {}: readiness ping failed: {e:#}", self.id);
                self.fail_to_dead().await;
                rpc.close();
            },
        }
    }

    async fn on_channel_inactive(&self) {
        let mut g = self.inner.lock().await;
        match g.state {
            SessionState::ShuttingDown | SessionState::Dead => {},
            _ => {
                warn!("session {}: rpc channel went inactive", self.id);
                self.set_state(&mut g, SessionState::Error);
                self.set_state(&mut g, SessionState::Dead);
            },
        }
    }

    /* -------------------- frontend operations -------------------- */

    /// Admit, assign the next dense statement id, flip to `Busy` and start
    /// the background submit/poll task. Never fails after admission.
    pub async fn execute_statement(&self, code: &str) -> Result<Arc<Statement>> {
        let stmt = {
            let mut g = self.inner.lock().await;
            self.ensure_running(&g)?;
            self.touch();
            let stmt = Arc::new(Statement::new(g.statements.len() as u32, code));
            g.statements.push(Arc::clone(&stmt));
            self.set_state(&mut g, SessionState::Busy);
            stmt
        };

        match self.self_weak.get().and_then(Weak::upgrade) {
            Some(runner) => {
                let task_stmt = Arc::clone(&stmt);
                tokio::spawn(async move { runner.run_statement(task_stmt).await });
            },
            None => {
                stmt.result
                    .resolve(Outcome::Error("session is shutting down".to_string()));
            },
        }

        Ok(stmt)
    }

    /// Submit an opaque job with blocking driver-side semantics.
    pub async fn run_job(&self, job: Vec<u8>) -> Result<u64> {
        self.submit_bypass(job, true).await
    }

    /// Submit an opaque job asynchronously.
    pub async fn submit_job(&self, job: Vec<u8>) -> Result<u64> {
        self.submit_bypass(job, false).await
    }

    async fn submit_bypass(&self, job: Vec<u8>, synchronous: bool) -> Result<u64> {
        {
            let g = self.inner.lock().await;
            self.ensure_running(&g)?;
        }
        self.touch();

        let rpc = self.rpc()?;
        let handle: BypassHandle = rpc.call(BypassJob { job, synchronous }).await?;

        let op_id = self.next_op_id.fetch_add(1, Ordering::SeqCst);
        let mut g = self.inner.lock().await;
        g.operations.insert(
            op_id,
            Operation {
                handle: handle.id,
                synchronous,
            },
        );
        debug!(
            "session {}: op {op_id} -> remote handle {}",
            self.id, handle.id
        );
        Ok(op_id)
    }

    /// Query a tracked job. Fails with not-found for unknown (or cancelled)
    /// ids; otherwise blocks until the driver replies.
    pub async fn job_status(&self, op_id: u64) -> Result<JobStatus> {
        let handle = {
            let g = self.inner.lock().await;
            g.operations.get(&op_id).map(|op| op.handle)
        }
        .ok_or(SessionError::NoSuchJob(op_id))?;
        self.touch();

        let rpc = self.rpc()?;
        let st: BypassJobState = rpc.call(BypassJobStatus { handle }).await?;
        Ok(JobStatus {
            op_id,
            state: st.state,
            result: st.result,
            error: st.error,
        })
    }

    /// Remove local tracking, then signal the remote exactly once.
    /// Idempotent: unknown ids are ignored and nothing reaches the wire.
    pub async fn cancel_job(&self, op_id: u64) -> Result<()> {
        let removed = {
            let mut g = self.inner.lock().await;
            g.operations.remove(&op_id)
        };
        let Some(op) = removed else {
            debug!("session {}: cancel for unknown op {op_id} ignored", self.id);
            return Ok(());
        };
        self.touch();

        let rpc = self.rpc()?;
        // Fire-and-forget: tracking is already gone, the ack is dropped.
        drop(
            rpc.send_call(
                Message::from(CancelJob { handle: op.handle }),
                NullMessage::NAME,
            )
            .await?,
        );
        Ok(())
    }

    pub async fn add_file(&self, uri: &str) -> Result<()> {
        self.add_resource(Message::from(AddFile {
            uri: uri.to_string(),
        }))
        .await
    }

    pub async fn add_jar(&self, uri: &str) -> Result<()> {
        self.add_resource(Message::from(AddJar {
            uri: uri.to_string(),
        }))
        .await
    }

    async fn add_resource(&self, msg: Message) -> Result<()> {
        {
            let g = self.inner.lock().await;
            self.ensure_running(&g)?;
        }
        self.touch();

        let rpc = self.rpc()?;
        let _: NullMessage = rpc.call(msg).await?;
        Ok(())
    }

    /// Equivalent to [`stop`](Self::stop) in the current contract.
    pub async fn interrupt(&self) -> Result<()> {
        self.stop().await
    }

    /// Drive the session to `Dead`, closing the channel cleanly.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut g = self.inner.lock().await;
            match g.state {
                SessionState::Dead => return Ok(()),
                // A lost session goes straight to Dead; there is nothing
                // orderly left to shut down.
                SessionState::Error => {},
                _ => self.set_state(&mut g, SessionState::ShuttingDown),
            }
        }

        if let Some(rpc) = self.rpc.get() {
            rpc.shutdown().await;
        }

        let mut g = self.inner.lock().await;
        self.set_state(&mut g, SessionState::Dead);
        info!("session {} stopped", self.id);
        Ok(())
    }

    /* -------------------- statement polling -------------------- */

    async fn run_statement(self: Arc<Self>, stmt: Arc<Statement>) {
        let rpc = match self.rpc() {
            Ok(rpc) => rpc,
            Err(e) => {
                stmt.result.resolve(Outcome::Error(format!("{e:#}")));
                return;
            },
        };

        if let Err(e) = rpc
            .call::<NullMessage>(ReplCode {
                id: stmt.id,
                code: stmt.code.clone(),
            })
            .await
        {
            warn!(
                "session {}: statement {} submit failed: {e:#}",
                self.id, stmt.id
            );
            stmt.result.resolve(Outcome::Error(format!("{e:#}")));
            return;
        }

        let value = loop {
            match rpc.call::<ReplResult>(ReplJobResult { id: stmt.id }).await {
                Ok(ReplResult { result: None }) => sleep(POLL_INTERVAL).await,
                Ok(ReplResult { result: Some(doc) }) => {
                    match serde_json::from_str::<Value>(&doc) {
                        Ok(v) => break v,
                        Err(e) => {
                            stmt.result.resolve(Outcome::Error(format!(
                                "malformed result document: {e}"
                            )));
                            return;
                        },
                    }
                },
                Err(e) => {
                    warn!(
                        "session {}: statement {} poll failed: {e:#}",
                        self.id, stmt.id
                    );
                    stmt.result.resolve(Outcome::Error(format!("{e:#}")));
                    return;
                },
            }
        };

        let errored = value.get("status").and_then(Value::as_str) == Some("error");
        if errored && self.repl_is_wedged(&rpc).await {
            warn!("session {}: driver reports a wedged interpreter", self.id);
            let mut g = self.inner.lock().await;
            if g.state.is_running() {
                self.set_state(&mut g, SessionState::Error);
            }
        } else {
            let mut g = self.inner.lock().await;
            if g.state == SessionState::Busy {
                self.set_state(&mut g, SessionState::Idle);
            }
        }

        stmt.result.resolve(Outcome::Value(value));
    }

    /// On an error-status result, ask the driver whether the interpreter is
    /// globally wedged. Transport failures here are not wedging; the channel
    /// monitor handles them.
    async fn repl_is_wedged(&self, rpc: &Rpc) -> bool {
        matches!(
            rpc.call::<ReplStateReply>(ReplState).await,
            Ok(reply) if reply.state == "error"
        )
    }

    /* -------------------- accessors -------------------- */

    pub async fn statement(&self, id: u32) -> Option<Arc<Statement>> {
        self.inner.lock().await.statements.get(id as usize).cloned()
    }

    pub async fn statement_count(&self) -> usize {
        self.inner.lock().await.statements.len()
    }

    /// Number of jobs still tracked (submitted and not cancelled).
    pub async fn tracked_jobs(&self) -> usize {
        self.inner.lock().await.operations.len()
    }

    /* -------------------- internals -------------------- */

    fn ensure_running(&self, g: &Inner) -> Result<(), SessionError> {
        if g.state.is_running() {
            Ok(())
        } else {
            Err(SessionError::NotRunning {
                id: self.id,
                state: g.state,
            })
        }
    }

    fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    fn rpc(&self) -> Result<Arc<Rpc>> {
        self.rpc
            .get()
            .cloned()
            .context("rpc channel not established")
    }

    fn set_state(&self, g: &mut Inner, next: SessionState) {
        debug!("session {}: {} -> {next}", self.id, g.state);
        g.state = next;
        self.state_snapshot.store(next.as_u8(), Ordering::SeqCst);
    }

    async fn transition_from(&self, from: SessionState, to: SessionState) -> bool {
        let mut g = self.inner.lock().await;
        if g.state == from {
            self.set_state(&mut g, to);
            true
        } else {
            false
        }
    }

    async fn fail_to_dead(&self) {
        let mut g = self.inner.lock().await;
        if g.state == SessionState::Dead {
            return;
        }
        self.set_state(&mut g, SessionState::Error);
        self.set_state(&mut g, SessionState::Dead);
    }
}
