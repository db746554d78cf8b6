// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::Serialize;
use thiserror::Error;

/// The interactive session state machine.
pub mod interactive;
/// Session registry and id allocation.
pub mod manager;
/// Statements and their completion slots.
pub mod statement;

/// Observable session lifecycle states. `Dead` is terminal; nothing is
/// observed after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Idle,
    Busy,
    ShuttingDown,
    Error,
    Dead,
}

impl SessionState {
    /// Only `Idle` and `Busy` admit client operations.
    pub fn is_running(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Busy)
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            SessionState::Starting => 0,
            SessionState::Idle => 1,
            SessionState::Busy => 2,
            SessionState::ShuttingDown => 3,
            SessionState::Error => 4,
            SessionState::Dead => 5,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Starting,
            1 => SessionState::Idle,
            2 => SessionState::Busy,
            3 => SessionState::ShuttingDown,
            4 => SessionState::Error,
            _ => SessionState::Dead,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Starting => "starting",
            SessionState::Idle => "idle",
            SessionState::Busy => "busy",
            SessionState::ShuttingDown => "shutting_down",
            SessionState::Error => "error",
            SessionState::Dead => "dead",
        })
    }
}

/// Session-level failures surfaced synchronously to the frontend.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {id} is not running (state: {state})")]
    NotRunning { id: u32, state: SessionState },

    #[error("no such job: {0}")]
    NoSuchJob(u64),
}

/// One tracked bypass job: the remote handle plus the submission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub handle: i64,
    pub synchronous: bool,
}

/// Snapshot of a bypass job as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub op_id: u64,
    pub state: String,
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
}
