// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde::{Deserialize, Serialize};

/// Readiness probe. The driver acknowledges with a null payload once its
/// interpreter and compute context are up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ping;

/// Submit one REPL statement for asynchronous execution.
///
/// `id` is the session-local statement id; results are fetched separately
/// with [`ReplJobResult`] until the driver reports a non-null document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplCode {
    pub id: u32,
    pub code: String,
}

/// Poll for the result of a previously submitted statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplJobResult {
    pub id: u32,
}

/// Reply to [`ReplJobResult`].
///
/// `None` while the statement is still running; otherwise the JSON result
/// document (an object with at least a `status` field of `"ok"` or
/// `"error"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplResult {
    pub result: Option<String>,
}

/// Ask the driver for the global interpreter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplState;

/// Reply to [`ReplState`]: `"idle"`, `"busy"` or `"error"`. An `"error"`
/// state means the interpreter is wedged and the session must be discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplStateReply {
    pub state: String,
}

/// Submit an opaque serialized job for execution outside the REPL.
///
/// `synchronous` asks the driver to run the job to completion before
/// acknowledging; otherwise the job is queued and tracked via its handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassJob {
    pub job: Vec<u8>,
    pub synchronous: bool,
}

/// Reply to [`BypassJob`]: the remote handle used for status queries and
/// cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassHandle {
    pub id: i64,
}

/// Query the state of a bypass job by its remote handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassJobStatus {
    pub handle: i64,
}

/// Reply to [`BypassJobStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassJobState {
    pub state: String,
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
}

/// Cancel a bypass job by its remote handle. Fire-and-forget on the client
/// side; the driver acknowledges with a null payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelJob {
    pub handle: i64,
}

/// Make a file available to the driver process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddFile {
    pub uri: String,
}

/// Add a jar to the driver classpath.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddJar {
    pub uri: String,
}
