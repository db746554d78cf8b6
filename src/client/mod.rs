// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use thiserror::Error;

/// Frame I/O helpers shared by the connection and the handshake.
pub mod common;
/// Reply routing tables.
pub mod dispatcher;
/// The RPC channel to the remote driver.
pub mod rpc;
/// DIGEST-MD5 negotiation and the optional integrity layer.
pub mod sasl;

/// Channel-level failures the frontend may need to distinguish from plain
/// I/O errors. Wrapped in `anyhow::Error` at function boundaries.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc channel is closed")]
    Closed,

    #[error("sasl handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("sasl negotiation failed: {0}")]
    Sasl(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("unexpected reply class: expected {expected}, got {got}")]
    UnexpectedReply {
        expected: &'static str,
        got: &'static str,
    },
}
