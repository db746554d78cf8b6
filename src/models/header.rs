// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde::{Deserialize, Serialize};

/// Role of a logical RPC message pair.
///
/// Every application exchange on the channel starts with a [`MessageHeader`]
/// frame carrying one of these kinds, followed by exactly one payload frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcKind {
    /// An outbound request (or a server-initiated notification).
    Call,
    /// A successful reply to a previously sent call.
    Reply,
    /// A failed reply; the payload carries the remote error description.
    Error,
}

/// First frame of every logical message.
///
/// `id` correlates a `Reply`/`Error` with the `Call` that produced it. Ids are
/// monotonic for the lifetime of a connection and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub id: i64,
    pub kind: RpcKind,
}

/// The canonical null payload, used to acknowledge calls that carry no
/// result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NullMessage;

/// Payload of an `Error`-kind header: the remote failure rendered as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub message: String,
}
