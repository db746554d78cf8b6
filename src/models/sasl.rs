// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde::{Deserialize, Serialize};

/// Handshake frame exchanged before the channel is ready.
///
/// `client_id` identifies the connecting client and is only set on the very
/// first message of the exchange; every later round trip carries the bare
/// mechanism token. SASL frames always travel on the raw path, before any
/// negotiated integrity layer is installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaslMessage {
    pub client_id: Option<String>,
    pub payload: Vec<u8>,
}

impl SaslMessage {
    /// First message of the exchange, announcing the client identity.
    pub fn hello(client_id: &str, payload: Vec<u8>) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            payload,
        }
    }

    /// A follow-up mechanism token (no client id after the first message).
    pub fn token(payload: Vec<u8>) -> Self {
        Self {
            client_id: None,
            payload,
        }
    }
}
