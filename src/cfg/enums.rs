// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Interpreter flavor hosted by the remote driver.
///
/// The kind is fixed at session creation and forwarded to the driver through
/// the synthesized configuration; it never changes for the lifetime of a
/// session.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    #[serde(rename = "spark", alias = "Spark", alias = "SPARK")]
    Spark,
    #[serde(rename = "pyspark", alias = "PySpark", alias = "PYSPARK")]
    PySpark,
    #[serde(rename = "sparkr", alias = "SparkR", alias = "SPARKR")]
    SparkR,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionKind::Spark => "spark",
            SessionKind::PySpark => "pyspark",
            SessionKind::SparkR => "sparkr",
        })
    }
}

/// SASL quality-of-protection preference.
///
/// `Auth` authenticates only; `AuthInt` additionally seals every
/// post-handshake frame with the RFC 2831 integrity layer. Confidentiality
/// (`auth-conf`) is not supported and fails the handshake if it is the only
/// option the peer offers.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Qop {
    #[default]
    #[serde(rename = "auth", alias = "Auth", alias = "AUTH")]
    Auth,
    #[serde(rename = "auth-int", alias = "AuthInt", alias = "AUTH-INT")]
    AuthInt,
}

impl fmt::Display for Qop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        })
    }
}

impl Qop {
    /// Parse a QOP token as it appears in a mechanism challenge.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "auth" => Some(Qop::Auth),
            "auth-int" => Some(Qop::AuthInt),
            _ => None,
        }
    }
}
