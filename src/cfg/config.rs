// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::{Qop, SessionKind};

/// Environment variables forwarded verbatim to the external driver
/// launcher. The manager never interprets them; the names are a contract
/// with the launcher and must not change.
pub const PASSTHROUGH_ENV: &[&str] = &[
    "LIVY_HOME",
    "SPARK_HOME",
    "PYSPARK_ARCHIVES_PATH",
    "SPARKR_ARCHIVES_PATH",
    "LIVY_REPL_JAVA_OPTS",
];

/// The only SASL mechanism this client implements.
pub const MECHANISM_DIGEST_MD5: &str = "DIGEST-MD5";

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// RPC channel parameters (timeouts, sizes, SASL negotiation).
    pub rpc: RpcConfig,
    /// Shared-secret credentials presented during the handshake.
    pub client: ClientConfig,
    /// Session identity (kind, owner, proxy user).
    pub session: SessionConfig,
    /// REPL driver staging paths forwarded to the launcher.
    pub repl: ReplConfig,
}

/// Parameters of the channel to the remote driver.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RpcConfig {
    #[serde(rename = "DriverAddress")]
    /// `host:port` the driver listens on.
    pub driver_address: String,

    #[serde(rename = "ConnectTimeout", with = "serde_millis")]
    /// Timeout for establishing the TCP connection (milliseconds).
    pub connect_timeout: Duration,

    #[serde(rename = "HandshakeTimeout", with = "serde_millis")]
    /// Timeout for the whole SASL exchange (milliseconds), distinct from
    /// the connect timeout.
    pub handshake_timeout: Duration,

    #[serde(rename = "MaxMessageSize")]
    /// Upper bound on a single frame body, in bytes.
    pub max_message_size: usize,

    #[serde(rename = "ChannelLogLevel", default = "default_channel_log_level")]
    /// Log level applied to the channel logger target.
    pub channel_log_level: String,

    #[serde(rename = "SaslMechanisms")]
    /// Mechanisms offered to the peer, in preference order.
    pub sasl_mechanisms: Vec<String>,

    #[serde(rename = "SaslQop", default)]
    /// Strongest quality-of-protection the client is willing to negotiate.
    pub sasl_qop: Qop,
}

fn default_channel_log_level() -> String {
    "info".to_string()
}

/// Credentials for the authenticated handshake.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClientConfig {
    #[serde(rename = "ClientId")]
    /// Identity announced in the first SASL frame and used as the
    /// mechanism username.
    pub client_id: String,

    #[serde(rename = "Secret")]
    /// Shared secret; never serialized into the driver configuration.
    pub secret: String,
}

/// Session identity parameters.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SessionConfig {
    #[serde(rename = "Kind")]
    /// Interpreter flavor for the driver.
    pub kind: SessionKind,

    #[serde(rename = "Owner")]
    /// Owning user as reported by the frontend.
    pub owner: String,

    #[serde(default, rename = "ProxyUser")]
    /// Optional impersonated user.
    pub proxy_user: Option<String>,
}

/// Driver staging paths. Consumed by the external launcher, carried here so
/// the manager can synthesize the driver configuration.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ReplConfig {
    #[serde(default, rename = "JarsPath")]
    /// Location of the REPL jars bundle.
    pub jars_path: String,

    #[serde(default, rename = "DriverClasspath")]
    /// Extra classpath entries for the driver process.
    pub driver_classpath: String,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates invariants the rest of the crate relies on.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.rpc.driver_address.is_empty(),
            "DriverAddress must not be empty"
        );
        ensure!(
            self.rpc.connect_timeout > Duration::ZERO,
            "ConnectTimeout must be > 0"
        );
        ensure!(
            self.rpc.handshake_timeout > Duration::ZERO,
            "HandshakeTimeout must be > 0"
        );
        ensure!(
            self.rpc.max_message_size >= 1024,
            "MaxMessageSize must be at least 1024 bytes"
        );
        ensure!(
            !self.rpc.sasl_mechanisms.is_empty(),
            "SaslMechanisms must not be empty"
        );
        ensure!(
            self.rpc
                .sasl_mechanisms
                .iter()
                .any(|m| m == MECHANISM_DIGEST_MD5),
            "SaslMechanisms must include {MECHANISM_DIGEST_MD5} (only implemented mechanism)"
        );
        ensure!(!self.client.client_id.is_empty(), "ClientId must not be empty");
        ensure!(!self.client.secret.is_empty(), "Secret must not be empty");
        ensure!(!self.session.owner.is_empty(), "Owner must not be empty");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver configuration synthesis

/// Builds a null-delimited `key=value` list, skipping `None` entries and
/// sorting by key name for a canonical order.
fn build_kv_sorted<'a, I>(items: I) -> Vec<u8>
where I: IntoIterator<Item = (&'a str, Option<String>)> {
    let mut vec: Vec<(String, String)> = items
        .into_iter()
        .filter_map(|(k, v)| v.map(|vv| (k.to_string(), vv)))
        .collect();

    // Canonical order is alphabetical by key name (stable).
    vec.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let mut out =
        Vec::with_capacity(vec.iter().map(|(k, v)| k.len() + 1 + v.len() + 1).sum());
    for (k, v) in vec {
        out.extend_from_slice(k.as_bytes());
        out.push(b'=');
        out.extend_from_slice(v.as_bytes());
        out.push(0);
    }
    out
}

/// Synthesizes the canonical configuration blob handed to the driver
/// launcher. The shared secret is deliberately excluded; it only ever
/// travels through the SASL exchange.
pub fn driver_conf(cfg: &Config) -> Vec<u8> {
    let s = &cfg.session;
    let r = &cfg.repl;

    build_kv_sorted([
        ("session.kind", Some(s.kind.to_string())),
        ("session.owner", Some(s.owner.clone())),
        ("proxy.user", s.proxy_user.clone()),
        ("client.id", Some(cfg.client.client_id.clone())),
        (
            "repl.jars",
            (!r.jars_path.is_empty()).then(|| r.jars_path.clone()),
        ),
        (
            "repl.driver-classpath",
            (!r.driver_classpath.is_empty()).then(|| r.driver_classpath.clone()),
        ),
    ])
}

/// Collects the pass-through environment for the launcher: every variable in
/// [`PASSTHROUGH_ENV`] that is set in the manager's own environment.
pub fn driver_env() -> Vec<(String, String)> {
    PASSTHROUGH_ENV
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|v| (name.to_string(), v)))
        .collect()
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
