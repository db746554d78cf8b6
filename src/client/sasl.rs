// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! DIGEST-MD5 (RFC 2831) negotiation for the channel handshake.
//!
//! Both halves of the exchange live here: the initiator used by the RPC
//! connection and the acceptor used by the driver side of the protocol. On
//! completion with `qop=auth-int` both derive the same pair of signing keys
//! and install a [`SecurityLayer`] that seals every later frame.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, Ordering},
};

use anyhow::{Context, Result, bail, ensure};
use md5::{Digest, Md5};
use rand::RngExt;

use crate::cfg::enums::Qop;

/// Protocol and server-name identifiers fixed by the wire contract; the
/// digest-uri both sides must present is `rsc/rsc`.
pub const DIGEST_URI: &str = "rsc/rsc";
/// Default realm when the peer's challenge does not carry one.
pub const DEFAULT_REALM: &str = "rsc";

/// Single round trip: nonce-count is always 1, the channel never rekeys.
const NONCE_COUNT: &str = "00000001";

const CLIENT_MAGIC: &[u8] =
    b"Digest session key to client-to-server signing key magic constant";
const SERVER_MAGIC: &[u8] =
    b"Digest session key to server-to-client signing key magic constant";

/* -------------------- helpers (digest math) -------------------- */

fn md5_concat(parts: &[&[u8]]) -> [u8; 16] {
    let mut h = Md5::new();
    for p in parts {
        h.update(p);
    }
    h.finalize().into()
}

fn lower_hex(d: &[u8]) -> String {
    hex::encode(d)
}

/// H(A1) for md5-sess: `MD5( MD5(user:realm:pass) : nonce : cnonce )`.
pub fn h_a1(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
) -> [u8; 16] {
    let inner = md5_concat(&[
        username.as_bytes(),
        b":",
        realm.as_bytes(),
        b":",
        password.as_bytes(),
    ]);
    md5_concat(&[&inner, b":", nonce.as_bytes(), b":", cnonce.as_bytes()])
}

/// The `response` (or `rspauth`) directive value.
///
/// `initial` selects the `AUTHENTICATE:` A2 prefix used for the client's
/// response; the server's `rspauth` uses an empty method.
pub fn response_value(
    a1: &[u8; 16],
    nonce: &str,
    cnonce: &str,
    qop: Qop,
    digest_uri: &str,
    initial: bool,
) -> String {
    let mut a2 = String::with_capacity(64);
    if initial {
        a2.push_str("AUTHENTICATE");
    }
    a2.push(':');
    a2.push_str(digest_uri);
    if qop != Qop::Auth {
        a2.push_str(":00000000000000000000000000000000");
    }

    let ha2 = md5_concat(&[a2.as_bytes()]);
    let kd = format!(
        "{}:{nonce}:{NONCE_COUNT}:{cnonce}:{qop}:{}",
        lower_hex(a1),
        lower_hex(&ha2)
    );
    lower_hex(&md5_concat(&[kd.as_bytes()]))
}

fn random_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    lower_hex(&bytes)
}

/* -------------------- helpers (directive parsing) -------------------- */

/// Split a challenge/response into its `key=value` directives. Values may be
/// quoted; commas inside quotes do not terminate a directive.
pub fn parse_directives(raw: &[u8]) -> Result<HashMap<String, String>> {
    let txt = std::str::from_utf8(raw).context("sasl token is not valid UTF-8")?;
    let mut out = HashMap::new();
    let mut rest = txt;

    loop {
        rest = rest.trim_start_matches([',', ' ']);
        if rest.is_empty() {
            break;
        }

        let eq = match rest.find('=') {
            Some(i) => i,
            None => bail!("malformed sasl directive near {rest:?}"),
        };
        let key = rest[..eq].trim().to_ascii_lowercase();
        let after = &rest[eq + 1..];

        let (value, remainder) = if let Some(stripped) = after.strip_prefix('"') {
            let close = stripped
                .find('"')
                .with_context(|| format!("unterminated quote in directive {key}"))?;
            (stripped[..close].to_string(), &stripped[close + 1..])
        } else {
            match after.find(',') {
                Some(i) => (after[..i].trim().to_string(), &after[i..]),
                None => (after.trim().to_string(), ""),
            }
        };

        out.insert(key, value);
        rest = remainder;
    }

    Ok(out)
}

fn pick_qop(offered: &str, strongest_allowed: Qop) -> Result<Qop> {
    let offered: Vec<Qop> = offered.split(',').filter_map(Qop::parse).collect();
    if strongest_allowed == Qop::AuthInt && offered.contains(&Qop::AuthInt) {
        return Ok(Qop::AuthInt);
    }
    if offered.contains(&Qop::Auth) {
        return Ok(Qop::Auth);
    }
    bail!("no mutually supported qop (peer offered only unsupported levels)");
}

/* -------------------- integrity layer -------------------- */

/// RFC 2831 §2.3 integrity layer (`qop=auth-int`).
///
/// Each sealed frame is `msg || HMAC-MD5(key, seq || msg)[..10] || 0x0001 ||
/// seq`, with independent big-endian sequence numbers per direction.
/// Sequence numbers start at zero and a gap or replay fails the unseal.
#[derive(Debug)]
pub struct SecurityLayer {
    seal_key: [u8; 16],
    unseal_key: [u8; 16],
    send_seq: AtomicU32,
    recv_seq: AtomicU32,
}

const MAC_LEN: usize = 10;
const TRAILER_LEN: usize = MAC_LEN + 2 + 4;

fn hmac_md5(key: &[u8; 16], seq: u32, msg: &[u8]) -> [u8; 16] {
    let mut ipad = [0x36u8; 64];
    let mut opad = [0x5cu8; 64];
    for (i, b) in key.iter().enumerate() {
        ipad[i] ^= b;
        opad[i] ^= b;
    }
    let inner = md5_concat(&[&ipad, &seq.to_be_bytes(), msg]);
    md5_concat(&[&opad, &inner])
}

impl SecurityLayer {
    /// Keys as seen from the connecting side.
    pub fn client(a1: &[u8; 16]) -> Self {
        Self {
            seal_key: md5_concat(&[a1, CLIENT_MAGIC]),
            unseal_key: md5_concat(&[a1, SERVER_MAGIC]),
            send_seq: AtomicU32::new(0),
            recv_seq: AtomicU32::new(0),
        }
    }

    /// Keys as seen from the accepting side.
    pub fn server(a1: &[u8; 16]) -> Self {
        Self {
            seal_key: md5_concat(&[a1, SERVER_MAGIC]),
            unseal_key: md5_concat(&[a1, CLIENT_MAGIC]),
            send_seq: AtomicU32::new(0),
            recv_seq: AtomicU32::new(0),
        }
    }

    pub fn seal(&self, msg: &[u8]) -> Vec<u8> {
        let seq = self.send_seq.fetch_add(1, Ordering::SeqCst);
        let mac = hmac_md5(&self.seal_key, seq, msg);

        let mut out = Vec::with_capacity(msg.len() + TRAILER_LEN);
        out.extend_from_slice(msg);
        out.extend_from_slice(&mac[..MAC_LEN]);
        out.extend_from_slice(&[0x00, 0x01]);
        out.extend_from_slice(&seq.to_be_bytes());
        out
    }

    pub fn unseal(&self, buf: &[u8]) -> Result<Vec<u8>> {
        ensure!(
            buf.len() >= TRAILER_LEN,
            "sealed frame too short: {} bytes",
            buf.len()
        );

        let (msg, trailer) = buf.split_at(buf.len() - TRAILER_LEN);
        let (mac, rest) = trailer.split_at(MAC_LEN);
        ensure!(rest[..2] == [0x00, 0x01], "unexpected sealed message type");

        let seq = u32::from_be_bytes([rest[2], rest[3], rest[4], rest[5]]);
        let expected = self.recv_seq.fetch_add(1, Ordering::SeqCst);
        ensure!(seq == expected, "sealed frame out of order: got seq {seq}, want {expected}");

        let want = hmac_md5(&self.unseal_key, seq, msg);
        ensure!(want[..MAC_LEN] == *mac, "frame integrity check failed");

        Ok(msg.to_vec())
    }
}

/* -------------------- initiator -------------------- */

enum ClientStep {
    /// Waiting for the server's digest-challenge.
    AwaitChallenge,
    /// Response sent; waiting for `rspauth`.
    AwaitRspauth,
    Complete,
}

/// Initiator half of the exchange, driven by the RPC connection.
///
/// `evaluate` consumes each inbound token and yields the next outbound one
/// (if any); `is_complete` flips once the server's `rspauth` verifies.
pub struct DigestMd5Client {
    username: String,
    secret: String,
    strongest_qop: Qop,
    cnonce: String,
    step: ClientStep,
    negotiated: Option<Qop>,
    a1: Option<[u8; 16]>,
    expected_rspauth: Option<String>,
}

impl DigestMd5Client {
    pub fn new(client_id: &str, secret: &str, strongest_qop: Qop) -> Self {
        Self {
            username: client_id.to_string(),
            secret: secret.to_string(),
            strongest_qop,
            cnonce: random_token(),
            step: ClientStep::AwaitChallenge,
            negotiated: None,
            a1: None,
            expected_rspauth: None,
        }
    }

    /// DIGEST-MD5 is server-first: the initial token is empty.
    pub fn initial_response(&self) -> Vec<u8> {
        Vec::new()
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.step, ClientStep::Complete)
    }

    pub fn negotiated_qop(&self) -> Option<Qop> {
        self.negotiated
    }

    /// The integrity layer, when one was negotiated. Only meaningful after
    /// completion.
    pub fn security_layer(&self) -> Option<SecurityLayer> {
        match (self.negotiated, self.a1.as_ref()) {
            (Some(Qop::AuthInt), Some(a1)) => Some(SecurityLayer::client(a1)),
            _ => None,
        }
    }

    pub fn evaluate(&mut self, token: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.step {
            ClientStep::AwaitChallenge => self.on_challenge(token),
            ClientStep::AwaitRspauth => self.on_rspauth(token),
            ClientStep::Complete => bail!("sasl exchange already complete"),
        }
    }

    fn on_challenge(&mut self, token: &[u8]) -> Result<Option<Vec<u8>>> {
        let directives = parse_directives(token)?;

        if let Some(alg) = directives.get("algorithm") {
            ensure!(alg == "md5-sess", "unsupported digest algorithm: {alg}");
        }
        let nonce = directives
            .get("nonce")
            .context("challenge is missing nonce")?
            .clone();
        let realm = directives
            .get("realm")
            .cloned()
            .unwrap_or_else(|| DEFAULT_REALM.to_string());
        let qop = match directives.get("qop") {
            Some(offered) => pick_qop(offered, self.strongest_qop)?,
            None => Qop::Auth,
        };

        let a1 = h_a1(&self.username, &realm, &self.secret, &nonce, &self.cnonce);
        let response = response_value(&a1, &nonce, &self.cnonce, qop, DIGEST_URI, true);
        self.expected_rspauth =
            Some(response_value(&a1, &nonce, &self.cnonce, qop, DIGEST_URI, false));
        self.a1 = Some(a1);
        self.negotiated = Some(qop);

        let reply = format!(
            "charset=utf-8,username=\"{}\",realm=\"{realm}\",nonce=\"{nonce}\",\
             nc={NONCE_COUNT},cnonce=\"{}\",digest-uri=\"{DIGEST_URI}\",\
             response={response},qop={qop}",
            self.username, self.cnonce
        );

        self.step = ClientStep::AwaitRspauth;
        Ok(Some(reply.into_bytes()))
    }

    fn on_rspauth(&mut self, token: &[u8]) -> Result<Option<Vec<u8>>> {
        let directives = parse_directives(token)?;
        let rspauth = directives
            .get("rspauth")
            .context("expected rspauth from peer")?;
        let expected = self
            .expected_rspauth
            .as_ref()
            .context("no pending response")?;
        ensure!(
            rspauth == expected,
            "peer failed mutual authentication (bad rspauth)"
        );

        self.step = ClientStep::Complete;
        Ok(None)
    }
}

/* -------------------- acceptor -------------------- */

enum ServerStep {
    /// Challenge issued; waiting for the digest-response.
    AwaitResponse,
    Complete,
}

/// Acceptor half of the exchange: challenge generation, response
/// verification against the shared secret, and `rspauth` emission. The
/// driver side of the protocol runs this against connecting clients.
pub struct DigestMd5Server {
    expected_user: String,
    secret: String,
    offered_qops: Vec<Qop>,
    nonce: String,
    step: ServerStep,
    negotiated: Option<Qop>,
    a1: Option<[u8; 16]>,
}

impl DigestMd5Server {
    pub fn new(expected_user: &str, secret: &str, offered_qops: &[Qop]) -> Self {
        Self {
            expected_user: expected_user.to_string(),
            secret: secret.to_string(),
            offered_qops: offered_qops.to_vec(),
            nonce: random_token(),
            step: ServerStep::AwaitResponse,
            negotiated: None,
            a1: None,
        }
    }

    /// The digest-challenge answering the client's empty initial token.
    pub fn initial_challenge(&self) -> Vec<u8> {
        let qops = self
            .offered_qops
            .iter()
            .map(Qop::to_string)
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "realm=\"{DEFAULT_REALM}\",nonce=\"{}\",qop=\"{qops}\",\
             charset=utf-8,algorithm=md5-sess",
            self.nonce
        )
        .into_bytes()
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.step, ServerStep::Complete)
    }

    pub fn negotiated_qop(&self) -> Option<Qop> {
        self.negotiated
    }

    pub fn security_layer(&self) -> Option<SecurityLayer> {
        match (self.negotiated, self.a1.as_ref()) {
            (Some(Qop::AuthInt), Some(a1)) => Some(SecurityLayer::server(a1)),
            _ => None,
        }
    }

    /// Verify the client's digest-response and produce the `rspauth` token.
    pub fn evaluate(&mut self, token: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.step {
            ServerStep::AwaitResponse => {},
            ServerStep::Complete => bail!("sasl exchange already complete"),
        }

        let directives = parse_directives(token)?;
        let username = directives
            .get("username")
            .context("response is missing username")?;
        ensure!(
            *username == self.expected_user,
            "unknown client id: {username}"
        );

        let nonce = directives.get("nonce").context("missing nonce")?;
        ensure!(*nonce == self.nonce, "nonce mismatch in response");
        let nc = directives.get("nc").context("missing nc")?;
        ensure!(nc == NONCE_COUNT, "unexpected nonce count: {nc}");
        let uri = directives
            .get("digest-uri")
            .context("missing digest-uri")?;
        ensure!(uri == DIGEST_URI, "digest-uri mismatch: {uri}");

        let qop = directives
            .get("qop")
            .map(String::as_str)
            .and_then(Qop::parse)
            .unwrap_or(Qop::Auth);
        ensure!(
            self.offered_qops.contains(&qop),
            "client picked a qop that was not offered: {qop}"
        );

        let cnonce = directives.get("cnonce").context("missing cnonce")?;
        let realm = directives
            .get("realm")
            .cloned()
            .unwrap_or_else(|| DEFAULT_REALM.to_string());

        let a1 = h_a1(&self.expected_user, &realm, &self.secret, nonce, cnonce);
        let expected = response_value(&a1, nonce, cnonce, qop, DIGEST_URI, true);
        let got = directives.get("response").context("missing response")?;
        ensure!(*got == expected, "authentication failed for {username}");

        let rspauth = response_value(&a1, nonce, cnonce, qop, DIGEST_URI, false);
        self.a1 = Some(a1);
        self.negotiated = Some(qop);
        self.step = ServerStep::Complete;

        Ok(Some(format!("rspauth={rspauth}").into_bytes()))
    }
}
