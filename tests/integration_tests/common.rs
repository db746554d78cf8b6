// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! An in-process driver speaking the real wire protocol, used to exercise
//! the session manager end to end: SASL acceptance, framed request/reply
//! routing, scripted statement results and failure injection.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail};
use rsc_client_rs::{
    cfg::{
        cli::resolve_config_path,
        config::Config,
        enums::Qop,
    },
    client::{
        common::{read_message, write_message},
        sasl::{DigestMd5Server, SecurityLayer},
    },
    models::{
        common::Message,
        header::{ErrorReply, MessageHeader, NullMessage, RpcKind},
        repl::{BypassHandle, BypassJobState, ReplResult, ReplStateReply},
        sasl::SaslMessage,
    },
    session::{SessionState, interactive::InteractiveSession},
};
use tokio::{
    net::{TcpListener, TcpStream},
    time::{Instant, sleep},
};

pub const MAX_FRAME: usize = 1 << 20;

/// Failure-injection scripts for the fake driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverScript {
    /// Answer everything normally.
    Normal,
    /// Report a wedged interpreter from the state probe.
    Wedged,
    /// Acknowledge a statement submission, then drop the connection on the
    /// first result poll.
    DieOnStatement,
    /// Accept the TCP connection but never answer the SASL hello.
    SilentSasl,
}

/// Counters observable from the tests.
#[derive(Debug, Default)]
pub struct DriverCounters {
    pub repl_codes: AtomicUsize,
    pub cancels: AtomicUsize,
    pub resources: AtomicUsize,
}

/// Bind an ephemeral port and serve exactly one connection with the given
/// script. Returns the listen address and the shared counters.
pub async fn spawn_driver(script: DriverScript) -> Result<(String, Arc<DriverCounters>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let counters = Arc::new(DriverCounters::default());

    let served = Arc::clone(&counters);
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        if script == DriverScript::SilentSasl {
            // Hold the socket open without ever speaking.
            sleep(Duration::from_secs(120)).await;
            drop(stream);
            return;
        }
        if let Err(e) = serve(stream, script, served).await {
            // Client-side disconnects land here; uninteresting for tests.
            tracing::debug!("fake driver exited: {e}");
        }
    });

    Ok((addr, counters))
}

/// Load the fixture config and point it at a running fake driver.
pub fn test_config(addr: &str) -> Result<Config> {
    let mut cfg = resolve_config_path("tests/config.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load tests/config.yaml")?;
    cfg.rpc.driver_address = addr.to_string();
    Ok(cfg)
}

/// Poll the advisory state until it matches or the deadline passes.
pub async fn await_state(
    session: &InteractiveSession,
    want: SessionState,
    within: Duration,
) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if session.state() == want {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

/* -------------------- driver internals -------------------- */

async fn serve(
    mut stream: TcpStream,
    script: DriverScript,
    counters: Arc<DriverCounters>,
) -> Result<()> {
    let seal = accept_sasl(&mut stream).await?;
    let seal = seal.as_ref();

    let mut codes: HashMap<u32, String> = HashMap::new();
    let mut polls_served: HashMap<u32, u32> = HashMap::new();
    let mut jobs: HashMap<i64, Vec<u8>> = HashMap::new();
    let mut next_handle: i64 = 100;
    let mut die_armed = false;

    loop {
        let header = read_message(&mut stream, seal, MAX_FRAME).await?;
        let Message::MessageHeader(header) = header else {
            bail!("expected MessageHeader, got {header:?}");
        };
        let payload = read_message(&mut stream, seal, MAX_FRAME).await?;

        let outcome: Result<Message, String> = match payload {
            Message::Ping(_) => Ok(Message::from(NullMessage)),
            Message::ReplCode(rc) => {
                counters.repl_codes.fetch_add(1, Ordering::SeqCst);
                if script == DriverScript::DieOnStatement {
                    die_armed = true;
                }
                codes.insert(rc.id, rc.code);
                Ok(Message::from(NullMessage))
            },
            Message::ReplJobResult(q) => {
                if die_armed {
                    // Simulates the driver dying mid-statement.
                    return Ok(());
                }
                let served = polls_served.entry(q.id).or_insert(0);
                if *served == 0 {
                    *served = 1;
                    Ok(Message::from(ReplResult { result: None }))
                } else {
                    let code = codes.get(&q.id).cloned().unwrap_or_default();
                    Ok(Message::from(ReplResult {
                        result: Some(result_doc(&code)),
                    }))
                }
            },
            Message::ReplState(_) => {
                let state = if script == DriverScript::Wedged {
                    "error"
                } else {
                    "idle"
                };
                Ok(Message::from(ReplStateReply {
                    state: state.to_string(),
                }))
            },
            Message::BypassJob(job) => {
                let handle = next_handle;
                next_handle += 1;
                jobs.insert(handle, job.job);
                Ok(Message::from(BypassHandle { id: handle }))
            },
            Message::BypassJobStatus(q) => match jobs.get(&q.handle) {
                Some(payload) => Ok(Message::from(BypassJobState {
                    state: "SUCCEEDED".to_string(),
                    result: Some(payload.clone()),
                    error: None,
                })),
                None => Err(format!("unknown job handle {}", q.handle)),
            },
            Message::CancelJob(c) => {
                counters.cancels.fetch_add(1, Ordering::SeqCst);
                jobs.remove(&c.handle);
                Ok(Message::from(NullMessage))
            },
            Message::AddFile(_) | Message::AddJar(_) => {
                counters.resources.fetch_add(1, Ordering::SeqCst);
                Ok(Message::from(NullMessage))
            },
            other => Err(format!("driver cannot handle {other:?}")),
        };

        match outcome {
            Ok(reply) => {
                send_pair(&mut stream, seal, header.id, RpcKind::Reply, &reply).await?;
            },
            Err(message) => {
                let err = Message::from(ErrorReply { message });
                send_pair(&mut stream, seal, header.id, RpcKind::Error, &err).await?;
            },
        }
    }
}

async fn accept_sasl(stream: &mut TcpStream) -> Result<Option<SecurityLayer>> {
    let mut sasl =
        DigestMd5Server::new("test-client", "test-secret", &[Qop::Auth, Qop::AuthInt]);

    let hello = read_message(stream, None, MAX_FRAME).await?;
    let Message::SaslMessage(hello) = hello else {
        bail!("expected SaslMessage hello, got {hello:?}");
    };
    let client_id = hello.client_id.context("hello carried no client id")?;
    if client_id != "test-client" {
        bail!("unexpected client id {client_id}");
    }

    let challenge = Message::from(SaslMessage::token(sasl.initial_challenge()));
    write_message(stream, &challenge, None, MAX_FRAME).await?;

    let response = read_message(stream, None, MAX_FRAME).await?;
    let Message::SaslMessage(response) = response else {
        bail!("expected SaslMessage response, got {response:?}");
    };
    let rspauth = sasl
        .evaluate(&response.payload)?
        .context("server produced no rspauth")?;
    write_message(
        stream,
        &Message::from(SaslMessage::token(rspauth)),
        None,
        MAX_FRAME,
    )
    .await?;

    Ok(sasl.security_layer())
}

async fn send_pair(
    stream: &mut TcpStream,
    seal: Option<&SecurityLayer>,
    id: i64,
    kind: RpcKind,
    payload: &Message,
) -> Result<()> {
    let header = Message::from(MessageHeader { id, kind });
    write_message(stream, &header, seal, MAX_FRAME).await?;
    write_message(stream, payload, seal, MAX_FRAME).await
}

fn result_doc(code: &str) -> String {
    if code.contains("undefined_name") {
        "{\"status\":\"error\",\"ename\":\"NameError\",\
         \"evalue\":\"name 'undefined_name' is not defined\"}"
            .to_string()
    } else if code.trim() == "1 + 2" {
        "{\"status\":\"ok\",\"output\":\"3\"}".to_string()
    } else {
        "{\"status\":\"ok\",\"output\":\"\"}".to_string()
    }
}
