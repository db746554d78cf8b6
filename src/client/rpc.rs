// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI64, Ordering},
};

use anyhow::{Context, Result, bail, ensure};
use once_cell::sync::OnceCell;
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::{ClientConfig, Config, MECHANISM_DIGEST_MD5, RpcConfig},
    client::{
        RpcError,
        common::{io_with_timeout, read_message, write_message},
        dispatcher::Dispatcher,
        sasl::{DigestMd5Client, SecurityLayer},
    },
    models::{
        common::{Message, WireBody, WireMessage},
        header::{MessageHeader, RpcKind},
        sasl::SaslMessage,
    },
};

/// One authenticated, ordered message channel to a remote driver.
///
/// Created by [`Rpc::connect`], which runs the TCP connect (with its own
/// timeout), the SASL handshake (with a separate timeout), installs the
/// dispatcher and spawns the read loop. After that, [`Rpc::call`] multiplexes
/// concurrent requests over the channel; the writer lock guarantees that a
/// header frame and its payload are never interleaved with another call's.
pub struct Rpc {
    /// Read half; owned by the read loop after the handshake.
    reader: Mutex<OwnedReadHalf>,
    /// Write half; the lock serializes concurrent calls.
    writer: Mutex<OwnedWriteHalf>,
    cfg: RpcConfig,
    /// Set exactly once, after the handshake succeeds.
    dispatcher: OnceCell<Arc<Dispatcher>>,
    /// Integrity layer, present when the handshake negotiated `auth-int`.
    seal: OnceCell<SecurityLayer>,
    call_id: AtomicI64,
    closed: AtomicBool,
    /// Fires once on close; the session's channel monitor waits on it.
    cancel: CancellationToken,
}

impl Rpc {
    /// Connect, authenticate and return a ready channel.
    pub async fn connect(cfg: &Config) -> Result<Arc<Self>> {
        ensure!(
            cfg.rpc
                .sasl_mechanisms
                .iter()
                .any(|m| m == MECHANISM_DIGEST_MD5),
            "no supported sasl mechanism configured"
        );

        let stream = timeout(
            cfg.rpc.connect_timeout,
            TcpStream::connect(&cfg.rpc.driver_address),
        )
        .await
        .with_context(|| {
            format!("connect to {} timed out", cfg.rpc.driver_address)
        })??;
        stream.set_nodelay(true)?;

        let (r, w) = stream.into_split();
        let rpc = Arc::new(Self {
            reader: Mutex::new(r),
            writer: Mutex::new(w),
            cfg: cfg.rpc.clone(),
            dispatcher: OnceCell::new(),
            seal: OnceCell::new(),
            call_id: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        match timeout(cfg.rpc.handshake_timeout, rpc.handshake(&cfg.client)).await {
            Err(_) => {
                rpc.close();
                return Err(RpcError::HandshakeTimeout(cfg.rpc.handshake_timeout).into());
            },
            Ok(Err(e)) => {
                rpc.close();
                return Err(e.context("sasl handshake failed"));
            },
            Ok(Ok(())) => {},
        }

        rpc.set_dispatcher(Arc::new(Dispatcher::new()))?;

        let rl = Arc::clone(&rpc);
        tokio::spawn(async move {
            if let Err(e) = Arc::clone(&rl).read_loop().await {
                debug!("read loop exited: {e}");
            }
            rl.close();
            // FIN the socket promptly; errors here are uninteresting.
            let mut w = rl.writer.lock().await;
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut *w).await;
        });

        Ok(rpc)
    }

    /// Install the dispatcher. One-shot: a second call is refused.
    pub fn set_dispatcher(&self, dispatcher: Arc<Dispatcher>) -> Result<()> {
        self.dispatcher
            .set(dispatcher)
            .map_err(|_| anyhow::anyhow!("dispatcher already installed"))
    }

    pub fn dispatcher(&self) -> Result<&Arc<Dispatcher>> {
        self.dispatcher
            .get()
            .context("dispatcher not installed (handshake incomplete)")
    }

    /// A token that fires when the channel closes, for inactivity monitors.
    pub fn close_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn seal(&self) -> Option<&SecurityLayer> {
        self.seal.get()
    }

    /* -------------------- handshake -------------------- */

    async fn handshake(&self, creds: &ClientConfig) -> Result<()> {
        let mut sasl =
            DigestMd5Client::new(&creds.client_id, &creds.secret, self.cfg.sasl_qop);

        {
            let hello =
                Message::from(SaslMessage::hello(&creds.client_id, sasl.initial_response()));
            let mut w = self.writer.lock().await;
            write_message(&mut *w, &hello, None, self.cfg.max_message_size).await?;
        }

        loop {
            let inbound = {
                let mut r = self.reader.lock().await;
                read_message(&mut *r, None, self.cfg.max_message_size).await?
            };
            let Message::SaslMessage(token) = inbound else {
                bail!(RpcError::Sasl(format!(
                    "unexpected {} during handshake",
                    inbound.tag()
                )));
            };

            let reply = sasl
                .evaluate(&token.payload)
                .map_err(|e| RpcError::Sasl(e.to_string()))?;
            if let Some(payload) = reply {
                let msg = Message::from(SaslMessage::token(payload));
                let mut w = self.writer.lock().await;
                write_message(&mut *w, &msg, None, self.cfg.max_message_size).await?;
            }
            if sasl.is_complete() {
                break;
            }
        }

        if let Some(layer) = sasl.security_layer() {
            info!("sasl negotiated {:?}: sealing frames", sasl.negotiated_qop());
            self.seal
                .set(layer)
                .map_err(|_| anyhow::anyhow!("security layer already installed"))?;
        }

        Ok(())
    }

    /* -------------------- call protocol -------------------- */

    /// Issue a call and decode the reply into the expected class.
    pub async fn call<R: WireBody>(&self, msg: impl Into<Message>) -> Result<R> {
        let rx = self.send_call(msg.into(), R::NAME).await?;
        match rx.await {
            Ok(Ok(reply)) => {
                let got = reply.tag();
                R::from_message(reply).ok_or_else(|| {
                    RpcError::UnexpectedReply {
                        expected: R::NAME,
                        got,
                    }
                    .into()
                })
            },
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RpcError::Closed.into()),
        }
    }

    /// Register a completion and write `header + payload` under the writer
    /// lock. Returns the completion; dropping it makes the call
    /// fire-and-forget. On a write failure the registration is discarded and
    /// the channel closed.
    pub async fn send_call(
        &self,
        msg: Message,
        expect: &'static str,
    ) -> Result<oneshot::Receiver<Result<Message>>> {
        if self.is_closed() {
            return Err(RpcError::Closed.into());
        }

        let id = self.call_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let dispatcher = self.dispatcher()?;
        dispatcher.register_rpc(id, tx, expect);

        let header = Message::from(MessageHeader {
            id,
            kind: RpcKind::Call,
        });
        let write = async {
            let mut w = self.writer.lock().await;
            write_message(&mut *w, &header, self.seal(), self.cfg.max_message_size)
                .await?;
            write_message(&mut *w, &msg, self.seal(), self.cfg.max_message_size).await
        };

        match io_with_timeout("rpc send", write, self.cfg.connect_timeout, &self.cancel)
            .await
        {
            Ok(()) => Ok(rx),
            Err(e) => {
                dispatcher.discard_rpc(id);
                self.close();
                Err(e.context(format!("failed to send call id={id}")))
            },
        }
    }

    /* -------------------- receive side -------------------- */

    async fn read_loop(self: Arc<Self>) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                bail!("cancelled");
            }

            let (header, payload) = {
                let mut r = self.reader.lock().await;
                let header = tokio::select! {
                    _ = self.cancel.cancelled() => bail!("cancelled"),
                    m = read_message(&mut *r, self.seal(), self.cfg.max_message_size) => m?,
                };
                // The payload frame follows its header immediately.
                let payload =
                    read_message(&mut *r, self.seal(), self.cfg.max_message_size)
                        .await?;
                (header, payload)
            };

            let Message::MessageHeader(header) = header else {
                bail!("expected MessageHeader, got {}", header.tag());
            };

            let dispatcher = self.dispatcher()?;
            match header.kind {
                RpcKind::Reply => dispatcher.complete(header.id, Ok(payload)),
                RpcKind::Error => {
                    let message = match payload {
                        Message::ErrorReply(e) => e.message,
                        other => format!("malformed remote error: {other:?}"),
                    };
                    dispatcher.complete(header.id, Err(RpcError::Remote(message).into()));
                },
                RpcKind::Call => dispatcher.dispatch_inbound(payload),
            }
        }
    }

    /* -------------------- lifecycle -------------------- */

    /// Close the channel. Idempotent: the first call wins, fails every
    /// outstanding completion and wakes the inactivity monitors.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        debug!("closing rpc channel");
        self.cancel.cancel();
        if let Some(d) = self.dispatcher.get() {
            d.discard_all("rpc channel closed");
        }
    }

    /// Clean close: half-close the write side first so the peer sees an
    /// orderly FIN, then close. Interruptions are absorbed.
    pub async fn shutdown(&self) {
        if !self.is_closed() {
            let mut w = self.writer.lock().await;
            if let Err(e) = tokio::io::AsyncWriteExt::shutdown(&mut *w).await {
                warn!("write-side shutdown failed: {e}");
            }
        }
        self.close();
    }
}
