// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Result, anyhow, ensure};
use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::{
    client::sasl::SecurityLayer,
    models::common::{Message, decode_envelope, encode_envelope},
};

pub async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("{label} cancelled")),
        res = timeout(io_timeout, fut) => {
            match res {
                Ok(v) => v,
                Err(_) => Err(anyhow!("{label} timeout")),
            }
        }
    }
}

/// Write one length-prefixed frame. When a security layer is installed the
/// body is sealed first and the prefix covers the sealed bytes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    body: &[u8],
    seal: Option<&SecurityLayer>,
    max_frame: usize,
) -> Result<()> {
    let sealed;
    let body = match seal {
        Some(layer) => {
            sealed = layer.seal(body);
            sealed.as_slice()
        },
        None => body,
    };
    ensure!(
        body.len() <= max_frame,
        "outbound frame of {} bytes exceeds limit {max_frame}",
        body.len()
    );

    w.write_all(&(body.len() as u32).to_be_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, enforcing the size cap before the body is
/// pulled in, and unseal it when a security layer is installed.
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    seal: Option<&SecurityLayer>,
    max_frame: usize,
) -> Result<BytesMut> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    ensure!(
        len <= max_frame,
        "inbound frame of {len} bytes exceeds limit {max_frame}"
    );

    let mut buf = BytesMut::zeroed(len);
    r.read_exact(&mut buf).await?;

    match seal {
        Some(layer) => Ok(BytesMut::from(layer.unseal(&buf)?.as_slice())),
        None => Ok(buf),
    }
}

/// Frame a message: envelope (class name + body) inside one wire frame.
pub async fn write_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg: &Message,
    seal: Option<&SecurityLayer>,
    max_frame: usize,
) -> Result<()> {
    let body = encode_envelope(msg)?;
    write_frame(w, &body, seal, max_frame).await
}

/// Read and decode one framed message.
pub async fn read_message<R: AsyncRead + Unpin>(
    r: &mut R,
    seal: Option<&SecurityLayer>,
    max_frame: usize,
) -> Result<Message> {
    let body = read_frame(r, seal, max_frame).await?;
    decode_envelope(&body)
}
