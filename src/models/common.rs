// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use anyhow::{Result, anyhow, bail, ensure};
use bytes::{BufMut, BytesMut};
use enum_dispatch::enum_dispatch;
use once_cell::sync::Lazy;
use serde::{Serialize, de::DeserializeOwned};

use crate::models::{
    header::{ErrorReply, MessageHeader, NullMessage},
    repl::{
        AddFile, AddJar, BypassHandle, BypassJob, BypassJobState, BypassJobStatus,
        CancelJob, Ping, ReplCode, ReplJobResult, ReplResult, ReplState, ReplStateReply,
    },
    sasl::SaslMessage,
};

/// A registered wire class: a concrete message type tied to the class-name
/// tag carried on the wire. The tag is what the receive side uses to pick a
/// decoder, so it must be unique across the protocol.
pub trait WireBody: Serialize + DeserializeOwned + Into<Message> {
    const NAME: &'static str;

    /// Extract this class back out of the sum; `None` on any other variant.
    fn from_message(msg: Message) -> Option<Self>
    where Self: Sized;
}

/// Encode side of a wire class. Implemented for every registered type and,
/// through `enum_dispatch`, for the [`Message`] sum itself.
#[enum_dispatch]
pub trait WireMessage {
    /// Class-name tag written in front of the encoded body.
    fn tag(&self) -> &'static str;

    /// Serialize the message body (without the name tag).
    fn encode_body(&self) -> Result<Vec<u8>>;
}

/// The closed sum of every message that can appear on the channel.
///
/// `enum_dispatch` derives `From<T> for Message` per variant; the typed
/// call path goes the other way through [`WireBody::from_message`].
#[enum_dispatch(WireMessage)]
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    MessageHeader,
    NullMessage,
    SaslMessage,
    ErrorReply,
    Ping,
    ReplCode,
    ReplJobResult,
    ReplResult,
    ReplState,
    ReplStateReply,
    BypassJob,
    BypassHandle,
    BypassJobStatus,
    BypassJobState,
    CancelJob,
    AddFile,
    AddJar,
}

macro_rules! wire_class {
    ($ty:ident, $name:literal) => {
        impl WireBody for $ty {
            const NAME: &'static str = $name;

            fn from_message(msg: Message) -> Option<Self> {
                match msg {
                    Message::$ty(inner) => Some(inner),
                    _ => None,
                }
            }
        }

        impl WireMessage for $ty {
            fn tag(&self) -> &'static str {
                <$ty as WireBody>::NAME
            }

            fn encode_body(&self) -> Result<Vec<u8>> {
                Ok(bincode::serialize(self)?)
            }
        }
    };
}

wire_class!(MessageHeader, "MessageHeader");
wire_class!(NullMessage, "NullMessage");
wire_class!(SaslMessage, "SaslMessage");
wire_class!(ErrorReply, "ErrorReply");
wire_class!(Ping, "Ping");
wire_class!(ReplCode, "ReplCode");
wire_class!(ReplJobResult, "ReplJobResult");
wire_class!(ReplResult, "ReplResult");
wire_class!(ReplState, "ReplState");
wire_class!(ReplStateReply, "ReplStateReply");
wire_class!(BypassJob, "BypassJob");
wire_class!(BypassHandle, "BypassHandle");
wire_class!(BypassJobStatus, "BypassJobStatus");
wire_class!(BypassJobState, "BypassJobState");
wire_class!(CancelJob, "CancelJob");
wire_class!(AddFile, "AddFile");
wire_class!(AddJar, "AddJar");

type DecodeFn = fn(&[u8]) -> Result<Message>;

fn decode_body<T: WireBody>(bytes: &[u8]) -> Result<Message> {
    Ok(bincode::deserialize::<T>(bytes)?.into())
}

/// Class-name → decoder map. Routing inbound frames is a single lookup.
static REGISTRY: Lazy<HashMap<&'static str, DecodeFn>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, DecodeFn> = HashMap::new();
    m.insert(MessageHeader::NAME, decode_body::<MessageHeader>);
    m.insert(NullMessage::NAME, decode_body::<NullMessage>);
    m.insert(SaslMessage::NAME, decode_body::<SaslMessage>);
    m.insert(ErrorReply::NAME, decode_body::<ErrorReply>);
    m.insert(Ping::NAME, decode_body::<Ping>);
    m.insert(ReplCode::NAME, decode_body::<ReplCode>);
    m.insert(ReplJobResult::NAME, decode_body::<ReplJobResult>);
    m.insert(ReplResult::NAME, decode_body::<ReplResult>);
    m.insert(ReplState::NAME, decode_body::<ReplState>);
    m.insert(ReplStateReply::NAME, decode_body::<ReplStateReply>);
    m.insert(BypassJob::NAME, decode_body::<BypassJob>);
    m.insert(BypassHandle::NAME, decode_body::<BypassHandle>);
    m.insert(BypassJobStatus::NAME, decode_body::<BypassJobStatus>);
    m.insert(BypassJobState::NAME, decode_body::<BypassJobState>);
    m.insert(CancelJob::NAME, decode_body::<CancelJob>);
    m.insert(AddFile::NAME, decode_body::<AddFile>);
    m.insert(AddJar::NAME, decode_body::<AddJar>);
    m
});

/// Build the framed body for a message: `u16` big-endian name length, the
/// UTF-8 class name, then the serialized body. The length prefix of the
/// outer frame is added by the channel I/O layer.
pub fn encode_envelope(msg: &Message) -> Result<BytesMut> {
    let name = msg.tag();
    let body = msg.encode_body()?;
    ensure!(name.len() <= u16::MAX as usize, "wire class name too long");

    let mut out = BytesMut::with_capacity(2 + name.len() + body.len());
    out.put_u16(name.len() as u16);
    out.put_slice(name.as_bytes());
    out.put_slice(&body);
    Ok(out)
}

/// Decode one framed body back into a [`Message`], routing by class name.
pub fn decode_envelope(buf: &[u8]) -> Result<Message> {
    if buf.len() < 2 {
        bail!("truncated frame: {} bytes", buf.len());
    }
    let name_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    ensure!(
        buf.len() >= 2 + name_len,
        "truncated class name: want {name_len} bytes, have {}",
        buf.len() - 2
    );

    let name = std::str::from_utf8(&buf[2..2 + name_len])?;
    let decode = REGISTRY
        .get(name)
        .ok_or_else(|| anyhow!("unregistered wire class: {name}"))?;
    decode(&buf[2 + name_len..])
}
