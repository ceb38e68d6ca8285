//! Handshake and redirection payload schemas and CBOR encoding.

use std::convert::Infallible;

use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

/// A cluster node address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Master redirection target carried by `NotHandled`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEndpoints {
    pub tcp: Endpoint,
    pub secure_tcp: Option<Endpoint>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotHandledReason {
    NotReady,
    TooBusy,
    NotMaster,
    Other(u32),
}

impl NotHandledReason {
    fn from_u32(raw: u32) -> Self {
        match raw {
            0 => NotHandledReason::NotReady,
            1 => NotHandledReason::TooBusy,
            2 => NotHandledReason::NotMaster,
            other => NotHandledReason::Other(other),
        }
    }

    fn as_u32(self) -> u32 {
        match self {
            NotHandledReason::NotReady => 0,
            NotHandledReason::TooBusy => 1,
            NotHandledReason::NotMaster => 2,
            NotHandledReason::Other(other) => other,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotHandledPayload {
    pub reason: NotHandledReason,
    pub master: Option<NodeEndpoints>,
}

#[derive(Debug, Error)]
pub enum PayloadEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum PayloadDecodeError {
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
    #[error("unexpected payload shape: {reason}")]
    Shape { reason: &'static str },
}

pub fn encode_identify_client(
    version: u32,
    connection_name: &str,
) -> Result<Vec<u8>, PayloadEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.array(2)?.u32(version)?.str(connection_name)?;
    Ok(buf)
}

pub fn decode_identify_client(payload: &[u8]) -> Result<(u32, String), PayloadDecodeError> {
    let mut dec = Decoder::new(payload);
    expect_array(&mut dec, 2, "identify_client")?;
    let version = dec.u32()?;
    let name = dec.str()?.to_string();
    Ok((version, name))
}

pub fn encode_not_handled(payload: &NotHandledPayload) -> Result<Vec<u8>, PayloadEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.array(2)?.u32(payload.reason.as_u32())?;
    match &payload.master {
        None => {
            enc.null()?;
        }
        Some(node) => {
            enc.array(3)?.str(&node.tcp.host)?.u16(node.tcp.port)?;
            match &node.secure_tcp {
                None => {
                    enc.null()?;
                }
                Some(secure) => {
                    enc.array(2)?.str(&secure.host)?.u16(secure.port)?;
                }
            }
        }
    }
    Ok(buf)
}

pub fn decode_not_handled(payload: &[u8]) -> Result<NotHandledPayload, PayloadDecodeError> {
    let mut dec = Decoder::new(payload);
    expect_array(&mut dec, 2, "not_handled")?;
    let reason = NotHandledReason::from_u32(dec.u32()?);

    let master = if dec.datatype()? == Type::Null {
        dec.null()?;
        None
    } else {
        expect_array(&mut dec, 3, "not_handled master")?;
        let tcp = Endpoint::new(dec.str()?, dec.u16()?);
        let secure_tcp = if dec.datatype()? == Type::Null {
            dec.null()?;
            None
        } else {
            expect_array(&mut dec, 2, "not_handled secure endpoint")?;
            Some(Endpoint::new(dec.str()?, dec.u16()?))
        };
        Some(NodeEndpoints { tcp, secure_tcp })
    };

    Ok(NotHandledPayload { reason, master })
}

/// Lossily decodes a `BadRequest` reason text.
pub fn decode_reason_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

fn expect_array(
    dec: &mut Decoder<'_>,
    len: u64,
    reason: &'static str,
) -> Result<(), PayloadDecodeError> {
    match dec.array()? {
        Some(got) if got == len => Ok(()),
        _ => Err(PayloadDecodeError::Shape { reason }),
    }
}
