// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Connection-oriented RPC over TCP.
//!
//! A client dials a server and sends `CONNECT <path> HTTP/1.0` followed by
//! a blank line; the path selects the record codec (CBOR or JSON). The
//! server accepts with an HTTP 200 line, after which the socket carries
//! repeated calls: a method line (`Service.Method\n`), a one-line accept or
//! error from the server, then codec-encoded records framed with a 4-byte
//! big-endian length prefix. Raw byte bodies (object content) are not
//! framed; they follow their owning record as exactly the declared number
//! of bytes. Both sides may hold a call open for streaming.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

mod client;
mod server;
mod wire;

pub use client::{CallConn, Client, RecvHalf, SendHalf};
pub use server::{MethodHandler, Server, ServerConn};

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound on a single framed record. A full filesystem tree for a
/// large sub fits well under this.
pub(crate) const MAX_FRAME_LEN: usize = 256 << 20;

pub(crate) const CONNECT_OK: &[u8] = b"HTTP/1.0 200 Connected to SRPC\n\n";
pub(crate) const CONNECT_NOT_FOUND: &[u8] = b"HTTP/1.0 404 Not Found\n\n";
pub(crate) const CONNECT_BAD_REQUEST: &[u8] = b"HTTP/1.0 400 Bad Request\n\n";

pub const ACCESS_DENIED_MESSAGE: &str = "access to method denied";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on RPC connection")]
    Io(#[from] std::io::Error),

    #[error("timed out dialing")]
    ConnectTimeout,

    #[error("call timed out")]
    Timeout,

    #[error("no SRPC endpoint at {0}")]
    NoEndpoint(String),

    #[error("bad client certificate")]
    BadCertificate,

    #[error("missing client certificate")]
    MissingCertificate,

    #[error("access to method denied")]
    AccessDenied,

    /// An error reported in-band by the remote method.
    #[error("{0}")]
    Remote(String),

    #[error("failed to encode value: {0}")]
    Encode(String),

    #[error("failed to decode value: {0}")]
    Decode(String),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("unexpected HTTP response: {0}")]
    UnexpectedResponse(String),

    #[error("connection closed")]
    Closed,
}

/// The record encoding negotiated at connect time. One tagged variant per
/// supported encoding; both are self-describing so the same serde types
/// travel over either.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    Cbor,
    Json,
}

impl Codec {
    pub fn connect_path(self) -> &'static str {
        match self {
            Codec::Cbor => "/_SRPC_/unsecured/cbor",
            Codec::Json => "/_SRPC_/unsecured/json",
        }
    }

    pub(crate) fn from_connect_path(path: &str) -> Option<Codec> {
        match path {
            "/_SRPC_/unsecured/cbor" => Some(Codec::Cbor),
            "/_SRPC_/unsecured/json" => Some(Codec::Json),
            _ => None,
        }
    }

    pub(crate) fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, Error> {
        match self {
            Codec::Cbor => {
                let mut buf = Vec::new();
                ciborium::into_writer(value, &mut buf)
                    .map_err(|err| Error::Encode(err.to_string()))?;
                Ok(buf)
            }
            Codec::Json => {
                serde_json::to_vec(value).map_err(|err| Error::Encode(err.to_string()))
            }
        }
    }

    pub(crate) fn decode<T: DeserializeOwned>(self, payload: &[u8]) -> Result<T, Error> {
        match self {
            Codec::Cbor => {
                ciborium::from_reader(payload).map_err(|err| Error::Decode(err.to_string()))
            }
            Codec::Json => {
                serde_json::from_slice(payload).map_err(|err| Error::Decode(err.to_string()))
            }
        }
    }
}
