// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dialing side of the transport.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::wire::{self, Reader, Writer};
use crate::{
    Codec, Error, ACCESS_DENIED_MESSAGE, CONNECT_TIMEOUT, DEFAULT_CALL_TIMEOUT,
};

/// One connection to an SRPC server. Calls are serialized: a `Client`
/// carries at most one open call at a time, which the borrow on
/// [`CallConn`] enforces.
pub struct Client {
    reader: Reader,
    writer: Writer,
    codec: Codec,
    call_timeout: Option<Duration>,
    remote_address: String,
}

impl Client {
    /// Dial `address`, preferring the binary codec and falling back to
    /// JSON if the server does not export that endpoint.
    pub async fn dial(address: &str) -> Result<Client, Error> {
        match Client::dial_with_codec(address, Codec::Cbor).await {
            Err(Error::NoEndpoint(_)) => Client::dial_with_codec(address, Codec::Json).await,
            result => result,
        }
    }

    pub async fn dial_with_codec(address: &str, codec: Codec) -> Result<Client, Error> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| Error::ConnectTimeout)??;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let mut client = Client {
            reader: BufReader::new(read),
            writer: BufWriter::new(write),
            codec,
            call_timeout: Some(DEFAULT_CALL_TIMEOUT),
            remote_address: address.to_string(),
        };
        client
            .writer
            .write_all(format!("CONNECT {} HTTP/1.0\n\n", codec.connect_path()).as_bytes())
            .await?;
        client.writer.flush().await?;
        let status = wire::read_line(&mut client.reader).await?;
        let code = status.split_whitespace().nth(1).unwrap_or("");
        match code {
            "200" => {}
            "404" => return Err(Error::NoEndpoint(codec.connect_path().to_string())),
            "401" => return Err(Error::BadCertificate),
            "405" => return Err(Error::MissingCertificate),
            _ => return Err(Error::UnexpectedResponse(status)),
        }
        // Drain response headers up to the blank line.
        loop {
            if wire::read_line(&mut client.reader).await?.is_empty() {
                break;
            }
        }
        Ok(client)
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Deadline applied to each plain request/reply call. `None` disables
    /// it (streaming calls manage their own pacing).
    pub fn set_call_timeout(&mut self, call_timeout: Option<Duration>) {
        self.call_timeout = call_timeout;
    }

    /// An empty method line; proves the connection is live and dispatching.
    pub async fn ping(&mut self) -> Result<(), Error> {
        self.call("").await.map(|_| ())
    }

    /// Open a call. The returned connection borrows the client; dropping
    /// it returns the connection to the idle state (the server is then
    /// awaiting the next method line).
    pub async fn call(&mut self, method: &str) -> Result<CallConn<'_>, Error> {
        self.writer.write_all(method.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        let line = wire::read_line(&mut self.reader).await?;
        if !line.is_empty() {
            if line == ACCESS_DENIED_MESSAGE {
                return Err(Error::AccessDenied);
            }
            return Err(Error::Remote(line));
        }
        Ok(CallConn {
            codec: self.codec,
            reader: &mut self.reader,
            writer: &mut self.writer,
        })
    }

    /// The common single-request, single-reply exchange.
    pub async fn request_reply<Req, Resp>(
        &mut self,
        method: &str,
        request: &Req,
    ) -> Result<Resp, Error>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let call_timeout = self.call_timeout;
        let exchange = async {
            let mut conn = self.call(method).await?;
            conn.encode(request).await?;
            conn.flush().await?;
            conn.read_ok().await?;
            conn.decode().await
        };
        match call_timeout {
            Some(limit) => timeout(limit, exchange).await.map_err(|_| Error::Timeout)?,
            None => exchange.await,
        }
    }

    /// Open a call and split the connection into independently-owned send
    /// and receive halves, for protocols that overlap sending and
    /// acknowledgment (AddObjects). Consumes the client; the connection is
    /// dedicated to this call until both halves are dropped.
    pub async fn into_streaming_call(
        mut self,
        method: &str,
    ) -> Result<(SendHalf, RecvHalf), Error> {
        self.call(method).await?;
        let Client { reader, writer, codec, .. } = self;
        Ok((SendHalf { codec, writer }, RecvHalf { codec, reader }))
    }
}

/// An open call on a [`Client`].
pub struct CallConn<'a> {
    codec: Codec,
    reader: &'a mut Reader,
    writer: &'a mut Writer,
}

impl CallConn<'_> {
    pub async fn encode<T: Serialize>(&mut self, value: &T) -> Result<(), Error> {
        let payload = self.codec.encode(value)?;
        wire::write_frame(self.writer, &payload).await
    }

    pub async fn decode<T: DeserializeOwned>(&mut self) -> Result<T, Error> {
        let payload = wire::read_frame(self.reader).await?;
        self.codec.decode(&payload)
    }

    /// Read the server's accept-or-error line for this request.
    pub async fn read_ok(&mut self) -> Result<(), Error> {
        let line = wire::read_line(self.reader).await?;
        if line.is_empty() {
            Ok(())
        } else if line == ACCESS_DENIED_MESSAGE {
            Err(Error::AccessDenied)
        } else {
            Err(Error::Remote(line))
        }
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush().await.map_err(Error::from)
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.writer.write_all(bytes).await.map_err(Error::from)
    }

    /// A reader over the next `length` raw body bytes.
    pub fn body_reader(&mut self, length: u64) -> impl tokio::io::AsyncRead + Unpin + '_ {
        (&mut *self.reader).take(length)
    }
}

/// Owned sending half of a streaming call.
pub struct SendHalf {
    codec: Codec,
    writer: Writer,
}

impl SendHalf {
    pub async fn encode<T: Serialize>(&mut self, value: &T) -> Result<(), Error> {
        let payload = self.codec.encode(value)?;
        wire::write_frame(&mut self.writer, &payload).await
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.writer.write_all(bytes).await.map_err(Error::from)
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush().await.map_err(Error::from)
    }
}

/// Owned receiving half of a streaming call.
pub struct RecvHalf {
    codec: Codec,
    reader: Reader,
}

impl RecvHalf {
    pub async fn decode<T: DeserializeOwned>(&mut self) -> Result<T, Error> {
        let payload = wire::read_frame(&mut self.reader).await?;
        self.codec.decode(&payload)
    }
}
