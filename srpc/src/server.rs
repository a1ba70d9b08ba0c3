// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The listening side of the transport. One task per accepted connection;
//! registered method handlers take over the connection for the duration
//! of a call.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{debug, info, o, Logger};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};

use crate::wire::{self, Reader, Writer};
use crate::{Codec, Error, CONNECT_BAD_REQUEST, CONNECT_NOT_FOUND, CONNECT_OK};

/// A registered RPC method. Handlers report application-level failures
/// in-band with [`ServerConn::reply_error`]; an `Err` return means the
/// connection itself is broken and is torn down.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), Error>;
}

pub struct Server {
    log: Logger,
    methods: BTreeMap<String, Arc<dyn MethodHandler>>,
}

impl Server {
    pub fn new(log: Logger) -> Server {
        Server { log: log.new(o!("component" => "srpc-server")), methods: BTreeMap::new() }
    }

    /// Register a handler under its full `Service.Method` name.
    pub fn register(&mut self, method: &str, handler: Arc<dyn MethodHandler>) {
        self.methods.insert(method.to_string(), handler);
    }

    /// Accept connections forever.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), Error> {
        info!(self.log, "listening"; "address" => %listener.local_addr()?);
        loop {
            let (stream, remote) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream).await {
                    debug!(server.log, "connection closed";
                        "remote" => %remote, "error" => %err);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), Error> {
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut writer = BufWriter::new(write);

        let request = wire::read_line(&mut reader).await?;
        let mut words = request.split_whitespace();
        let verb = words.next().unwrap_or("");
        let path = words.next().unwrap_or("");
        // Drain request headers up to the blank line.
        loop {
            if wire::read_line(&mut reader).await?.is_empty() {
                break;
            }
        }
        if verb != "CONNECT" {
            writer.write_all(CONNECT_BAD_REQUEST).await?;
            return writer.flush().await.map_err(Error::from);
        }
        // Options after '?' are accepted and ignored.
        let path = path.split('?').next().unwrap_or("");
        let Some(codec) = Codec::from_connect_path(path) else {
            writer.write_all(CONNECT_NOT_FOUND).await?;
            return writer.flush().await.map_err(Error::from);
        };
        writer.write_all(CONNECT_OK).await?;
        writer.flush().await?;

        loop {
            let Some(method) = wire::read_line_opt(&mut reader).await? else {
                return Ok(());
            };
            if method.is_empty() {
                // Ping.
                writer.write_all(b"\n").await?;
                writer.flush().await?;
                continue;
            }
            let Some(handler) = self.methods.get(&method) else {
                writer
                    .write_all(format!("unknown service/method: {}\n", method).as_bytes())
                    .await?;
                writer.flush().await?;
                continue;
            };
            writer.write_all(b"\n").await?;
            writer.flush().await?;
            let mut conn =
                ServerConn { codec, reader: &mut reader, writer: &mut writer };
            handler.handle(&mut conn).await?;
            writer.flush().await?;
        }
    }
}

/// A method handler's view of the connection.
pub struct ServerConn<'a> {
    codec: Codec,
    reader: &'a mut Reader,
    writer: &'a mut Writer,
}

impl ServerConn<'_> {
    pub async fn decode<T: DeserializeOwned>(&mut self) -> Result<T, Error> {
        let payload = wire::read_frame(self.reader).await?;
        self.codec.decode(&payload)
    }

    /// Encode one framed record without an accept line; used inside
    /// streaming exchanges.
    pub async fn encode<T: Serialize>(&mut self, value: &T) -> Result<(), Error> {
        let payload = self.codec.encode(value)?;
        wire::write_frame(self.writer, &payload).await
    }

    /// Accept the request and send the reply record.
    pub async fn reply_ok<T: Serialize>(&mut self, reply: &T) -> Result<(), Error> {
        self.writer.write_all(b"\n").await?;
        self.encode(reply).await?;
        self.flush().await
    }

    /// Reject the request with a one-line message. The message replaces
    /// the accept line, so no reply record follows.
    pub async fn reply_error(&mut self, message: &str) -> Result<(), Error> {
        let message = message.replace('\n', " ");
        self.writer.write_all(message.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush().await.map_err(Error::from)
    }

    /// A reader over the next `length` raw body bytes of the request.
    pub fn body_reader(&mut self, length: u64) -> impl AsyncRead + Unpin + '_ {
        (&mut *self.reader).take(length)
    }

    /// Stream raw body bytes into the response.
    pub async fn copy_raw_from<R>(&mut self, reader: &mut R) -> Result<u64, Error>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        tokio::io::copy(reader, &mut self.writer).await.map_err(Error::from)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use tokio::net::TcpListener;

    use super::{MethodHandler, Server, ServerConn};
    use crate::{Client, Codec, Error};

    #[derive(Serialize, Deserialize)]
    struct EchoRequest {
        message: String,
    }

    #[derive(Serialize, Deserialize)]
    struct EchoResponse {
        message: String,
    }

    struct Echo;

    #[async_trait]
    impl MethodHandler for Echo {
        async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), Error> {
            let request: EchoRequest = conn.decode().await?;
            if request.message == "poison" {
                return conn.reply_error("refusing poison").await;
            }
            conn.reply_ok(&EchoResponse { message: request.message }).await
        }
    }

    async fn start_server() -> String {
        let log = herd_common::logging::test_logger();
        let mut server = Server::new(log);
        server.register("Test.Echo", Arc::new(Echo));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(Arc::new(server).serve(listener));
        address
    }

    #[tokio::test]
    async fn echo_both_codecs() {
        let address = start_server().await;
        for codec in [Codec::Cbor, Codec::Json] {
            let mut client = Client::dial_with_codec(&address, codec).await.unwrap();
            let response: EchoResponse = client
                .request_reply("Test.Echo", &EchoRequest { message: "hi".to_string() })
                .await
                .unwrap();
            assert_eq!(response.message, "hi");
        }
    }

    #[tokio::test]
    async fn repeated_calls_on_one_connection() {
        let address = start_server().await;
        let mut client = Client::dial(&address).await.unwrap();
        client.ping().await.unwrap();
        for i in 0..3 {
            let response: EchoResponse = client
                .request_reply("Test.Echo", &EchoRequest { message: format!("m{i}") })
                .await
                .unwrap();
            assert_eq!(response.message, format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn remote_error_surfaces() {
        let address = start_server().await;
        let mut client = Client::dial(&address).await.unwrap();
        let result: Result<EchoResponse, Error> = client
            .request_reply("Test.Echo", &EchoRequest { message: "poison".to_string() })
            .await;
        match result {
            Err(Error::Remote(message)) => assert_eq!(message, "refusing poison"),
            other => panic!("expected remote error, got {:?}", other.map(|_| ())),
        }
        // The connection survives an application-level error.
        let response: EchoResponse = client
            .request_reply("Test.Echo", &EchoRequest { message: "after".to_string() })
            .await
            .unwrap();
        assert_eq!(response.message, "after");
    }

    #[tokio::test]
    async fn unknown_method() {
        let address = start_server().await;
        let mut client = Client::dial(&address).await.unwrap();
        match client.call("No.Such").await {
            Err(Error::Remote(message)) => {
                assert!(message.contains("unknown service/method"))
            }
            other => panic!("expected remote error, got {:?}", other.map(|_| ())),
        }
    }
}
