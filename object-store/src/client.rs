// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client side of the object server protocol.

use herd_common::ObjectHash;
use herd_protocol::object_server::{
    AddObjectRequest, AddObjectResponse, CheckObjectsRequest, CheckObjectsResponse,
    GetObjectsRequest, GetObjectsResponse, ADD_OBJECTS, CHECK_OBJECTS, GET_OBJECTS,
};
use srpc::CallConn;
use tokio::io::AsyncRead;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Rpc(#[from] srpc::Error),

    /// An error reported by the object server for one operation.
    #[error("object server: {0}")]
    Server(String),

    #[error("object body truncated: expected {expected} bytes, got {got}")]
    ShortBody { expected: u64, got: u64 },
}

/// A connection to an object server.
pub struct ObjectClient {
    client: srpc::Client,
}

impl ObjectClient {
    pub async fn dial(address: &str) -> Result<ObjectClient, srpc::Error> {
        Ok(ObjectClient { client: srpc::Client::dial(address).await? })
    }

    pub fn from_client(client: srpc::Client) -> ObjectClient {
        ObjectClient { client }
    }

    pub fn into_client(self) -> srpc::Client {
        self.client
    }

    /// Sizes of the named objects, zero for absent ones.
    pub async fn check_objects(
        &mut self,
        hashes: &[ObjectHash],
    ) -> Result<Vec<u64>, ClientError> {
        let response: CheckObjectsResponse = self
            .client
            .request_reply(CHECK_OBJECTS, &CheckObjectsRequest { hashes: hashes.to_vec() })
            .await?;
        Ok(response.object_sizes)
    }

    /// Add one object in a single-shot stream. Returns the stored hash
    /// and whether this call added it.
    pub async fn add_object(
        &mut self,
        content: &[u8],
    ) -> Result<(ObjectHash, bool), ClientError> {
        let hash = ObjectHash::of(content);
        let mut conn = self.client.call(ADD_OBJECTS).await?;
        conn.encode(&AddObjectRequest {
            length: content.len() as u64,
            expected_hash: Some(hash),
        })
        .await?;
        conn.write_raw(content).await?;
        conn.encode(&AddObjectRequest { length: 0, expected_hash: None }).await?;
        conn.flush().await?;
        let response: AddObjectResponse = conn.decode().await?;
        if let Some(message) = response.error {
            return Err(ClientError::Server(message));
        }
        Ok((response.hash, response.added))
    }

    /// Open a streaming read of the named objects. Bodies arrive in
    /// request order; a missing object fails the whole call before any
    /// body bytes.
    pub async fn get_objects(
        &mut self,
        exclusive: bool,
        hashes: &[ObjectHash],
    ) -> Result<ObjectsReader<'_>, ClientError> {
        let mut conn = self.client.call(GET_OBJECTS).await?;
        conn.encode(&GetObjectsRequest { exclusive, hashes: hashes.to_vec() }).await?;
        conn.flush().await?;
        match conn.read_ok().await {
            Ok(()) => {}
            Err(srpc::Error::Remote(message)) => {
                return Err(ClientError::Server(message))
            }
            Err(err) => return Err(err.into()),
        }
        let response: GetObjectsResponse = conn.decode().await?;
        Ok(ObjectsReader { conn, sizes: response.object_sizes.into_iter() })
    }
}

/// Sequential access to the bodies of a `GetObjects` response. The
/// caller must fully read each body before asking for the next.
pub struct ObjectsReader<'a> {
    conn: CallConn<'a>,
    sizes: std::vec::IntoIter<u64>,
}

impl ObjectsReader<'_> {
    /// The next object's declared size and a reader over exactly that
    /// many bytes, or `None` past the last object.
    pub fn next_object(&mut self) -> Option<(u64, impl AsyncRead + Unpin + '_)> {
        let size = self.sizes.next()?;
        Some((size, self.conn.body_reader(size)))
    }
}
