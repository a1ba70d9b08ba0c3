// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RPC methods exported by the object server.

use std::sync::Arc;

use async_trait::async_trait;
use herd_protocol::object_server::{
    AddObjectRequest, AddObjectResponse, CheckObjectsRequest, CheckObjectsResponse,
    GetObjectsRequest, GetObjectsResponse, ADD_OBJECTS, CHECK_OBJECTS, GET_OBJECTS,
};
use slog::{info, o, warn, Logger};
use srpc::{MethodHandler, Server, ServerConn};

use crate::store::{self, ObjectStore};

/// Register every object-server method on `server`.
pub fn register(server: &mut Server, store: &Arc<ObjectStore>, log: &Logger) {
    let log = log.new(o!("component" => "object-rpcd"));
    server.register(
        ADD_OBJECTS,
        Arc::new(AddObjects { store: Arc::clone(store), log: log.clone() }),
    );
    server.register(
        GET_OBJECTS,
        Arc::new(GetObjects { store: Arc::clone(store) }),
    );
    server.register(
        CHECK_OBJECTS,
        Arc::new(CheckObjects { store: Arc::clone(store) }),
    );
}

struct AddObjects {
    store: Arc<ObjectStore>,
    log: Logger,
}

#[async_trait]
impl MethodHandler for AddObjects {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), srpc::Error> {
        let mut num_added = 0u64;
        let mut num_objects = 0u64;
        loop {
            let request: AddObjectRequest = conn.decode().await?;
            if request.length == 0 {
                break;
            }
            num_objects += 1;
            let outcome = {
                let mut body = conn.body_reader(request.length);
                self.store
                    .add_object(request.length, request.expected_hash, &mut body)
                    .await
            };
            match outcome {
                Ok((hash, added)) => {
                    if added {
                        num_added += 1;
                    }
                    conn.encode(&AddObjectResponse { hash, added, error: None })
                        .await?;
                    conn.flush().await?;
                }
                Err(store::Error::HashMismatch { expected, actual }) => {
                    // Report the failure in-band, then stop reading the
                    // stream; the connection is torn down.
                    warn!(self.log, "AddObjects digest mismatch";
                        "expected" => %expected, "actual" => %actual);
                    conn.encode(&AddObjectResponse {
                        hash: actual,
                        added: false,
                        error: Some(format!(
                            "digest mismatch: expected {}, actual {}",
                            expected, actual
                        )),
                    })
                    .await?;
                    conn.flush().await?;
                    return Err(srpc::Error::Closed);
                }
                Err(err) => {
                    warn!(self.log, "AddObjects failed";
                        "object" => num_objects, "error" => %err);
                    return Err(srpc::Error::Closed);
                }
            }
        }
        info!(self.log, "AddObjects";
            "received" => num_objects, "added" => num_added);
        Ok(())
    }
}

struct GetObjects {
    store: Arc<ObjectStore>,
}

#[async_trait]
impl MethodHandler for GetObjects {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), srpc::Error> {
        let request: GetObjectsRequest = conn.decode().await?;
        let mut object_sizes = Vec::with_capacity(request.hashes.len());
        for hash in &request.hashes {
            match self.store.size_of(hash) {
                Some(size) => object_sizes.push(size),
                None => {
                    return conn
                        .reply_error(&format!("object not found: {}", hash))
                        .await;
                }
            }
        }
        conn.reply_ok(&GetObjectsResponse { object_sizes }).await?;
        for hash in &request.hashes {
            let (_, mut file) = match self.store.open_object(hash).await {
                Ok(open) => open,
                // Objects are immutable and never deleted out from under
                // the index; failing to open one mid-stream is a broken
                // store and tears down the connection.
                Err(_) => return Err(srpc::Error::Closed),
            };
            conn.copy_raw_from(&mut file).await?;
        }
        conn.flush().await
    }
}

struct CheckObjects {
    store: Arc<ObjectStore>,
}

#[async_trait]
impl MethodHandler for CheckObjects {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), srpc::Error> {
        let request: CheckObjectsRequest = conn.decode().await?;
        let object_sizes = self.store.check_objects(&request.hashes);
        conn.reply_ok(&CheckObjectsResponse { object_sizes }).await
    }
}
