// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pipelined bulk adds.
//!
//! The queue overlaps sending objects with reading acknowledgments: the
//! caller streams adds through [`ObjectAdderQueue::add`] while a
//! receiver task decodes responses in request order. The first failure
//! lands on an error channel which the sender consults before each
//! subsequent send, so a broken upload fast-fails instead of wasting
//! bandwidth. Up to [`MAX_IN_FLIGHT`] requests may be outstanding before
//! the sender blocks.

use herd_common::ObjectHash;
use herd_protocol::object_server::{AddObjectRequest, AddObjectResponse, ADD_OBJECTS};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;

use crate::ClientError;

pub const MAX_IN_FLIGHT: usize = 1024;

pub struct ObjectAdderQueue {
    send: srpc::SendHalf,
    pending_tx: mpsc::Sender<ObjectHash>,
    error_rx: mpsc::Receiver<ClientError>,
    receiver: JoinHandle<()>,
}

impl ObjectAdderQueue {
    /// Open an AddObjects stream on a dedicated connection.
    pub async fn new(client: srpc::Client) -> Result<ObjectAdderQueue, ClientError> {
        let (send, recv) = client.into_streaming_call(ADD_OBJECTS).await?;
        let (pending_tx, pending_rx) = mpsc::channel(MAX_IN_FLIGHT);
        let (error_tx, error_rx) = mpsc::channel(1);
        let receiver = tokio::spawn(read_responses(recv, pending_rx, error_tx));
        Ok(ObjectAdderQueue { send, pending_tx, error_rx, receiver })
    }

    /// Queue one object. Returns its hash; the acknowledgment is
    /// consumed asynchronously and any failure surfaces on a later call
    /// or on [`close`](Self::close).
    pub async fn add(&mut self, content: &[u8]) -> Result<ObjectHash, ClientError> {
        self.consume_errors()?;
        let hash = ObjectHash::of(content);
        self.send
            .encode(&AddObjectRequest {
                length: content.len() as u64,
                expected_hash: Some(hash),
            })
            .await?;
        self.send.write_raw(content).await?;
        self.send.flush().await?;
        if self.pending_tx.send(hash).await.is_err() {
            // The receiver task is gone; the error it left is
            // authoritative.
            self.consume_errors()?;
            return Err(ClientError::Server("response reader stopped".to_string()));
        }
        Ok(hash)
    }

    /// Terminate the stream, wait for every outstanding acknowledgment
    /// and report the first failure, if any.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.send
            .encode(&AddObjectRequest { length: 0, expected_hash: None })
            .await?;
        self.send.flush().await?;
        drop(self.pending_tx);
        let _ = self.receiver.await;
        match self.error_rx.try_recv() {
            Ok(error) => Err(error),
            Err(_) => Ok(()),
        }
    }

    fn consume_errors(&mut self) -> Result<(), ClientError> {
        match self.error_rx.try_recv() {
            Ok(error) => Err(error),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(()),
        }
    }
}

async fn read_responses(
    mut recv: srpc::RecvHalf,
    mut pending_rx: mpsc::Receiver<ObjectHash>,
    error_tx: mpsc::Sender<ClientError>,
) {
    while let Some(expected) = pending_rx.recv().await {
        let response: AddObjectResponse = match recv.decode().await {
            Ok(response) => response,
            Err(err) => {
                let _ = error_tx.send(err.into()).await;
                return;
            }
        };
        if let Some(message) = response.error {
            let _ = error_tx.send(ClientError::Server(message)).await;
            return;
        }
        if response.hash != expected {
            let _ = error_tx
                .send(ClientError::Server(format!(
                    "response out of order: expected {}, got {}",
                    expected, response.hash
                )))
                .await;
            return;
        }
    }
}
