// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The object server's RPC surface.
//!
//! `AddObjects` is a streaming call: the client sends any number of
//! [`AddObjectRequest`] records, each followed immediately by `length`
//! raw content bytes, and terminates the stream with a request of length
//! zero. The server answers one [`AddObjectResponse`] per request, in
//! request order; the client may stream many requests before reading any
//! responses.
//!
//! `GetObjects` answers with one [`GetObjectsResponse`] record followed
//! by the raw contents of every requested object, back-to-back in request
//! order.

use herd_common::ObjectHash;
use serde::{Deserialize, Serialize};

pub const ADD_OBJECTS: &str = "ObjectServer.AddObjects";
pub const GET_OBJECTS: &str = "ObjectServer.GetObjects";
pub const CHECK_OBJECTS: &str = "ObjectServer.CheckObjects";

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AddObjectRequest {
    /// Number of raw content bytes following this record; zero
    /// terminates the stream.
    pub length: u64,
    /// If supplied, the server verifies the received content hashes to
    /// this value.
    pub expected_hash: Option<ObjectHash>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddObjectResponse {
    /// Hash of the received content.
    pub hash: ObjectHash,
    /// True if the object was stored by this request; false with no
    /// error means it was already present.
    pub added: bool,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetObjectsRequest {
    /// Reserved for callers that want the transfer unthrottled and
    /// unshared (benchmarking); the server currently treats all
    /// transfers alike.
    pub exclusive: bool,
    pub hashes: Vec<ObjectHash>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetObjectsResponse {
    /// Sizes of the requested objects, in request order.
    pub object_sizes: Vec<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckObjectsRequest {
    pub hashes: Vec<ObjectHash>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckObjectsResponse {
    /// Sizes of the requested objects, in request order; zero means
    /// absent.
    pub object_sizes: Vec<u64>,
}
