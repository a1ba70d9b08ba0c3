// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Object server protocol tests over real loopback connections.

use std::sync::Arc;

use camino_tempfile::Utf8TempDir;
use herd_common::logging::test_logger;
use herd_common::ObjectHash;
use herd_protocol::object_server::{AddObjectRequest, AddObjectResponse, ADD_OBJECTS};
use object_store::{ClientError, ObjectAdderQueue, ObjectClient, ObjectStore};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

async fn start_object_server() -> (String, Arc<ObjectStore>, Utf8TempDir) {
    let dir = camino_tempfile::tempdir().unwrap();
    let log = test_logger();
    let store = Arc::new(ObjectStore::open(dir.path(), &log).await.unwrap());
    let mut server = srpc::Server::new(log.clone());
    object_store::rpcd::register(&mut server, &store, &log);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(Arc::new(server).serve(listener));
    (address, store, dir)
}

#[tokio::test]
async fn add_then_get_round_trip() {
    let (address, _store, _dir) = start_object_server().await;
    let mut client = ObjectClient::dial(&address).await.unwrap();

    let content = b"hello object";
    let (hash, added) = client.add_object(content).await.unwrap();
    assert!(added);
    assert_eq!(hash, ObjectHash::of(content));

    // The second add is idempotent: no error, added=false.
    let (hash2, added) = client.add_object(content).await.unwrap();
    assert_eq!(hash2, hash);
    assert!(!added);

    let mut reader = client.get_objects(false, &[hash]).await.unwrap();
    let (size, mut body) = reader.next_object().unwrap();
    assert_eq!(size, content.len() as u64);
    let mut read_back = Vec::new();
    body.read_to_end(&mut read_back).await.unwrap();
    assert_eq!(read_back, content);
    drop(body);
    assert!(reader.next_object().is_none());
}

#[tokio::test]
async fn get_missing_object_fails_before_bodies() {
    let (address, _store, _dir) = start_object_server().await;
    let mut client = ObjectClient::dial(&address).await.unwrap();
    let absent = ObjectHash::of(b"absent");
    match client.get_objects(false, &[absent]).await {
        Err(ClientError::Server(message)) => {
            assert!(message.contains("not found"));
            assert!(message.contains(&absent.to_string()));
        }
        other => panic!("expected server error, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn check_objects_reports_sizes() {
    let (address, _store, _dir) = start_object_server().await;
    let mut client = ObjectClient::dial(&address).await.unwrap();
    let present = b"present";
    let (hash, _) = client.add_object(present).await.unwrap();
    let absent = ObjectHash::of(b"absent");
    let sizes = client.check_objects(&[absent, hash]).await.unwrap();
    assert_eq!(sizes, vec![0, present.len() as u64]);
}

/// Stream several requests, duplicates interleaved with fresh objects,
/// before reading any response; responses must come back in request
/// order with correct `added` flags.
#[tokio::test]
async fn pipelined_responses_in_request_order() {
    let (address, _store, _dir) = start_object_server().await;
    let mut client = srpc::Client::dial(&address).await.unwrap();

    let contents: Vec<Vec<u8>> = (0..50u32)
        .map(|i| format!("object {}", i / 2).into_bytes())
        .collect();
    let mut conn = client.call(ADD_OBJECTS).await.unwrap();
    for content in &contents {
        let hash = ObjectHash::of(content);
        conn.encode(&AddObjectRequest {
            length: content.len() as u64,
            expected_hash: Some(hash),
        })
        .await
        .unwrap();
        conn.write_raw(content).await.unwrap();
    }
    conn.encode(&AddObjectRequest { length: 0, expected_hash: None }).await.unwrap();
    conn.flush().await.unwrap();

    for (i, content) in contents.iter().enumerate() {
        let response: AddObjectResponse = conn.decode().await.unwrap();
        assert_eq!(response.error, None);
        assert_eq!(response.hash, ObjectHash::of(content));
        // Even-indexed requests are first sightings, odd ones duplicates.
        assert_eq!(response.added, i % 2 == 0, "response {}", i);
    }
}

#[tokio::test]
async fn adder_queue_uploads_everything() {
    let (address, store, _dir) = start_object_server().await;
    let client = srpc::Client::dial(&address).await.unwrap();
    let mut queue = ObjectAdderQueue::new(client).await.unwrap();
    let mut hashes = Vec::new();
    for i in 0..200u32 {
        let content = format!("bulk object {}", i).into_bytes();
        hashes.push(queue.add(&content).await.unwrap());
    }
    queue.close().await.unwrap();
    assert_eq!(store.object_count(), 200);
    for (i, hash) in hashes.iter().enumerate() {
        assert_eq!(
            store.size_of(hash),
            Some(format!("bulk object {}", i).len() as u64)
        );
    }
}

#[tokio::test]
async fn hash_mismatch_surfaces_in_response() {
    let (address, store, _dir) = start_object_server().await;
    let mut client = srpc::Client::dial(&address).await.unwrap();
    let content = b"mismatched";
    let wrong = ObjectHash::of(b"not the content");
    let mut conn = client.call(ADD_OBJECTS).await.unwrap();
    conn.encode(&AddObjectRequest {
        length: content.len() as u64,
        expected_hash: Some(wrong),
    })
    .await
    .unwrap();
    conn.write_raw(content).await.unwrap();
    conn.flush().await.unwrap();
    let response: AddObjectResponse = conn.decode().await.unwrap();
    assert!(response.error.unwrap().contains("digest mismatch"));
    assert!(!response.added);
    assert_eq!(response.hash, ObjectHash::of(content));
    assert_eq!(store.object_count(), 0);
}

#[tokio::test]
async fn concurrent_streams_add_identical_object() {
    let (address, store, _dir) = start_object_server().await;
    let content = b"same bytes from two clients";
    let mut tasks = Vec::new();
    for _ in 0..2 {
        let address = address.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = ObjectClient::dial(&address).await.unwrap();
            client.add_object(content).await.unwrap()
        }));
    }
    let mut added_count = 0;
    for task in tasks {
        let (hash, added) = task.await.unwrap();
        assert_eq!(hash, ObjectHash::of(content));
        if added {
            added_count += 1;
        }
    }
    assert_eq!(added_count, 1);
    let (size, _) = store.open_object(&ObjectHash::of(content)).await.unwrap();
    assert_eq!(size, content.len() as u64);
}
