// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fetch pipeline: pull a set of objects from an object server into
//! the local object cache. One fetch runs at a time (admission is
//! decided by the RPC layer); the work itself holds the work lock in
//! read mode so it can overlap scans but never an update.

use std::sync::Arc;
use std::time::Instant;

use herd_common::backoff;
use herd_common::ObjectHash;
use herd_protocol::subd::FetchRequest;
use object_store::{ClientError, ObjectClient};
use slog::{error, info, o, Logger};

use crate::SubState;

/// Fetches larger than this measure throughput when no speed has been
/// established yet.
const BENCHMARK_THRESHOLD: u64 = 64 << 20;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("dialing object server {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: srpc::Error,
    },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("object stream ended before {0} was delivered")]
    MissingObject(ObjectHash),

    #[error("storing fetched object {hash}: {source}")]
    Store {
        hash: ObjectHash,
        #[source]
        source: object_store::store::Error,
    },
}

/// Background half of a Fetch call. Clears the in-progress flag and
/// pokes the scanner when done, whatever the outcome.
pub(crate) async fn run_fetch(state: Arc<SubState>, request: FetchRequest) {
    let log = state.log.new(o!("task" => "fetch"));
    info!(log, "fetch starting";
        "objects" => request.hashes.len(),
        "server" => &request.server_address);
    let result = fetch_objects(&state, &request, &log).await;
    let failed = result.is_err();
    match result {
        Ok(()) => state.last_fetch_error.lock().unwrap().clear(),
        Err(err) => {
            error!(log, "fetch failed"; "error" => %err);
            *state.last_fetch_error.lock().unwrap() = err.to_string();
        }
    }
    state.flags.lock().unwrap().fetch_in_progress = false;
    state.request_rescan();
    if failed && state.config.exit_on_fetch_failure {
        error!(log, "exiting on fetch failure");
        std::process::exit(1);
    }
}

async fn fetch_objects(
    state: &SubState,
    request: &FetchRequest,
    log: &Logger,
) -> Result<(), FetchError> {
    let _guard = state.work_lock.read().await;

    let address = request.server_address.clone();
    let client = backoff::retry(backoff::retry_policy_transient(), || async {
        srpc::Client::dial(&address).await.map_err(|err| match err {
            srpc::Error::Io(_) | srpc::Error::ConnectTimeout => {
                backoff::BackoffError::transient(err)
            }
            err => backoff::BackoffError::permanent(err),
        })
    })
    .await
    .map_err(|source| FetchError::Dial { address: address.clone(), source })?;
    let mut client = ObjectClient::from_client(client);

    // With no established speed and a large enough transfer, measure it
    // and feed the hashing governor.
    let mut benchmark = false;
    if state.network_speed() == 0 {
        let sizes = client.check_objects(&request.hashes).await?;
        benchmark = sizes.iter().sum::<u64>() > BENCHMARK_THRESHOLD;
        if benchmark {
            info!(log, "benchmarking network speed");
        }
    }

    let started = Instant::now();
    let mut total_bytes = 0u64;
    let mut reader = client.get_objects(benchmark, &request.hashes).await?;
    for hash in &request.hashes {
        let Some((length, mut body)) = reader.next_object() else {
            return Err(FetchError::MissingObject(*hash));
        };
        state
            .object_cache
            .add_object(length, Some(*hash), &mut body)
            .await
            .map_err(|source| FetchError::Store { hash: *hash, source })?;
        total_bytes += length;
    }
    drop(reader);

    let elapsed = started.elapsed();
    let bytes_per_sec = if elapsed.as_secs_f64() > 0.0 {
        (total_bytes as f64 / elapsed.as_secs_f64()) as u64
    } else {
        0
    };
    if benchmark && bytes_per_sec > 0 {
        state.set_network_speed(bytes_per_sec);
    }
    info!(log, "fetch complete";
        "bytes" => total_bytes,
        "duration_ms" => elapsed.as_millis() as u64,
        "bytes_per_sec" => bytes_per_sec);
    Ok(())
}
