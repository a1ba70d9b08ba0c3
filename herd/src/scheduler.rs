// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The poll scheduler and the per-sub worker.
//!
//! On each tick, every idle sub past its backoff gets a worker, bounded
//! by the worker semaphore. A worker runs one cycle: connect, poll,
//! merge the reported tree, then either confirm compliance, dispatch a
//! fetch of missing objects, or dispatch the update plan. Exactly one
//! worker drives a given sub at a time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use herd_common::ObjectHash;
use herd_protocol::subd::{
    CleanupRequest, CleanupResponse, FetchRequest, FetchResponse, PollRequest,
    PollResponse, UpdateResponse, CLEANUP, ERR_FETCH_IN_PROGRESS, ERR_READ_ONLY,
    ERR_UPDATE_IN_PROGRESS, FETCH, POLL, UPDATE,
};
use rand::Rng;
use slog::{debug, warn};

use crate::diff;
use crate::sub::SubStatus;
use crate::Herd;

/// Drive the fleet forever.
pub async fn run_scheduler(herd: Arc<Herd>) {
    let mut ticker = tokio::time::interval(herd.config().tick_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for hostname in herd.due_subs() {
            let Ok(permit) = Arc::clone(&herd.worker_slots).try_acquire_owned()
            else {
                // Saturated; the rest of the due list waits for the next
                // tick.
                break;
            };
            let claimed = herd
                .with_sub(&hostname, |sub| {
                    if sub.busy {
                        false
                    } else {
                        sub.busy = true;
                        sub.status = SubStatus::Connecting;
                        true
                    }
                })
                .unwrap_or(false);
            if !claimed {
                continue;
            }
            let herd = Arc::clone(&herd);
            tokio::spawn(async move {
                let _permit = permit;
                run_worker(herd, hostname).await;
            });
        }
    }
}

struct CycleFailure {
    status: SubStatus,
    note: String,
}

fn fail(status: SubStatus, note: impl Into<String>) -> CycleFailure {
    CycleFailure { status, note: note.into() }
}

async fn run_worker(herd: Arc<Herd>, hostname: String) {
    let started = Instant::now();
    let outcome = poll_cycle(&herd, &hostname).await;
    let backoff = jittered(herd.config().poll_interval());
    herd.with_sub(&hostname, |sub| {
        sub.busy = false;
        sub.last_poll_duration = started.elapsed();
        sub.last_poll_at = Some(Utc::now());
        sub.next_poll_at = Instant::now() + backoff;
        if let Err(failure) = &outcome {
            sub.status = failure.status;
            sub.last_note = failure.note.clone();
        }
    });
    if let Err(failure) = &outcome {
        debug!(herd.log, "cycle failed"; "sub" => &hostname,
            "status" => %failure.status, "note" => &failure.note);
    }
}

/// One convergence cycle against one sub. Success paths update the
/// record in place; failures are applied by the worker epilogue.
async fn poll_cycle(herd: &Herd, hostname: &str) -> Result<(), CycleFailure> {
    let config = herd.config();
    let Some((required_image, have_generation)) = herd
        .with_sub(hostname, |sub| (sub.required_image.clone(), sub.generation))
    else {
        // Removed from the fleet while we were queued.
        return Ok(());
    };

    let address = config.sub_address(hostname);
    let mut client = srpc::Client::dial(&address).await.map_err(|err| {
        fail(SubStatus::FailedToConnect, err.to_string())
    })?;
    herd.with_sub(hostname, |sub| sub.status = SubStatus::Polling);
    let response: PollResponse = client
        .request_reply(POLL, &PollRequest { have_generation })
        .await
        .map_err(|err| {
            fail(SubStatus::FailedToConnect, format!("poll: {}", err))
        })?;

    if let Some(fs) = response.file_system {
        let fs = Arc::new(fs);
        let object_cache = response
            .object_cache
            .unwrap_or_default()
            .into_iter()
            .collect::<std::collections::BTreeSet<_>>();
        herd.with_sub(hostname, |sub| {
            sub.cached_fs = Some(Arc::clone(&fs));
            sub.cached_object_cache = object_cache.clone();
            sub.generation = response.generation_count;
        });
    } else {
        herd.with_sub(hostname, |sub| sub.generation = response.generation_count);
    }

    if !response.last_scan_error.is_empty() {
        return Err(fail(
            SubStatus::Subnormal,
            format!("scan failed: {}", response.last_scan_error),
        ));
    }

    // Resolve a previously-dispatched fetch or update before planning
    // anything new.
    let (pending_fetch, pending_update) = herd
        .with_sub(hostname, |sub| (sub.pending_fetch, sub.pending_update))
        .unwrap_or((false, false));
    if pending_fetch {
        if response.fetch_in_progress {
            herd.with_sub(hostname, |sub| sub.status = SubStatus::Fetching);
            return Ok(());
        }
        herd.with_sub(hostname, |sub| {
            sub.pending_fetch = false;
            sub.fetch_permit = None;
        });
        if !response.last_fetch_error.is_empty() {
            return Err(fail(
                SubStatus::FailedToFetch,
                response.last_fetch_error.clone(),
            ));
        }
    }
    if pending_update {
        if response.update_in_progress {
            herd.with_sub(hostname, |sub| sub.status = SubStatus::Updating);
            return Ok(());
        }
        herd.with_sub(hostname, |sub| sub.pending_update = false);
        if !response.last_update_error.is_empty() {
            return Err(fail(
                SubStatus::FailedToUpdate,
                response.last_update_error.clone(),
            ));
        }
    }
    // Work we did not dispatch (e.g. from before a herd restart).
    if response.fetch_in_progress {
        herd.with_sub(hostname, |sub| sub.status = SubStatus::Fetching);
        return Ok(());
    }
    if response.update_in_progress {
        herd.with_sub(hostname, |sub| sub.status = SubStatus::Updating);
        return Ok(());
    }

    if required_image.is_empty() {
        return Err(fail(SubStatus::Subnormal, "no required image"));
    }
    let image = match herd.images.get(&required_image).await {
        Ok(Some(image)) => image,
        Ok(None) => {
            return Err(fail(
                SubStatus::Subnormal,
                format!("image not found: {}", required_image),
            ));
        }
        Err(err) => {
            return Err(fail(
                SubStatus::Subnormal,
                format!("loading image {}: {}", required_image, err),
            ));
        }
    };

    let Some(fs) = herd.with_sub(hostname, |sub| sub.cached_fs.clone()).flatten()
    else {
        // No scan reported yet.
        herd.with_sub(hostname, |sub| sub.status = SubStatus::WaitingToPoll);
        return Ok(());
    };

    let sub_hash = fs
        .content_hash(&|path| image.filter.matches(path))
        .map_err(|err| {
            fail(SubStatus::Subnormal, format!("sub tree invalid: {}", err))
        })?;
    if sub_hash == image.content_hash {
        cleanup_object_cache(herd, hostname, &mut client).await;
        mark_compliant(herd, hostname);
        return Ok(());
    }

    let plan =
        diff::build_update_plan(&required_image, &image, &fs).map_err(|err| {
            fail(SubStatus::Subnormal, format!("diff failed: {}", err))
        })?;

    let object_cache = herd
        .with_sub(hostname, |sub| sub.cached_object_cache.clone())
        .unwrap_or_default();
    let needed: Vec<ObjectHash> = plan
        .required_objects
        .iter()
        .filter(|hash| !object_cache.contains(hash))
        .copied()
        .collect();

    if !needed.is_empty() {
        let Ok(permit) = Arc::clone(&herd.fetch_slots).try_acquire_owned() else {
            // Fleet-wide fetch cap reached; try again next cycle.
            herd.with_sub(hostname, |sub| sub.status = SubStatus::WaitingToFetch);
            return Ok(());
        };
        let request = FetchRequest {
            server_address: config.object_server_address.clone(),
            hashes: needed,
        };
        debug!(herd.log, "dispatching fetch"; "sub" => hostname,
            "objects" => request.hashes.len());
        match client.request_reply::<_, FetchResponse>(FETCH, &request).await {
            Ok(_) => {
                herd.with_sub(hostname, |sub| {
                    sub.status = SubStatus::WaitingToFetch;
                    sub.pending_fetch = true;
                    sub.fetch_permit = Some(permit);
                });
                Ok(())
            }
            Err(srpc::Error::Remote(message)) => {
                Err(classify_rejection(message, SubStatus::FailedToFetch))
            }
            Err(err) => Err(fail(SubStatus::FailedToFetch, err.to_string())),
        }
    } else if plan.is_empty() {
        // The filtered hashes differ only in ways no plan step covers
        // (special files); converging further is not possible.
        warn!(herd.log, "tree differs but plan is empty"; "sub" => hostname);
        mark_compliant(herd, hostname);
        Ok(())
    } else {
        if let Some(reason) = herd.updates_disabled() {
            herd.with_sub(hostname, |sub| {
                sub.status = SubStatus::WaitingToPoll;
                sub.last_note = format!("updates disabled: {}", reason);
            });
            return Ok(());
        }
        debug!(herd.log, "dispatching update"; "sub" => hostname,
            "writes" => plan.update.files_to_write.len(),
            "deletes" => plan.update.paths_to_delete.len());
        match client.request_reply::<_, UpdateResponse>(UPDATE, &plan.update).await
        {
            Ok(_) => {
                herd.with_sub(hostname, |sub| {
                    sub.status = SubStatus::Updating;
                    sub.pending_update = true;
                    sub.last_update_at = Some(Utc::now());
                });
                Ok(())
            }
            Err(srpc::Error::Remote(message)) => {
                Err(classify_rejection(message, SubStatus::FailedToUpdate))
            }
            Err(err) => Err(fail(SubStatus::FailedToUpdate, err.to_string())),
        }
    }
}

/// A compliant sub no longer needs its fetched cache copies (their
/// content lives in the tree now); tell it to drop them. Best-effort:
/// a failure only delays the cleanup to the next compliant cycle.
async fn cleanup_object_cache(
    herd: &Herd,
    hostname: &str,
    client: &mut srpc::Client,
) {
    let cached = herd
        .with_sub(hostname, |sub| sub.cached_object_cache.clone())
        .unwrap_or_default();
    if cached.is_empty() {
        return;
    }
    let request = CleanupRequest { hashes: cached.into_iter().collect() };
    match client.request_reply::<_, CleanupResponse>(CLEANUP, &request).await {
        Ok(_) => {
            herd.with_sub(hostname, |sub| sub.cached_object_cache.clear());
        }
        Err(err) => {
            debug!(herd.log, "cleanup failed"; "sub" => hostname,
                "error" => %err);
        }
    }
}

fn mark_compliant(herd: &Herd, hostname: &str) {
    herd.with_sub(hostname, |sub| {
        if sub.status != SubStatus::Compliant {
            sub.last_sync_at = Some(Utc::now());
        }
        sub.status = SubStatus::Compliant;
        sub.last_note.clear();
    });
}

/// Rejections the sub issues before doing any work map to specific
/// statuses; anything else is a plain failure of the dispatched
/// operation.
fn classify_rejection(message: String, failed: SubStatus) -> CycleFailure {
    if message == ERR_READ_ONLY {
        fail(SubStatus::Subnormal, message)
    } else if message == ERR_FETCH_IN_PROGRESS {
        fail(SubStatus::Fetching, message)
    } else if message == ERR_UPDATE_IN_PROGRESS {
        fail(SubStatus::Updating, message)
    } else {
        fail(failed, message)
    }
}

fn jittered(interval: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..1.1);
    Duration::from_secs_f64(interval.as_secs_f64() * factor)
}
