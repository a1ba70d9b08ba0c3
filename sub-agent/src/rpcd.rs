// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RPC methods exported by the sub agent.
//!
//! Fetch and Update admit at most one operation each and are mutually
//! exclusive; rejected calls fail fast with distinct errors and no side
//! effects. A read-only agent rejects all mutating methods before any
//! work.

use std::sync::Arc;

use async_trait::async_trait;
use herd_protocol::subd::{
    CleanupRequest, CleanupResponse, FetchRequest, FetchResponse,
    GetConfigurationRequest, GetConfigurationResponse, PollRequest, PollResponse,
    UpdateRequest, UpdateResponse, CLEANUP, ERR_FETCH_IN_PROGRESS, ERR_READ_ONLY,
    ERR_UPDATE_IN_PROGRESS, FETCH, GET_CONFIGURATION, POLL, UPDATE,
};
use slog::info;
use srpc::{MethodHandler, Server, ServerConn};

use crate::{fetch, update, SubState};

/// Register every sub-agent method on `server`.
pub fn register(server: &mut Server, state: &Arc<SubState>) {
    server.register(POLL, Arc::new(Poll { state: Arc::clone(state) }));
    server.register(FETCH, Arc::new(Fetch { state: Arc::clone(state) }));
    server.register(UPDATE, Arc::new(Update { state: Arc::clone(state) }));
    server.register(
        GET_CONFIGURATION,
        Arc::new(GetConfiguration { state: Arc::clone(state) }),
    );
    server.register(CLEANUP, Arc::new(Cleanup { state: Arc::clone(state) }));
}

struct Poll {
    state: Arc<SubState>,
}

#[async_trait]
impl MethodHandler for Poll {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), srpc::Error> {
        let request: PollRequest = conn.decode().await?;
        let response = self.state.poll_response(request.have_generation);
        conn.reply_ok(&response).await
    }
}

struct Fetch {
    state: Arc<SubState>,
}

#[async_trait]
impl MethodHandler for Fetch {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), srpc::Error> {
        let request: FetchRequest = conn.decode().await?;
        if self.state.config().read_only {
            return conn.reply_error(ERR_READ_ONLY).await;
        }
        if let Err(message) = self.state.admit_fetch() {
            return conn.reply_error(message).await;
        }
        info!(self.state.log(), "Fetch"; "objects" => request.hashes.len());
        tokio::spawn(fetch::run_fetch(Arc::clone(&self.state), request));
        conn.reply_ok(&FetchResponse {}).await
    }
}

struct Update {
    state: Arc<SubState>,
}

#[async_trait]
impl MethodHandler for Update {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), srpc::Error> {
        let request: UpdateRequest = conn.decode().await?;
        if self.state.config().read_only {
            return conn.reply_error(ERR_READ_ONLY).await;
        }
        if let Err(message) = self.state.admit_update() {
            return conn.reply_error(message).await;
        }
        info!(self.state.log(), "Update";
            "image" => &request.image_name,
            "writes" => request.files_to_write.len());
        tokio::spawn(update::run_update(Arc::clone(&self.state), request));
        conn.reply_ok(&UpdateResponse {}).await
    }
}

struct GetConfiguration {
    state: Arc<SubState>,
}

#[async_trait]
impl MethodHandler for GetConfiguration {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), srpc::Error> {
        let _request: GetConfigurationRequest = conn.decode().await?;
        let config = self.state.config();
        conn.reply_ok(&GetConfigurationResponse {
            hash_speed_percent: config.hash_speed_percent,
            network_speed: self.state.network_speed(),
            scan_exclusion_list: config.scan_exclusion_list.clone(),
        })
        .await
    }
}

struct Cleanup {
    state: Arc<SubState>,
}

#[async_trait]
impl MethodHandler for Cleanup {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), srpc::Error> {
        let request: CleanupRequest = conn.decode().await?;
        if self.state.config().read_only {
            return conn.reply_error(ERR_READ_ONLY).await;
        }
        let mut removed = 0usize;
        for hash in &request.hashes {
            match self.state.object_cache().remove_object(hash).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => return conn.reply_error(&err.to_string()).await,
            }
        }
        info!(self.state.log(), "Cleanup"; "removed" => removed);
        self.state.request_rescan();
        conn.reply_ok(&CleanupResponse {}).await
    }
}

impl SubState {
    /// Admit a fetch, or name the conflict.
    pub fn admit_fetch(&self) -> Result<(), &'static str> {
        let mut flags = self.flags.lock().unwrap();
        if flags.fetch_in_progress {
            return Err(ERR_FETCH_IN_PROGRESS);
        }
        if flags.update_in_progress {
            return Err(ERR_UPDATE_IN_PROGRESS);
        }
        flags.fetch_in_progress = true;
        Ok(())
    }

    /// Admit an update, or name the conflict.
    pub fn admit_update(&self) -> Result<(), &'static str> {
        let mut flags = self.flags.lock().unwrap();
        if flags.update_in_progress {
            return Err(ERR_UPDATE_IN_PROGRESS);
        }
        if flags.fetch_in_progress {
            return Err(ERR_FETCH_IN_PROGRESS);
        }
        flags.update_in_progress = true;
        Ok(())
    }

    /// Build the state snapshot served to Poll. The tree and object
    /// cache ship only when the caller's generation is stale.
    pub fn poll_response(&self, have_generation: u64) -> PollResponse {
        let scan = self.scan.lock().unwrap();
        let flags = self.flags.lock().unwrap();
        let (file_system, object_cache) = if scan.generation != have_generation {
            (
                scan.file_system.as_deref().cloned(),
                Some(scan.object_cache.clone()),
            )
        } else {
            (None, None)
        };
        PollResponse {
            network_speed: self.network_speed(),
            fetch_in_progress: flags.fetch_in_progress,
            update_in_progress: flags.update_in_progress,
            last_fetch_error: self.last_fetch_error.lock().unwrap().clone(),
            last_update_error: self.last_update_error.lock().unwrap().clone(),
            last_scan_error: scan.last_error.clone(),
            generation_count: scan.generation,
            file_system,
            object_cache,
        }
    }
}
