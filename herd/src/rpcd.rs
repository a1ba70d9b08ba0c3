// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Administrative RPC methods exported by the herd.

use std::sync::Arc;

use async_trait::async_trait;
use herd_protocol::dominator::{
    DisableUpdatesRequest, DisableUpdatesResponse, EnableUpdatesRequest,
    EnableUpdatesResponse, ListSubsRequest, ListSubsResponse, PollSubRequest,
    PollSubResponse, DISABLE_UPDATES, ENABLE_UPDATES, LIST_SUBS, POLL_SUB,
};
use srpc::{MethodHandler, Server, ServerConn};

use crate::Herd;

pub fn register(server: &mut Server, herd: &Arc<Herd>) {
    server.register(
        DISABLE_UPDATES,
        Arc::new(DisableUpdates { herd: Arc::clone(herd) }),
    );
    server.register(
        ENABLE_UPDATES,
        Arc::new(EnableUpdates { herd: Arc::clone(herd) }),
    );
    server.register(POLL_SUB, Arc::new(PollSub { herd: Arc::clone(herd) }));
    server.register(LIST_SUBS, Arc::new(ListSubs { herd: Arc::clone(herd) }));
}

struct DisableUpdates {
    herd: Arc<Herd>,
}

#[async_trait]
impl MethodHandler for DisableUpdates {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), srpc::Error> {
        let request: DisableUpdatesRequest = conn.decode().await?;
        if request.reason.is_empty() {
            return conn.reply_error("a reason is required").await;
        }
        self.herd.disable_updates(&request.reason);
        conn.reply_ok(&DisableUpdatesResponse {}).await
    }
}

struct EnableUpdates {
    herd: Arc<Herd>,
}

#[async_trait]
impl MethodHandler for EnableUpdates {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), srpc::Error> {
        let _request: EnableUpdatesRequest = conn.decode().await?;
        self.herd.enable_updates();
        conn.reply_ok(&EnableUpdatesResponse {}).await
    }
}

struct PollSub {
    herd: Arc<Herd>,
}

#[async_trait]
impl MethodHandler for PollSub {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), srpc::Error> {
        let request: PollSubRequest = conn.decode().await?;
        if self.herd.poll_sub_now(&request.hostname) {
            conn.reply_ok(&PollSubResponse {}).await
        } else {
            conn.reply_error(&format!("unknown sub: {}", request.hostname)).await
        }
    }
}

struct ListSubs {
    herd: Arc<Herd>,
}

#[async_trait]
impl MethodHandler for ListSubs {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), srpc::Error> {
        let _request: ListSubsRequest = conn.decode().await?;
        conn.reply_ok(&ListSubsResponse { subs: self.herd.sub_infos() }).await
    }
}
