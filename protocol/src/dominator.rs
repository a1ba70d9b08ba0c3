// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The herd's administrative RPC surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DISABLE_UPDATES: &str = "Dominator.DisableUpdates";
pub const ENABLE_UPDATES: &str = "Dominator.EnableUpdates";
pub const POLL_SUB: &str = "Dominator.PollSub";
pub const LIST_SUBS: &str = "Dominator.ListSubs";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DisableUpdatesRequest {
    /// Recorded and shown in status views; must be non-empty.
    pub reason: String,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DisableUpdatesResponse {}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct EnableUpdatesRequest {}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct EnableUpdatesResponse {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollSubRequest {
    pub hostname: String,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PollSubResponse {}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ListSubsRequest {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubInfo {
    pub hostname: String,
    pub status: String,
    pub required_image: String,
    pub planned_image: String,
    /// Human-readable note from the last failure, empty when healthy.
    pub last_note: String,
    pub last_poll_duration_ms: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_update_at: Option<DateTime<Utc>>,
    /// When the sub last reached compliance.
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListSubsResponse {
    pub subs: Vec<SubInfo>,
}
