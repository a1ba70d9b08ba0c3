// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-sub bookkeeping: one record per managed machine, created when the
//! machine database first names the host and destroyed when it
//! disappears. Workers resolve shared resources through the herd, so a
//! record never links back to it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use herd_common::ObjectHash;
use herd_filesystem::FileSystem;
use herd_protocol::dominator::SubInfo;
use tokio::sync::OwnedSemaphorePermit;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubStatus {
    Unknown,
    Connecting,
    FailedToConnect,
    Subnormal,
    WaitingToPoll,
    Polling,
    Compliant,
    Updating,
    FailedToUpdate,
    WaitingToFetch,
    Fetching,
    FailedToFetch,
}

impl fmt::Display for SubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SubStatus::Unknown => "unknown",
            SubStatus::Connecting => "connecting",
            SubStatus::FailedToConnect => "failed to connect",
            SubStatus::Subnormal => "subnormal",
            SubStatus::WaitingToPoll => "waiting to poll",
            SubStatus::Polling => "polling",
            SubStatus::Compliant => "compliant",
            SubStatus::Updating => "updating",
            SubStatus::FailedToUpdate => "failed to update",
            SubStatus::WaitingToFetch => "waiting to fetch",
            SubStatus::Fetching => "fetching",
            SubStatus::FailedToFetch => "failed to fetch",
        };
        f.write_str(text)
    }
}

pub struct SubRecord {
    pub hostname: String,
    pub required_image: String,
    /// Reporting only; convergence always targets the required image.
    pub planned_image: String,
    pub status: SubStatus,
    /// A worker is currently driving this sub; at most one at a time.
    pub busy: bool,
    /// Human-readable note from the last failure, empty when healthy.
    pub last_note: String,
    /// Last tree reported by the sub, kept across polls so an unchanged
    /// sub only ships its generation number.
    pub cached_fs: Option<Arc<FileSystem>>,
    pub cached_object_cache: BTreeSet<ObjectHash>,
    pub generation: u64,
    /// A fetch was dispatched and its outcome not yet observed.
    pub pending_fetch: bool,
    /// An update was dispatched and its outcome not yet observed.
    pub pending_update: bool,
    /// Held while a dispatched fetch is outstanding, bounding the number
    /// of concurrent fetches fleet-wide.
    pub fetch_permit: Option<OwnedSemaphorePermit>,
    pub next_poll_at: Instant,
    pub last_poll_duration: Duration,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_update_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl SubRecord {
    pub fn new(hostname: &str) -> SubRecord {
        SubRecord {
            hostname: hostname.to_string(),
            required_image: String::new(),
            planned_image: String::new(),
            status: SubStatus::Unknown,
            busy: false,
            last_note: String::new(),
            cached_fs: None,
            cached_object_cache: BTreeSet::new(),
            generation: 0,
            pending_fetch: false,
            pending_update: false,
            fetch_permit: None,
            next_poll_at: Instant::now(),
            last_poll_duration: Duration::ZERO,
            last_poll_at: None,
            last_update_at: None,
            last_sync_at: None,
        }
    }

    pub fn info(&self) -> SubInfo {
        SubInfo {
            hostname: self.hostname.clone(),
            status: self.status.to_string(),
            required_image: self.required_image.clone(),
            planned_image: self.planned_image.clone(),
            last_note: self.last_note.clone(),
            last_poll_duration_ms: self.last_poll_duration.as_millis() as u64,
            last_poll_at: self.last_poll_at,
            last_update_at: self.last_update_at,
            last_sync_at: self.last_sync_at,
        }
    }
}
