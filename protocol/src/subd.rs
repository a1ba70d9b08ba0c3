// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sub agent's RPC surface.

use herd_common::ObjectHash;
use herd_filesystem::FileSystem;
use herd_image::Trigger;
use serde::{Deserialize, Serialize};

pub const POLL: &str = "Subd.Poll";
pub const FETCH: &str = "Subd.Fetch";
pub const UPDATE: &str = "Subd.Update";
pub const GET_CONFIGURATION: &str = "Subd.GetConfiguration";
pub const CLEANUP: &str = "Subd.Cleanup";

/// Rejection messages for requests refused before any work. The herd
/// matches these exactly to classify failures.
pub const ERR_READ_ONLY: &str = "rejected due to read-only mode";
pub const ERR_FETCH_IN_PROGRESS: &str = "fetch already in progress";
pub const ERR_UPDATE_IN_PROGRESS: &str = "update in progress";

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PollRequest {
    /// The filesystem generation the caller already holds; the sub omits
    /// the tree from the response when it is current.
    pub have_generation: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PollResponse {
    /// Measured or configured network speed, bytes per second; zero if
    /// unknown.
    pub network_speed: u64,
    pub fetch_in_progress: bool,
    pub update_in_progress: bool,
    /// Outcome of the most recent background fetch; empty if it
    /// succeeded or none has run.
    pub last_fetch_error: String,
    /// Outcome of the most recent background update; empty if it
    /// succeeded or none has run.
    pub last_update_error: String,
    /// Outcome of the most recent scan attempt; empty if it succeeded.
    pub last_scan_error: String,
    /// Monotone counter bumped on every completed scan and fetch.
    pub generation_count: u64,
    /// The scanned tree; `None` when `have_generation` is current or no
    /// scan has completed yet.
    pub file_system: Option<FileSystem>,
    /// Hashes held in the local object cache but not yet referenced by
    /// the tree. `None` whenever `file_system` is.
    pub object_cache: Option<Vec<ObjectHash>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Address of the object server to pull from.
    pub server_address: String,
    pub hashes: Vec<ObjectHash>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct FetchResponse {}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirectoryToMake {
    pub path: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileToWrite {
    pub path: String,
    pub hash: ObjectHash,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SymlinkToMake {
    pub path: String,
    pub target: String,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataChange {
    pub path: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
}

/// The inode/name plan computed by the herd's diff engine, applied by
/// the sub in step order: directories, file writes, symlinks, metadata,
/// deletions, triggers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub image_name: String,
    pub directories_to_make: Vec<DirectoryToMake>,
    pub files_to_write: Vec<FileToWrite>,
    pub symlinks_to_make: Vec<SymlinkToMake>,
    pub inodes_to_change: Vec<MetadataChange>,
    pub paths_to_delete: Vec<String>,
    pub triggers: Vec<Trigger>,
}

impl UpdateRequest {
    /// Whether the plan performs no filesystem change at all.
    pub fn is_empty(&self) -> bool {
        self.directories_to_make.is_empty()
            && self.files_to_write.is_empty()
            && self.symlinks_to_make.is_empty()
            && self.inodes_to_change.is_empty()
            && self.paths_to_delete.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct UpdateResponse {}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct GetConfigurationRequest {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetConfigurationResponse {
    /// Hashing rate limit as a percentage of the measured speed.
    pub hash_speed_percent: u8,
    /// Network speed the rate governor was initialized from, bytes per
    /// second; zero if never measured.
    pub network_speed: u64,
    pub scan_exclusion_list: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupRequest {
    /// Object-cache entries the herd no longer needs this sub to hold.
    pub hashes: Vec<ObjectHash>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct CleanupResponse {}
