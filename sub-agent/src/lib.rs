// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sub agent: scans the local filesystem, fetches missing objects on
//! the herd's request and applies update plans, exporting all of it over
//! RPC.
//!
//! Locking: admission to Fetch and Update is decided by in-progress
//! flags under one mutex, giving fast distinct rejections. The actual
//! work is ordered by a read-write lock: an update holds it in write
//! mode for the whole plan, scans and fetches hold it in read mode, so a
//! scan can never observe a partially-applied update.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use herd_common::ObjectHash;
use herd_filesystem::FileSystem;
use object_store::ObjectStore;
use regex::Regex;
use serde::Deserialize;
use slog::{info, o, Logger};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

pub mod fetch;
pub mod rate_limiter;
pub mod rpcd;
pub mod scanner;
pub mod update;

pub use rate_limiter::RateLimiter;

const NETBENCH_FILE: &str = "netbench";

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: herd_common::logging::LoggingConfig,
    /// Root of the managed tree.
    pub root_dir: Utf8PathBuf,
    /// Agent-owned state: the object cache lives at `<data_dir>/objects`
    /// and the persisted network benchmark at `<data_dir>/netbench`.
    pub data_dir: Utf8PathBuf,
    pub listen_address: String,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_hash_speed_percent")]
    pub hash_speed_percent: u8,
    /// Anchored regexes over managed paths to skip entirely while
    /// scanning.
    #[serde(default)]
    pub scan_exclusion_list: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
    /// Debugging aid: any fetch failure exits the process.
    #[serde(default)]
    pub exit_on_fetch_failure: bool,
}

fn default_scan_interval_secs() -> u64 {
    60
}

fn default_hash_speed_percent() -> u8 {
    60
}

impl Config {
    pub fn object_dir(&self) -> Utf8PathBuf {
        self.data_dir.join("objects")
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("invalid scan exclusion `{line}`")]
    InvalidExclusion {
        line: String,
        #[source]
        source: regex::Error,
    },

    #[error("opening object cache")]
    ObjectCache(#[from] object_store::store::Error),
}

#[derive(Default)]
struct ExclusionFlags {
    fetch_in_progress: bool,
    update_in_progress: bool,
}

/// Output of the most recent scan, served to Poll.
#[derive(Default)]
struct ScanState {
    file_system: Option<Arc<FileSystem>>,
    tree_hash: Option<ObjectHash>,
    object_cache: Vec<ObjectHash>,
    generation: u64,
    last_error: String,
}

/// State shared by the RPC methods, the scanner loop and the background
/// fetch/update tasks.
pub struct SubState {
    config: Config,
    log: Logger,
    exclusions: Vec<Regex>,
    flags: Mutex<ExclusionFlags>,
    work_lock: RwLock<()>,
    scan: Mutex<ScanState>,
    object_cache: ObjectStore,
    rate_limiter: RateLimiter,
    network_speed: AtomicU64,
    last_fetch_error: Mutex<String>,
    last_update_error: Mutex<String>,
    rescan_tx: mpsc::Sender<()>,
}

impl SubState {
    /// Build the shared state and the receiver the scanner loop drains
    /// for prompt-rescan requests.
    pub async fn new(
        config: Config,
        log: &Logger,
    ) -> Result<(Arc<SubState>, mpsc::Receiver<()>), StartError> {
        let log = log.new(o!("component" => "sub-agent"));
        let exclusions = config
            .scan_exclusion_list
            .iter()
            .map(|line| {
                Regex::new(&format!("^(?:{})$", line)).map_err(|source| {
                    StartError::InvalidExclusion { line: line.clone(), source }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let object_cache = ObjectStore::open(&config.object_dir(), &log).await?;

        let network_speed = read_netbench(&config.data_dir).unwrap_or(0);
        let rate_limiter = RateLimiter::new(scaled_speed(
            network_speed,
            config.hash_speed_percent,
        ));
        if network_speed > 0 {
            info!(log, "restored measured network speed";
                "bytes_per_sec" => network_speed);
        }

        let (rescan_tx, rescan_rx) = mpsc::channel(1);
        let state = Arc::new(SubState {
            config,
            log,
            exclusions,
            flags: Mutex::default(),
            work_lock: RwLock::new(()),
            scan: Mutex::default(),
            object_cache,
            rate_limiter,
            network_speed: AtomicU64::new(network_speed),
            last_fetch_error: Mutex::new(String::new()),
            last_update_error: Mutex::new(String::new()),
            rescan_tx,
        });
        Ok((state, rescan_rx))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn object_cache(&self) -> &ObjectStore {
        &self.object_cache
    }

    fn set_network_speed(&self, bytes_per_sec: u64) {
        self.network_speed.store(bytes_per_sec, Ordering::Relaxed);
        self.rate_limiter.set_speed(scaled_speed(
            bytes_per_sec,
            self.config.hash_speed_percent,
        ));
        if let Err(err) = write_netbench(&self.config.data_dir, bytes_per_sec) {
            slog::warn!(self.log, "failed to persist network benchmark";
                "error" => %err);
        }
    }

    pub fn network_speed(&self) -> u64 {
        self.network_speed.load(Ordering::Relaxed)
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Ask the scanner loop for a prompt rescan (e.g. after a fetch
    /// changed the object cache). Lossy: a pending request is enough.
    pub fn request_rescan(&self) {
        let _ = self.rescan_tx.try_send(());
    }
}

fn scaled_speed(bytes_per_sec: u64, percent: u8) -> u64 {
    bytes_per_sec / 100 * u64::from(percent)
}

fn read_netbench(data_dir: &Utf8Path) -> Option<u64> {
    let contents = std::fs::read_to_string(data_dir.join(NETBENCH_FILE)).ok()?;
    contents.trim().parse().ok()
}

fn write_netbench(data_dir: &Utf8Path, bytes_per_sec: u64) -> std::io::Result<()> {
    std::fs::write(data_dir.join(NETBENCH_FILE), format!("{}\n", bytes_per_sec))
}
