// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The herd: the central authority driving a population of subs toward
//! their required images. It polls each sub on a schedule, diffs the
//! reported tree against the required image, directs fetches of missing
//! objects and dispatches update plans.

use std::time::Duration;

use serde::Deserialize;

pub mod diff;
pub mod herd;
pub mod images;
pub mod mdb;
pub mod rpcd;
pub mod scheduler;
pub mod sub;

pub use herd::Herd;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: herd_common::logging::LoggingConfig,
    /// Address serving images; the colocated object service is assumed
    /// to live at `object_server_address`.
    pub image_server_address: String,
    /// Address subs are told to fetch objects from.
    pub object_server_address: String,
    /// JSON machine database file; watched for changes.
    pub mdb_file: camino::Utf8PathBuf,
    /// Admin RPC listen address.
    pub listen_address: String,
    /// Port subs listen on; appended to MDB hostnames that carry no
    /// explicit port.
    #[serde(default = "default_sub_port")]
    pub sub_port: u16,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
}

fn default_sub_port() -> u16 {
    6969
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_max_workers() -> usize {
    10
}

fn default_max_concurrent_fetches() -> usize {
    5
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// The dial address for a sub: MDB hostnames may carry an explicit
    /// port, otherwise the configured one is appended.
    pub fn sub_address(&self, hostname: &str) -> String {
        if hostname.contains(':') {
            hostname.to_string()
        } else {
            format!("{}:{}", hostname, self.sub_port)
        }
    }
}
