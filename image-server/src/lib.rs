// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The image server: named, immutable images persisted as flat files,
//! served over RPC alongside a colocated object store. An image is only
//! accepted once every object it references is present in that store.

use serde::Deserialize;

pub mod rpcd;
pub mod store;

pub use store::ImageStore;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: herd_common::logging::LoggingConfig,
    pub image_dir: camino::Utf8PathBuf,
    pub object_dir: camino::Utf8PathBuf,
    pub listen_address: String,
}
