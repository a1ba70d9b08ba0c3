// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The image cache.
//!
//! Loaded images are shared across every worker that targets them. Each
//! name has its own async mutex, so concurrent workers wanting the same
//! image coalesce into one load while loads of different images proceed
//! in parallel. A failed load leaves the slot empty and the next caller
//! retries. Eviction is reference-based: after a fleet update, any image
//! no sub requires or plans is dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::Mutex;

use herd_image::{ImageError, LoadedImage};
use herd_protocol::image_server::{GetImageRequest, GetImageResponse, GET_IMAGE};
use slog::{info, o, Logger};

#[derive(Debug, thiserror::Error)]
pub enum ImageLoadError {
    #[error("image server unreachable")]
    Rpc(#[from] srpc::Error),

    #[error("image failed validation")]
    Invalid(#[from] ImageError),
}

type Slot = Arc<tokio::sync::Mutex<Option<Arc<LoadedImage>>>>;

pub struct ImageCache {
    log: Logger,
    image_server_address: String,
    entries: Mutex<BTreeMap<String, Slot>>,
}

impl ImageCache {
    pub fn new(image_server_address: &str, log: &Logger) -> ImageCache {
        ImageCache {
            log: log.new(o!("component" => "image-cache")),
            image_server_address: image_server_address.to_string(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Fetch the named image from the cache, loading it from the image
    /// server at most once concurrently per name. `Ok(None)` means the
    /// server has no such image.
    pub async fn get(
        &self,
        name: &str,
    ) -> Result<Option<Arc<LoadedImage>>, ImageLoadError> {
        let slot = {
            let mut entries = self.entries.lock().unwrap();
            Arc::clone(entries.entry(name.to_string()).or_default())
        };
        let mut guard = slot.lock().await;
        if let Some(image) = &*guard {
            return Ok(Some(Arc::clone(image)));
        }
        let mut client = srpc::Client::dial(&self.image_server_address).await?;
        let response: GetImageResponse = client
            .request_reply(GET_IMAGE, &GetImageRequest { name: name.to_string() })
            .await?;
        let Some(image) = response.image else {
            return Ok(None);
        };
        let loaded = Arc::new(LoadedImage::new(image)?);
        info!(self.log, "loaded image"; "name" => name,
            "content_hash" => %loaded.content_hash);
        *guard = Some(Arc::clone(&loaded));
        Ok(Some(loaded))
    }

    /// Drop every cached image not in `referenced`.
    pub fn retain(&self, referenced: &BTreeSet<String>) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|name, _| referenced.contains(name));
    }

    pub fn cached_names(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }
}
