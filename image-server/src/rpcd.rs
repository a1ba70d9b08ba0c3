// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RPC methods exported by the image server.

use std::sync::Arc;

use async_trait::async_trait;
use herd_protocol::image_server::{
    AddImageRequest, AddImageResponse, CheckImageRequest, CheckImageResponse,
    GetImageRequest, GetImageResponse, ListImagesRequest, ListImagesResponse,
    ADD_IMAGE, CHECK_IMAGE, GET_IMAGE, LIST_IMAGES,
};
use object_store::ObjectStore;
use slog::{o, warn, Logger};
use srpc::{MethodHandler, Server, ServerConn};

use crate::store::ImageStore;

/// Register every image-server method on `server`.
pub fn register(
    server: &mut Server,
    images: &Arc<ImageStore>,
    objects: &Arc<ObjectStore>,
    log: &Logger,
) {
    let log = log.new(o!("component" => "image-rpcd"));
    server.register(
        ADD_IMAGE,
        Arc::new(AddImage {
            images: Arc::clone(images),
            objects: Arc::clone(objects),
            log,
        }),
    );
    server.register(GET_IMAGE, Arc::new(GetImage { images: Arc::clone(images) }));
    server
        .register(CHECK_IMAGE, Arc::new(CheckImage { images: Arc::clone(images) }));
    server
        .register(LIST_IMAGES, Arc::new(ListImages { images: Arc::clone(images) }));
}

struct AddImage {
    images: Arc<ImageStore>,
    objects: Arc<ObjectStore>,
    log: Logger,
}

#[async_trait]
impl MethodHandler for AddImage {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), srpc::Error> {
        let request: AddImageRequest = conn.decode().await?;
        match self
            .images
            .add_image(&request.name, request.image, &self.objects)
            .await
        {
            Ok(()) => conn.reply_ok(&AddImageResponse {}).await,
            Err(err) => {
                warn!(self.log, "AddImage failed";
                    "name" => &request.name, "error" => %err);
                conn.reply_error(&err.to_string()).await
            }
        }
    }
}

struct GetImage {
    images: Arc<ImageStore>,
}

#[async_trait]
impl MethodHandler for GetImage {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), srpc::Error> {
        let request: GetImageRequest = conn.decode().await?;
        match self.images.get_image(&request.name).await {
            Ok(image) => conn.reply_ok(&GetImageResponse { image }).await,
            Err(err) => conn.reply_error(&err.to_string()).await,
        }
    }
}

struct CheckImage {
    images: Arc<ImageStore>,
}

#[async_trait]
impl MethodHandler for CheckImage {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), srpc::Error> {
        let request: CheckImageRequest = conn.decode().await?;
        conn.reply_ok(&CheckImageResponse {
            exists: self.images.check_image(&request.name),
        })
        .await
    }
}

struct ListImages {
    images: Arc<ImageStore>,
}

#[async_trait]
impl MethodHandler for ListImages {
    async fn handle(&self, conn: &mut ServerConn<'_>) -> Result<(), srpc::Error> {
        let _request: ListImagesRequest = conn.decode().await?;
        conn.reply_ok(&ListImagesResponse { names: self.images.list_images() }).await
    }
}
