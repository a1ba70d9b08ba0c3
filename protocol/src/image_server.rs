// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The image server's RPC surface.

use herd_image::Image;
use serde::{Deserialize, Serialize};

pub const ADD_IMAGE: &str = "ImageServer.AddImage";
pub const GET_IMAGE: &str = "ImageServer.GetImage";
pub const CHECK_IMAGE: &str = "ImageServer.CheckImage";
pub const LIST_IMAGES: &str = "ImageServer.ListImages";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddImageRequest {
    pub name: String,
    pub image: Image,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct AddImageResponse {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetImageRequest {
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetImageResponse {
    /// `None` if no image has this name.
    pub image: Option<Image>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckImageRequest {
    pub name: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CheckImageResponse {
    pub exists: bool,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ListImagesRequest {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListImagesResponse {
    pub names: Vec<String>,
}
