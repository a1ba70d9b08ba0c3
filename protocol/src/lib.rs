// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request and response types for the platform's RPC surfaces. This crate
//! holds wire types only; the services implementing them live in their
//! own crates.

pub mod dominator;
pub mod image_server;
pub mod object_server;
pub mod subd;
