// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The content-addressed blob store and its RPC surface.
//!
//! Objects are immutable blobs identified by the SHA-512 of their
//! content and stored at `<root>/AB/CD/<hex>` where `AB` and `CD` are
//! the first two byte pairs of the 128-character lowercase hex digest.
//! Reference counting is not maintained; garbage collection is an
//! offline concern.

use camino::Utf8PathBuf;
use herd_common::ObjectHash;

pub mod client;
pub mod queue;
pub mod rpcd;
pub mod store;

pub use client::{ClientError, ObjectClient, ObjectsReader};
pub use queue::ObjectAdderQueue;
pub use store::ObjectStore;

/// Relative path of an object beneath the store root (or a sub's object
/// cache directory): two fan-out levels, then the full digest.
pub fn hash_relative_path(hash: &ObjectHash) -> Utf8PathBuf {
    let hex = hash.to_string();
    let mut path = Utf8PathBuf::from(&hex[0..2]);
    path.push(&hex[2..4]);
    path.push(&hex);
    path
}

#[cfg(test)]
mod test {
    use herd_common::ObjectHash;

    #[test]
    fn fan_out_layout() {
        let hash = ObjectHash::of(b"x");
        let hex = hash.to_string();
        let path = super::hash_relative_path(&hash);
        assert_eq!(path.as_str(), format!("{}/{}/{}", &hex[0..2], &hex[2..4], hex));
    }
}
