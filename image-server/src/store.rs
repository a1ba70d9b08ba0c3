// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Image persistence.
//!
//! Each image lives in one flat file named after the image, serialized
//! with the binary codec. Writes go through a temporary file and a
//! rename. Startup rescans the directory, so a restart loses nothing.

use std::collections::BTreeSet;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempPath;
use herd_common::ObjectHash;
use herd_image::{Image, ImageError, LoadedImage};
use object_store::ObjectStore;
use slog::{info, o, warn, Logger};
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid image name `{0}`")]
    InvalidName(String),

    #[error("image `{0}` already exists")]
    AlreadyExists(String),

    #[error("image references object {0} not present in the object store")]
    MissingObject(ObjectHash),

    #[error("malformed image")]
    Malformed(#[from] ImageError),

    #[error("failed to encode image: {0}")]
    Encode(String),

    #[error("failed to decode image `{name}`: {detail}")]
    Decode { name: String, detail: String },

    #[error("failed to {verb} `{path}`")]
    File {
        verb: &'static str,
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

pub struct ImageStore {
    dir: Utf8PathBuf,
    log: Logger,
    names: Mutex<BTreeSet<String>>,
}

impl ImageStore {
    /// Open the store, creating the directory if needed and indexing the
    /// images already present.
    pub async fn open(dir: &Utf8Path, log: &Logger) -> Result<ImageStore, Error> {
        let log = log.new(o!("component" => "image-store"));
        tokio::fs::create_dir_all(dir).await.map_err(|err| Error::File {
            verb: "create",
            path: dir.to_path_buf(),
            err,
        })?;
        let mut names = BTreeSet::new();
        let mut read_dir =
            tokio::fs::read_dir(dir).await.map_err(|err| Error::File {
                verb: "read",
                path: dir.to_path_buf(),
                err,
            })?;
        while let Some(entry) =
            read_dir.next_entry().await.map_err(|err| Error::File {
                verb: "read",
                path: dir.to_path_buf(),
                err,
            })?
        {
            match entry.file_name().into_string() {
                Ok(name) if valid_image_name(&name) => {
                    names.insert(name);
                }
                Ok(name) => {
                    warn!(log, "ignoring stray entry in image directory";
                        "name" => name);
                }
                Err(_) => {
                    warn!(log, "ignoring non-UTF-8 entry in image directory");
                }
            }
        }
        info!(log, "opened image store";
            "dir" => dir.as_str(), "images" => names.len());
        Ok(ImageStore { dir: dir.to_path_buf(), log, names: Mutex::new(names) })
    }

    pub fn list_images(&self) -> Vec<String> {
        self.names.lock().unwrap().iter().cloned().collect()
    }

    pub fn check_image(&self, name: &str) -> bool {
        self.names.lock().unwrap().contains(name)
    }

    /// Validate and persist a new image. Rejects duplicate names,
    /// images whose filter or triggers do not compile, and images
    /// referencing objects absent from `objects`.
    pub async fn add_image(
        &self,
        name: &str,
        image: Image,
        objects: &ObjectStore,
    ) -> Result<(), Error> {
        if !valid_image_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        }
        if self.check_image(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        // Compiling also proves the tree is internally consistent.
        LoadedImage::new(image.clone())?;
        for hash in image.filesystem.object_hashes() {
            if objects.size_of(&hash).is_none() {
                return Err(Error::MissingObject(hash));
            }
        }

        let mut encoded = Vec::new();
        ciborium::into_writer(&image, &mut encoded)
            .map_err(|err| Error::Encode(err.to_string()))?;
        let temp_path = Utf8TempPath::from_path(
            self.dir.join(format!(".add.{}.{}", std::process::id(), name)),
        );
        let mut file = tokio::fs::File::create(&temp_path).await.map_err(|err| {
            Error::File { verb: "create", path: temp_path.to_path_buf(), err }
        })?;
        file.write_all(&encoded).await.map_err(|err| Error::File {
            verb: "write to",
            path: temp_path.to_path_buf(),
            err,
        })?;
        file.flush().await.map_err(|err| Error::File {
            verb: "flush",
            path: temp_path.to_path_buf(),
            err,
        })?;
        drop(file);
        let final_path = self.dir.join(name);
        temp_path.persist(&final_path).map_err(|err| Error::File {
            verb: "rename into",
            path: final_path.clone(),
            err: err.error,
        })?;

        let mut names = self.names.lock().unwrap();
        if !names.insert(name.to_string()) {
            // A racing add beat us to the rename; both wrote the same
            // name, the later rename won.
            return Err(Error::AlreadyExists(name.to_string()));
        }
        drop(names);
        info!(self.log, "added image"; "name" => name);
        Ok(())
    }

    /// Load the named image, or `None` if absent.
    pub async fn get_image(&self, name: &str) -> Result<Option<Image>, Error> {
        if !self.check_image(name) {
            return Ok(None);
        }
        let path = self.dir.join(name);
        let encoded = tokio::fs::read(&path).await.map_err(|err| Error::File {
            verb: "read",
            path,
            err,
        })?;
        let image = ciborium::from_reader(encoded.as_slice()).map_err(|err| {
            Error::Decode { name: name.to_string(), detail: err.to_string() }
        })?;
        Ok(Some(image))
    }
}

/// Flat names only: no path separators, no leading dot, nothing the
/// filesystem would mangle.
fn valid_image_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'))
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use herd_common::logging::test_logger;
    use herd_common::ObjectHash;
    use herd_filesystem::{Directory, File, FileSystem, Inode};
    use herd_image::{Filter, Image};
    use object_store::ObjectStore;

    use super::{Error, ImageStore};

    fn image_with_one_file(content: &[u8]) -> Image {
        let mut inode_table = BTreeMap::new();
        inode_table.insert(
            1,
            Inode {
                mode: libc::S_IFDIR as u32 | 0o755,
                uid: 0,
                gid: 0,
                mtime: 0,
                size: 0,
                symlink_target: None,
                hash: None,
            },
        );
        inode_table.insert(
            2,
            Inode {
                mode: libc::S_IFREG as u32 | 0o644,
                uid: 0,
                gid: 0,
                mtime: 0,
                size: content.len() as u64,
                symlink_target: None,
                hash: Some(ObjectHash::of(content)),
            },
        );
        let mut root = Directory::new("", 1);
        root.files.push(File { name: "a".to_string(), inode: 2 });
        Image {
            filesystem: FileSystem { dev: 1, inode_table, root },
            filter: Filter::default(),
            triggers: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn add_get_list_round_trip() {
        let image_dir = camino_tempfile::tempdir().unwrap();
        let object_dir = camino_tempfile::tempdir().unwrap();
        let log = test_logger();
        let objects = ObjectStore::open(object_dir.path(), &log).await.unwrap();
        let images = ImageStore::open(image_dir.path(), &log).await.unwrap();

        let content = b"image payload";
        objects
            .add_object(content.len() as u64, None, &mut &content[..])
            .await
            .unwrap();

        let image = image_with_one_file(content);
        images.add_image("base-1.0", image.clone(), &objects).await.unwrap();
        assert_eq!(images.list_images(), vec!["base-1.0".to_string()]);
        let loaded = images.get_image("base-1.0").await.unwrap().unwrap();
        assert_eq!(loaded.filesystem, image.filesystem);

        assert!(matches!(
            images.add_image("base-1.0", image, &objects).await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn rejects_image_with_missing_objects() {
        let image_dir = camino_tempfile::tempdir().unwrap();
        let object_dir = camino_tempfile::tempdir().unwrap();
        let log = test_logger();
        let objects = ObjectStore::open(object_dir.path(), &log).await.unwrap();
        let images = ImageStore::open(image_dir.path(), &log).await.unwrap();

        let image = image_with_one_file(b"never uploaded");
        match images.add_image("broken", image, &objects).await {
            Err(Error::MissingObject(hash)) => {
                assert_eq!(hash, ObjectHash::of(b"never uploaded"))
            }
            other => panic!("expected missing-object error, got {:?}", other),
        }
        assert!(images.list_images().is_empty());
        assert!(images.get_image("broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_bad_names() {
        let image_dir = camino_tempfile::tempdir().unwrap();
        let object_dir = camino_tempfile::tempdir().unwrap();
        let log = test_logger();
        let objects = ObjectStore::open(object_dir.path(), &log).await.unwrap();
        let images = ImageStore::open(image_dir.path(), &log).await.unwrap();
        for name in ["", "../escape", "a/b", ".hidden"] {
            assert!(matches!(
                images
                    .add_image(name, image_with_one_file(b"x"), &objects)
                    .await,
                Err(Error::InvalidName(_))
            ));
        }
    }

    #[tokio::test]
    async fn index_survives_restart() {
        let image_dir = camino_tempfile::tempdir().unwrap();
        let object_dir = camino_tempfile::tempdir().unwrap();
        let log = test_logger();
        let objects = ObjectStore::open(object_dir.path(), &log).await.unwrap();
        let content = b"durable";
        objects
            .add_object(content.len() as u64, None, &mut &content[..])
            .await
            .unwrap();
        {
            let images = ImageStore::open(image_dir.path(), &log).await.unwrap();
            images
                .add_image("keeper", image_with_one_file(content), &objects)
                .await
                .unwrap();
        }
        let images = ImageStore::open(image_dir.path(), &log).await.unwrap();
        assert!(images.check_image("keeper"));
        assert!(images.get_image("keeper").await.unwrap().is_some());
    }
}
