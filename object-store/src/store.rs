// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-disk object storage.
//!
//! Writes go to a temporary file under `<root>/tmp` and are renamed into
//! their final fan-out path once complete, so a reader never observes a
//! partial object. The store does not fsync: durability is best-effort
//! relative to the filesystem's crash semantics. Concurrent adds of the
//! same content are allowed; the in-memory index decides which caller is
//! reported as having added the object.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::{NamedUtf8TempFile, Utf8TempPath};
use herd_common::ObjectHash;
use sha2::{Digest, Sha512};
use slog::{info, o, warn, Logger};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::fs::OpenOptions;

use crate::hash_relative_path;

const TEMP_SUBDIR: &str = "tmp";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object {0} not found")]
    NotFound(ObjectHash),

    #[error("digest mismatch: expected {expected}, actual {actual}")]
    HashMismatch { expected: ObjectHash, actual: ObjectHash },

    #[error("content truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: u64, got: u64 },

    #[error("failed to {verb} `{path}`")]
    File {
        verb: &'static str,
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to rename `{from}` to `{to}`")]
    Rename {
        from: Utf8PathBuf,
        to: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("blocking task failed")]
    Join(#[from] tokio::task::JoinError),
}

/// Content-addressed local storage for objects.
pub struct ObjectStore {
    root: Utf8PathBuf,
    log: Logger,
    index: Mutex<BTreeMap<ObjectHash, u64>>,
    temp_sequence: AtomicU64,
}

impl ObjectStore {
    /// Open the store rooted at `root`, creating it if needed and
    /// reconstructing the in-memory index from the directory layout.
    /// Stale temporary files from a previous crash are removed.
    pub async fn open(root: &Utf8Path, log: &Logger) -> Result<ObjectStore, Error> {
        let log = log.new(o!("component" => "object-store"));
        create_dir_all(root).await?;
        let temp_dir = root.join(TEMP_SUBDIR);
        if let Err(err) = tokio::fs::remove_dir_all(&temp_dir).await {
            if err.kind() != ErrorKind::NotFound {
                warn!(log, "failed to remove stale temporary objects";
                    "path" => temp_dir.as_str(), "error" => %err);
            }
        }
        create_dir_all(&temp_dir).await?;
        let index = scan_index(root, &log).await?;
        info!(log, "opened object store";
            "root" => root.as_str(), "objects" => index.len());
        Ok(ObjectStore {
            root: root.to_path_buf(),
            log,
            index: Mutex::new(index),
            temp_sequence: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn object_count(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    /// Every hash currently held, in sorted order.
    pub fn all_hashes(&self) -> Vec<ObjectHash> {
        self.index.lock().unwrap().keys().copied().collect()
    }

    /// Size of the named object, or `None` if absent.
    pub fn size_of(&self, hash: &ObjectHash) -> Option<u64> {
        self.index.lock().unwrap().get(hash).copied()
    }

    /// Sizes of the named objects in request order; zero means absent.
    pub fn check_objects(&self, hashes: &[ObjectHash]) -> Vec<u64> {
        let index = self.index.lock().unwrap();
        hashes.iter().map(|hash| index.get(hash).copied().unwrap_or(0)).collect()
    }

    /// Read exactly `length` bytes of content from `reader` and store
    /// them. Returns the content hash and whether this call added the
    /// object (false with no error means it was already present).
    ///
    /// The body is always consumed in full, even when the object turns
    /// out to be a duplicate, so streaming callers stay framed.
    pub async fn add_object<R>(
        &self,
        length: u64,
        expected_hash: Option<ObjectHash>,
        reader: &mut R,
    ) -> Result<(ObjectHash, bool), Error>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let sequence = self.temp_sequence.fetch_add(1, Ordering::Relaxed);
        let temp_path = Utf8TempPath::from_path(self.root.join(TEMP_SUBDIR).join(
            format!("add.{}.{}", std::process::id(), sequence),
        ));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
            .map_err(|err| Error::File {
                verb: "create",
                path: temp_path.to_path_buf(),
                err,
            })?;
        let mut file = NamedUtf8TempFile::from_parts(file, temp_path);

        let mut hasher = Sha512::new();
        let mut copied = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        while copied < length {
            let want = buf.len().min((length - copied) as usize);
            let n = reader.read(&mut buf[..want]).await.map_err(|err| Error::File {
                verb: "read content for",
                path: file.path().to_path_buf(),
                err,
            })?;
            if n == 0 {
                return Err(Error::Truncated { expected: length, got: copied });
            }
            hasher.update(&buf[..n]);
            file.as_file_mut().write_all(&buf[..n]).await.map_err(|err| {
                Error::File {
                    verb: "write to",
                    path: file.path().to_path_buf(),
                    err,
                }
            })?;
            copied += n as u64;
        }
        let hash = ObjectHash::from_hasher(hasher);
        if let Some(expected) = expected_hash {
            if expected != hash {
                return Err(Error::HashMismatch { expected, actual: hash });
            }
        }
        if self.index.lock().unwrap().contains_key(&hash) {
            // Duplicate; the temporary file is discarded on drop.
            return Ok((hash, false));
        }

        file.as_file_mut().flush().await.map_err(|err| Error::File {
            verb: "flush",
            path: file.path().to_path_buf(),
            err,
        })?;
        let final_path = self.root.join(hash_relative_path(&hash));
        if let Some(parent) = final_path.parent() {
            create_dir_all(parent).await?;
        }
        let moved_final_path = final_path.clone();
        tokio::task::spawn_blocking(move || file.persist(&moved_final_path))
            .await?
            .map_err(|err| Error::Rename {
                from: err.file.path().to_path_buf(),
                to: final_path,
                err: err.error,
            })?;
        let added = self.index.lock().unwrap().insert(hash, length).is_none();
        if added {
            info!(self.log, "stored object"; "hash" => %hash, "length" => length);
        }
        Ok((hash, added))
    }

    /// Remove the named object. Returns whether it was present.
    pub async fn remove_object(&self, hash: &ObjectHash) -> Result<bool, Error> {
        if self.index.lock().unwrap().remove(hash).is_none() {
            return Ok(false);
        }
        let path = self.root.join(hash_relative_path(hash));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
            Err(err) => Err(Error::File { verb: "remove", path, err }),
        }
    }

    /// Open the named object for reading. Returns its size and the open
    /// file.
    pub async fn open_object(
        &self,
        hash: &ObjectHash,
    ) -> Result<(u64, tokio::fs::File), Error> {
        let Some(size) = self.size_of(hash) else {
            return Err(Error::NotFound(*hash));
        };
        let path = self.root.join(hash_relative_path(hash));
        let file = tokio::fs::File::open(&path).await.map_err(|err| Error::File {
            verb: "open",
            path,
            err,
        })?;
        Ok((size, file))
    }
}

async fn create_dir_all(path: &Utf8Path) -> Result<(), Error> {
    tokio::fs::create_dir_all(path).await.map_err(|err| Error::File {
        verb: "create",
        path: path.to_path_buf(),
        err,
    })
}

/// Walk the two fan-out levels and rebuild the `hash -> size` index.
/// Entries that do not look like object paths are ignored with a
/// warning.
async fn scan_index(
    root: &Utf8Path,
    log: &Logger,
) -> Result<BTreeMap<ObjectHash, u64>, Error> {
    let mut index = BTreeMap::new();
    let mut levels = read_dir_names(root).await?;
    levels.retain(|name| name.as_str() != TEMP_SUBDIR);
    for first in levels {
        if !is_hex_pair(&first) {
            warn!(log, "ignoring stray entry in object store"; "name" => &first);
            continue;
        }
        let first_path = root.join(&first);
        for second in read_dir_names(&first_path).await? {
            if !is_hex_pair(&second) {
                warn!(log, "ignoring stray entry in object store";
                    "name" => format!("{}/{}", first, second));
                continue;
            }
            let second_path = first_path.join(&second);
            for name in read_dir_names(&second_path).await? {
                let Ok(hash) = name.parse::<ObjectHash>() else {
                    warn!(log, "ignoring stray entry in object store";
                        "name" => format!("{}/{}/{}", first, second, name));
                    continue;
                };
                let path = second_path.join(&name);
                let metadata =
                    tokio::fs::metadata(&path).await.map_err(|err| Error::File {
                        verb: "stat",
                        path: path.clone(),
                        err,
                    })?;
                index.insert(hash, metadata.len());
            }
        }
    }
    Ok(index)
}

async fn read_dir_names(path: &Utf8Path) -> Result<Vec<String>, Error> {
    let mut names = Vec::new();
    let mut read_dir = tokio::fs::read_dir(path).await.map_err(|err| Error::File {
        verb: "read",
        path: path.to_path_buf(),
        err,
    })?;
    while let Some(entry) = read_dir.next_entry().await.map_err(|err| Error::File {
        verb: "read",
        path: path.to_path_buf(),
        err,
    })? {
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    Ok(names)
}

fn is_hex_pair(name: &str) -> bool {
    name.len() == 2 && name.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

#[cfg(test)]
mod test {
    use herd_common::logging::test_logger;
    use herd_common::ObjectHash;
    use tokio::io::AsyncReadExt;

    use super::{Error, ObjectStore};

    async fn read_back(store: &ObjectStore, hash: &ObjectHash) -> Vec<u8> {
        let (size, mut file) = store.open_object(hash).await.unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).await.unwrap();
        assert_eq!(content.len() as u64, size);
        content
    }

    #[tokio::test]
    async fn add_get_check_round_trip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path(), &test_logger()).await.unwrap();

        let content = b"some file content\n";
        let (hash, added) = store
            .add_object(content.len() as u64, None, &mut &content[..])
            .await
            .unwrap();
        assert!(added);
        assert_eq!(hash, ObjectHash::of(content));
        assert_eq!(read_back(&store, &hash).await, content);
        assert_eq!(store.check_objects(&[hash]), vec![content.len() as u64]);

        // A second add of the same content is idempotent.
        let (hash2, added) = store
            .add_object(content.len() as u64, Some(hash), &mut &content[..])
            .await
            .unwrap();
        assert_eq!(hash2, hash);
        assert!(!added);
    }

    #[tokio::test]
    async fn missing_object() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path(), &test_logger()).await.unwrap();
        let absent = ObjectHash::of(b"never stored");
        assert!(matches!(
            store.open_object(&absent).await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(store.check_objects(&[absent]), vec![0]);
    }

    #[tokio::test]
    async fn hash_mismatch_stores_nothing() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path(), &test_logger()).await.unwrap();
        let content = b"actual content";
        let wrong = ObjectHash::of(b"something else");
        let err = store
            .add_object(content.len() as u64, Some(wrong), &mut &content[..])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));
        assert_eq!(store.object_count(), 0);
        assert!(store.size_of(&ObjectHash::of(content)).is_none());
    }

    #[tokio::test]
    async fn truncated_content_stores_nothing() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path(), &test_logger()).await.unwrap();
        let content = b"short";
        let err = store
            .add_object(content.len() as u64 + 1, None, &mut &content[..])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
        assert_eq!(store.object_count(), 0);
    }

    #[tokio::test]
    async fn index_survives_restart() {
        let dir = camino_tempfile::tempdir().unwrap();
        let content = b"persisted across restart";
        let hash = {
            let store = ObjectStore::open(dir.path(), &test_logger()).await.unwrap();
            let (hash, _) = store
                .add_object(content.len() as u64, None, &mut &content[..])
                .await
                .unwrap();
            hash
        };
        let store = ObjectStore::open(dir.path(), &test_logger()).await.unwrap();
        assert_eq!(store.object_count(), 1);
        assert_eq!(read_back(&store, &hash).await, content);
    }

    #[tokio::test]
    async fn concurrent_adds_of_identical_content() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(
            ObjectStore::open(dir.path(), &test_logger()).await.unwrap(),
        );
        let content = b"raced content";
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let store = std::sync::Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store
                    .add_object(content.len() as u64, None, &mut &content[..])
                    .await
                    .unwrap()
            }));
        }
        let mut added_count = 0;
        for task in tasks {
            let (hash, added) = task.await.unwrap();
            assert_eq!(hash, ObjectHash::of(content));
            if added {
                added_count += 1;
            }
        }
        assert_eq!(added_count, 1);
        assert_eq!(read_back(&store, &ObjectHash::of(content)).await, content);
    }
}
