// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The filesystem scanner.
//!
//! Walks the managed tree rooted at a configured path, producing the
//! canonical [`FileSystem`] model: directory entries sorted by name,
//! hard links deduplicated by inode number, regular-file content hashed
//! at most once per inode through the rate-limited reader. Entries on
//! other devices are ignored; entries that vanish mid-scan are skipped
//! (the scan is a best-effort snapshot); hard-linked directories fail
//! the scan.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read};
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use herd_common::ObjectHash;
use herd_filesystem::{join_path, Directory, File, FileSystem, Inode};
use regex::Regex;
use sha2::{Digest, Sha512};
use slog::{debug, o, warn};
use tokio::sync::mpsc;

use crate::rate_limiter::{Pacer, RateLimiter};
use crate::SubState;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("hardlinked directory: {0}")]
    HardlinkedDirectory(String),

    #[error("failed to {verb} `{path}`")]
    File {
        verb: &'static str,
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// Walk the tree rooted at `root`. `skip_path` names one on-disk
/// directory left out entirely (the agent's own data directory);
/// `exclusions` are anchored regexes over tree paths.
pub fn walk(
    root: &Utf8Path,
    skip_path: Option<&Utf8Path>,
    exclusions: &[Regex],
    limiter: &RateLimiter,
) -> Result<FileSystem, ScanError> {
    let metadata = std::fs::metadata(root).map_err(|err| ScanError::File {
        verb: "stat",
        path: root.to_path_buf(),
        err,
    })?;
    let mut scanner = Scanner {
        dev: metadata.dev(),
        inode_table: BTreeMap::new(),
        skip_path,
        exclusions,
        pacer: limiter.start_session(),
    };
    scanner.inode_table.insert(metadata.ino(), inode_from_metadata(&metadata));
    let mut root_dir = Directory::new("", metadata.ino());
    scanner.scan_directory(&mut root_dir, root, "/")?;
    Ok(FileSystem { dev: scanner.dev, inode_table: scanner.inode_table, root: root_dir })
}

struct Scanner<'a> {
    dev: u64,
    inode_table: BTreeMap<u64, Inode>,
    skip_path: Option<&'a Utf8Path>,
    exclusions: &'a [Regex],
    pacer: Pacer<'a>,
}

impl Scanner<'_> {
    fn scan_directory(
        &mut self,
        directory: &mut Directory,
        disk_path: &Utf8Path,
        tree_path: &str,
    ) -> Result<(), ScanError> {
        let mut names = Vec::new();
        let entries = std::fs::read_dir(disk_path).map_err(|err| ScanError::File {
            verb: "read",
            path: disk_path.to_path_buf(),
            err,
        })?;
        for entry in entries {
            let entry = entry.map_err(|err| ScanError::File {
                verb: "read",
                path: disk_path.to_path_buf(),
                err,
            })?;
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();

        for name in names {
            let disk_child = disk_path.join(&name);
            if self.skip_path == Some(disk_child.as_path()) {
                continue;
            }
            let tree_child = join_path(tree_path, &name);
            if self.exclusions.iter().any(|regex| regex.is_match(&tree_child)) {
                continue;
            }
            let metadata = match std::fs::symlink_metadata(&disk_child) {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(ScanError::File {
                        verb: "stat",
                        path: disk_child,
                        err,
                    });
                }
            };
            if metadata.dev() != self.dev {
                // Never cross filesystem boundaries.
                continue;
            }
            let inode_number = metadata.ino();
            let is_new = !self.inode_table.contains_key(&inode_number);
            if metadata.is_dir() {
                if !is_new {
                    return Err(ScanError::HardlinkedDirectory(tree_child));
                }
                self.inode_table.insert(inode_number, inode_from_metadata(&metadata));
                let mut child = Directory::new(&name, inode_number);
                self.scan_directory(&mut child, &disk_child, &tree_child)?;
                directory.directories.push(child);
            } else {
                if is_new {
                    match self.file_inode(&disk_child, &metadata)? {
                        Some(inode) => {
                            self.inode_table.insert(inode_number, inode);
                        }
                        // Vanished between stat and open.
                        None => continue,
                    }
                }
                directory.files.push(File { name, inode: inode_number });
            }
        }
        Ok(())
    }

    /// Build the inode for a non-directory entry, hashing regular-file
    /// content and reading symlink targets. `None` means the entry
    /// disappeared mid-scan.
    fn file_inode(
        &mut self,
        path: &Utf8Path,
        metadata: &std::fs::Metadata,
    ) -> Result<Option<Inode>, ScanError> {
        let mut inode = inode_from_metadata(metadata);
        if metadata.is_file() {
            let mut file = match std::fs::File::open(path) {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
                Err(err) => {
                    return Err(ScanError::File {
                        verb: "open",
                        path: path.to_path_buf(),
                        err,
                    });
                }
            };
            let mut hasher = Sha512::new();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf).map_err(|err| ScanError::File {
                    verb: "read",
                    path: path.to_path_buf(),
                    err,
                })?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                self.pacer.consume(n);
            }
            inode.hash = Some(ObjectHash::from_hasher(hasher));
        } else if metadata.file_type().is_symlink() {
            match std::fs::read_link(path) {
                Ok(target) => {
                    inode.symlink_target =
                        Some(target.to_string_lossy().into_owned());
                }
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
                Err(err) => {
                    return Err(ScanError::File {
                        verb: "read link",
                        path: path.to_path_buf(),
                        err,
                    });
                }
            }
        }
        Ok(Some(inode))
    }
}

fn inode_from_metadata(metadata: &std::fs::Metadata) -> Inode {
    Inode {
        mode: metadata.mode(),
        uid: metadata.uid(),
        gid: metadata.gid(),
        mtime: metadata.mtime(),
        size: metadata.len(),
        symlink_target: None,
        hash: None,
    }
}

/// The scan loop: rescan on an interval, or promptly when poked (after
/// a fetch or an update). The generation counter advances only when the
/// tree or the object cache actually changed, so an idle sub never
/// re-ships its tree. A scan holds the work lock in read mode and thus
/// never observes a partially-applied update.
pub async fn run_scanner(state: Arc<SubState>, mut rescan_rx: mpsc::Receiver<()>) {
    let log = state.log.new(o!("task" => "scanner"));
    loop {
        let started = Instant::now();
        let walk_result = {
            let _guard = state.work_lock.read().await;
            let state = Arc::clone(&state);
            tokio::task::spawn_blocking(move || {
                let data_dir = state.config.data_dir.clone();
                let skip_path = data_dir
                    .starts_with(&state.config.root_dir)
                    .then_some(data_dir.as_path());
                walk(
                    &state.config.root_dir,
                    skip_path,
                    &state.exclusions,
                    &state.rate_limiter,
                )
            })
            .await
        };
        let duration = started.elapsed();
        match walk_result {
            Ok(Ok(file_system)) => {
                let tree_hash = file_system.tree_hash();
                let object_cache = state.object_cache.all_hashes();
                let mut scan = state.scan.lock().unwrap();
                let changed = scan.tree_hash != Some(tree_hash)
                    || scan.object_cache != object_cache;
                if changed {
                    scan.generation += 1;
                    scan.file_system = Some(Arc::new(file_system));
                    scan.tree_hash = Some(tree_hash);
                    scan.object_cache = object_cache;
                }
                scan.last_error.clear();
                let generation = scan.generation;
                drop(scan);
                debug!(log, "scan completed";
                    "duration_ms" => duration.as_millis() as u64,
                    "changed" => changed, "generation" => generation);
            }
            Ok(Err(err)) => {
                state.scan.lock().unwrap().last_error = err.to_string();
                warn!(log, "scan failed"; "error" => %err);
            }
            Err(join_error) => {
                state.scan.lock().unwrap().last_error = join_error.to_string();
                warn!(log, "scan task died"; "error" => %join_error);
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(state.config.scan_interval()) => {}
            _ = rescan_rx.recv() => {}
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::os::unix::fs::MetadataExt;

    use herd_filesystem::FileType;

    use super::{walk, Scanner};
    use crate::rate_limiter::RateLimiter;

    fn build_fixture(root: &camino::Utf8Path) {
        std::fs::create_dir(root.join("etc")).unwrap();
        std::fs::write(root.join("etc/motd"), b"welcome\n").unwrap();
        std::fs::write(root.join("a"), b"alpha").unwrap();
        std::fs::hard_link(root.join("a"), root.join("a-link")).unwrap();
        std::os::unix::fs::symlink("/elsewhere", root.join("link")).unwrap();
    }

    #[test]
    fn scans_are_deterministic() {
        let dir = camino_tempfile::tempdir().unwrap();
        build_fixture(dir.path());
        let limiter = RateLimiter::new(0);
        let first = walk(dir.path(), None, &[], &limiter).unwrap();
        let second = walk(dir.path(), None, &[], &limiter).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.tree_hash(), second.tree_hash());
    }

    #[test]
    fn entries_are_sorted_and_typed() {
        let dir = camino_tempfile::tempdir().unwrap();
        build_fixture(dir.path());
        let limiter = RateLimiter::new(0);
        let fs = walk(dir.path(), None, &[], &limiter).unwrap();
        let entries = fs.walk().unwrap();
        let paths: Vec<&str> =
            entries.iter().map(|entry| entry.path.as_str()).collect();
        assert_eq!(paths, ["/", "/a", "/a-link", "/etc", "/etc/motd", "/link"]);
        let link = entries.iter().find(|entry| entry.path == "/link").unwrap();
        assert_eq!(link.inode.file_type(), FileType::Symlink);
        assert_eq!(link.inode.symlink_target.as_deref(), Some("/elsewhere"));
    }

    #[test]
    fn hard_links_share_one_inode() {
        let dir = camino_tempfile::tempdir().unwrap();
        build_fixture(dir.path());
        let limiter = RateLimiter::new(0);
        let fs = walk(dir.path(), None, &[], &limiter).unwrap();
        let a = fs.root.files.iter().find(|f| f.name == "a").unwrap();
        let a_link = fs.root.files.iter().find(|f| f.name == "a-link").unwrap();
        assert_eq!(a.inode, a_link.inode);
        assert!(fs.inode(a.inode).unwrap().hash.is_some());
    }

    #[test]
    fn exclusions_and_skip_path_are_honored() {
        let dir = camino_tempfile::tempdir().unwrap();
        build_fixture(dir.path());
        std::fs::create_dir(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/netbench"), b"1\n").unwrap();
        let limiter = RateLimiter::new(0);
        let exclusions = vec![regex::Regex::new("^(?:/etc(/.*)?)$").unwrap()];
        let skip = dir.path().join("data");
        let fs = walk(dir.path(), Some(&skip), &exclusions, &limiter).unwrap();
        let paths: Vec<String> =
            fs.walk().unwrap().into_iter().map(|entry| entry.path).collect();
        assert_eq!(paths, ["/", "/a", "/a-link", "/link"]);
    }

    #[test]
    fn entries_on_other_devices_are_invisible() {
        // Mounting inside a test is not portable, so drive the scanner
        // with a device number nothing on disk matches: every entry
        // then looks like a foreign mount and must be skipped.
        let dir = camino_tempfile::tempdir().unwrap();
        build_fixture(dir.path());
        let root_meta = std::fs::metadata(dir.path()).unwrap();
        let limiter = RateLimiter::new(0);
        let mut scanner = Scanner {
            dev: root_meta.dev() + 1,
            inode_table: BTreeMap::new(),
            skip_path: None,
            exclusions: &[],
            pacer: limiter.start_session(),
        };
        scanner
            .inode_table
            .insert(root_meta.ino(), super::inode_from_metadata(&root_meta));
        let mut root_dir = herd_filesystem::Directory::new("", root_meta.ino());
        scanner.scan_directory(&mut root_dir, dir.path(), "/").unwrap();
        assert!(root_dir.directories.is_empty());
        assert!(root_dir.files.is_empty());
        assert_eq!(scanner.inode_table.len(), 1);
    }

    #[test]
    fn hardlinked_directory_fails_the_scan() {
        // Directory hard links cannot be created portably, so seed the
        // scanner's inode table with the directory's own inode number:
        // the walk then sees the directory a second time, which is
        // exactly the hard-link case.
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("x")).unwrap();
        let x_ino =
            std::fs::metadata(dir.path().join("x")).unwrap().ino();
        let root_meta = std::fs::metadata(dir.path()).unwrap();
        let limiter = RateLimiter::new(0);
        let mut scanner = Scanner {
            dev: root_meta.dev(),
            inode_table: BTreeMap::new(),
            skip_path: None,
            exclusions: &[],
            pacer: limiter.start_session(),
        };
        scanner
            .inode_table
            .insert(x_ino, super::inode_from_metadata(&root_meta));
        let mut root_dir = herd_filesystem::Directory::new("", root_meta.ino());
        let err = scanner
            .scan_directory(&mut root_dir, dir.path(), "/")
            .unwrap_err();
        assert!(matches!(err, super::ScanError::HardlinkedDirectory(path)
            if path == "/x"));
    }
}
