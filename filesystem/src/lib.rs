// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The filesystem tree model shared by the scanner, the herd's diff
//! engine and the image format.
//!
//! Invariants:
//! - every regular-file inode carries an object hash;
//! - every inode referenced from the tree appears in the inode table
//!   exactly once (hard links share an entry);
//! - directory and file child lists are sorted lexicographically.
//!
//! Two hashes are derived from a tree. [`FileSystem::tree_hash`] is the
//! digest of the canonical encoding of the whole structure, inode numbers
//! included; identical scans of identical filesystems produce identical
//! tree hashes. [`FileSystem::content_hash`] ignores inode and device
//! numbers and hashes only paths and inode content, so a sub's tree and
//! an image's tree can be compared for convergence even though they were
//! produced on different machines.

use std::collections::{BTreeMap, BTreeSet};

use herd_common::ObjectHash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("inode {0} referenced from the tree is missing from the inode table")]
    MissingInode(u64),
}

/// What kind of filesystem entry an inode describes, recovered from the
/// file-type bits of its mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Other,
}

/// Metadata for one filesystem entry. Hard-linked names share one inode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
    /// Content hash; present exactly for regular files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ObjectHash>,
}

impl Inode {
    pub fn file_type(&self) -> FileType {
        match self.mode & (libc::S_IFMT as u32) {
            x if x == libc::S_IFREG as u32 => FileType::Regular,
            x if x == libc::S_IFDIR as u32 => FileType::Directory,
            x if x == libc::S_IFLNK as u32 => FileType::Symlink,
            _ => FileType::Other,
        }
    }

    pub fn is_regular(&self) -> bool {
        self.file_type() == FileType::Regular
    }

    pub fn is_directory(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == FileType::Symlink
    }

    /// Permission and setuid/setgid/sticky bits, without the type bits.
    pub fn permissions(&self) -> u32 {
        self.mode & !(libc::S_IFMT as u32)
    }

    /// Whether two inodes describe the same entry content, ignoring
    /// identity (inode/device numbers are not part of an `Inode`).
    pub fn same_content(&self, other: &Inode) -> bool {
        if self.file_type() != other.file_type()
            || self.permissions() != other.permissions()
            || self.uid != other.uid
            || self.gid != other.gid
        {
            return false;
        }
        match self.file_type() {
            FileType::Regular => {
                self.hash == other.hash && self.mtime == other.mtime
            }
            FileType::Symlink => self.symlink_target == other.symlink_target,
            FileType::Directory => true,
            FileType::Other => self.mtime == other.mtime,
        }
    }
}

/// A non-directory directory entry: regular file, symlink or special
/// file. The inode distinguishes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub name: String,
    pub inode: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub name: String,
    pub inode: u64,
    pub directories: Vec<Directory>,
    pub files: Vec<File>,
}

impl Directory {
    pub fn new(name: &str, inode: u64) -> Directory {
        Directory {
            name: name.to_string(),
            inode,
            directories: Vec::new(),
            files: Vec::new(),
        }
    }
}

/// A rooted tree of directories plus the inode table, keyed by inode
/// number. A single tree never spans devices, so the device number is a
/// tree-wide scalar.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystem {
    pub dev: u64,
    pub inode_table: BTreeMap<u64, Inode>,
    pub root: Directory,
}

/// One entry of a depth-first walk.
#[derive(Clone, Debug)]
pub struct PathEntry<'a> {
    /// Absolute path, `/` for the root.
    pub path: String,
    pub inode_number: u64,
    pub inode: &'a Inode,
}

impl FileSystem {
    pub fn inode(&self, number: u64) -> Option<&Inode> {
        self.inode_table.get(&number)
    }

    /// Depth-first walk in canonical order: each directory yields itself,
    /// then its subdirectories and files interleaved in name order.
    pub fn walk(&self) -> Result<Vec<PathEntry<'_>>, TreeError> {
        let mut entries = Vec::with_capacity(self.inode_table.len());
        self.visit(&self.root, "/", &mut entries)?;
        Ok(entries)
    }

    fn visit<'a>(
        &'a self,
        directory: &'a Directory,
        path: &str,
        entries: &mut Vec<PathEntry<'a>>,
    ) -> Result<(), TreeError> {
        let inode = self
            .inode(directory.inode)
            .ok_or(TreeError::MissingInode(directory.inode))?;
        entries.push(PathEntry {
            path: path.to_string(),
            inode_number: directory.inode,
            inode,
        });
        let mut dirs = directory.directories.iter().peekable();
        let mut files = directory.files.iter().peekable();
        loop {
            let take_dir = match (dirs.peek(), files.peek()) {
                (Some(d), Some(f)) => d.name <= f.name,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            if take_dir {
                let child = dirs.next().unwrap();
                let child_path = join_path(path, &child.name);
                self.visit(child, &child_path, entries)?;
            } else {
                let child = files.next().unwrap();
                let inode = self
                    .inode(child.inode)
                    .ok_or(TreeError::MissingInode(child.inode))?;
                entries.push(PathEntry {
                    path: join_path(path, &child.name),
                    inode_number: child.inode,
                    inode,
                });
            }
        }
        Ok(())
    }

    /// Object hashes of every regular file in the tree.
    pub fn object_hashes(&self) -> BTreeSet<ObjectHash> {
        self.inode_table.values().filter_map(|inode| inode.hash).collect()
    }

    /// Digest of the canonical encoding of the whole structure. Identical
    /// filesystems scanned twice yield identical tree hashes.
    pub fn tree_hash(&self) -> ObjectHash {
        let mut hasher = Sha512::new();
        // BTreeMap ordering and sorted child lists make the encoding
        // canonical.
        ciborium::into_writer(self, &mut hasher)
            .unwrap_or_else(|_| unreachable!("hashing is infallible"));
        ObjectHash::from_hasher(hasher)
    }

    /// Depth-first walk with paths for which `excluded` returns true
    /// dropped; an excluded directory drops its whole subtree.
    pub fn walk_filtered(
        &self,
        excluded: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<PathEntry<'_>>, TreeError> {
        let mut entries = Vec::new();
        let mut skip_prefix: Option<String> = None;
        for entry in self.walk()? {
            if let Some(prefix) = &skip_prefix {
                if is_under(&entry.path, prefix) {
                    continue;
                }
                skip_prefix = None;
            }
            if excluded(&entry.path) {
                if entry.inode.is_directory() {
                    skip_prefix = Some(entry.path.clone());
                }
                continue;
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Identity-independent content digest: hashes paths and inode
    /// content (type, permissions, ownership, mtime for files, symlink
    /// targets, object hashes) but not inode or device numbers. Paths for
    /// which `excluded` returns true are skipped along with, for
    /// directories, their entire subtree.
    pub fn content_hash(
        &self,
        excluded: &dyn Fn(&str) -> bool,
    ) -> Result<ObjectHash, TreeError> {
        let mut hasher = Sha512::new();
        for entry in self.walk_filtered(excluded)? {
            hash_entry(&mut hasher, &entry.path, entry.inode);
        }
        Ok(ObjectHash::from_hasher(hasher))
    }
}

fn hash_entry(hasher: &mut Sha512, path: &str, inode: &Inode) {
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(inode.permissions().to_be_bytes());
    hasher.update(inode.uid.to_be_bytes());
    hasher.update(inode.gid.to_be_bytes());
    match inode.file_type() {
        FileType::Regular => {
            hasher.update(b"F");
            hasher.update(inode.mtime.to_be_bytes());
            hasher.update(inode.size.to_be_bytes());
            if let Some(hash) = &inode.hash {
                hasher.update(hash.as_bytes());
            }
        }
        FileType::Directory => {
            hasher.update(b"D");
        }
        FileType::Symlink => {
            hasher.update(b"L");
            if let Some(target) = &inode.symlink_target {
                hasher.update(target.as_bytes());
            }
        }
        FileType::Other => {
            hasher.update(b"O");
            hasher.update(inode.mtime.to_be_bytes());
        }
    }
    hasher.update([0xffu8]);
}

/// Join an absolute parent path and a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Whether `path` equals `ancestor` or lies beneath it.
pub fn is_under(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use herd_common::ObjectHash;

    use super::{Directory, File, FileSystem, FileType, Inode};

    pub fn dir_inode() -> Inode {
        Inode {
            mode: libc::S_IFDIR as u32 | 0o755,
            uid: 0,
            gid: 0,
            mtime: 1_000,
            size: 0,
            symlink_target: None,
            hash: None,
        }
    }

    pub fn file_inode(content: &[u8]) -> Inode {
        Inode {
            mode: libc::S_IFREG as u32 | 0o644,
            uid: 0,
            gid: 0,
            mtime: 1_000,
            size: content.len() as u64,
            symlink_target: None,
            hash: Some(ObjectHash::of(content)),
        }
    }

    /// Root with `/a` (file), `/etc` (dir) and `/etc/motd` (file).
    fn sample(base_inode: u64) -> FileSystem {
        let mut inode_table = BTreeMap::new();
        inode_table.insert(base_inode, dir_inode());
        inode_table.insert(base_inode + 1, file_inode(b"hello"));
        inode_table.insert(base_inode + 2, dir_inode());
        inode_table.insert(base_inode + 3, file_inode(b"welcome\n"));
        let mut root = Directory::new("", base_inode);
        root.files.push(File { name: "a".to_string(), inode: base_inode + 1 });
        let mut etc = Directory::new("etc", base_inode + 2);
        etc.files.push(File { name: "motd".to_string(), inode: base_inode + 3 });
        root.directories.push(etc);
        FileSystem { dev: 100, inode_table, root }
    }

    #[test]
    fn walk_is_depth_first_and_sorted() {
        let fs = sample(1);
        let paths: Vec<String> =
            fs.walk().unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(paths, ["/", "/a", "/etc", "/etc/motd"]);
    }

    #[test]
    fn file_types_from_mode() {
        let fs = sample(1);
        assert_eq!(fs.inode(1).unwrap().file_type(), FileType::Directory);
        assert_eq!(fs.inode(2).unwrap().file_type(), FileType::Regular);
    }

    #[test]
    fn tree_hash_depends_on_identity() {
        assert_eq!(sample(1).tree_hash(), sample(1).tree_hash());
        // Different inode numbering changes the tree hash...
        assert_ne!(sample(1).tree_hash(), sample(7).tree_hash());
    }

    #[test]
    fn content_hash_ignores_identity() {
        // ...but not the content hash.
        let a = sample(1).content_hash(&|_| false).unwrap();
        let b = sample(7).content_hash(&|_| false).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn content_hash_sees_changes() {
        let base = sample(1);
        let mut modified = sample(1);
        modified.inode_table.get_mut(&4).unwrap().hash =
            Some(ObjectHash::of(b"tampered"));
        assert_ne!(
            base.content_hash(&|_| false).unwrap(),
            modified.content_hash(&|_| false).unwrap()
        );
    }

    #[test]
    fn content_hash_excludes_subtrees() {
        let full = sample(1);
        let mut trimmed = sample(1);
        trimmed.root.directories.clear();
        trimmed.inode_table.remove(&3);
        trimmed.inode_table.remove(&4);
        let exclude_etc = |path: &str| super::is_under(path, "/etc");
        assert_eq!(
            full.content_hash(&exclude_etc).unwrap(),
            trimmed.content_hash(&|_| false).unwrap()
        );
    }

    #[test]
    fn is_under() {
        assert!(super::is_under("/etc/motd", "/etc"));
        assert!(super::is_under("/etc", "/etc"));
        assert!(!super::is_under("/etcetera", "/etc"));
        assert!(super::is_under("/anything", "/"));
    }
}
