// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Images: a named, immutable target filesystem plus the filter selecting
//! which paths on a sub the image controls and the triggers to run after
//! specific path prefixes change.

use chrono::{DateTime, Utc};
use herd_common::ObjectHash;
use herd_filesystem::{FileSystem, TreeError};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("invalid filter line `{line}`")]
    InvalidFilter {
        line: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid match line `{line}` in trigger `{service}`")]
    InvalidTrigger {
        service: String,
        line: String,
        #[source]
        source: regex::Error,
    },

    #[error("malformed image tree")]
    Tree(#[from] TreeError),
}

/// Paths matching any filter line are outside the image's control: the
/// update engine neither creates, modifies nor deletes them. Lines are
/// anchored regular expressions over absolute paths; a matching directory
/// excludes its whole subtree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub lines: Vec<String>,
}

impl Filter {
    pub fn compile(&self) -> Result<CompiledFilter, ImageError> {
        let regexes = self
            .lines
            .iter()
            .map(|line| {
                Regex::new(&format!("^(?:{})$", line)).map_err(|source| {
                    ImageError::InvalidFilter { line: line.clone(), source }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompiledFilter { regexes })
    }
}

pub struct CompiledFilter {
    regexes: Vec<Regex>,
}

impl CompiledFilter {
    /// Whether `path` is unmanaged (left alone by updates).
    pub fn matches(&self, path: &str) -> bool {
        self.regexes.iter().any(|regex| regex.is_match(path))
    }
}

/// A named command to run on the sub after matching paths change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub service: String,
    /// Anchored regexes; the trigger fires if any touched path matches.
    pub match_lines: Vec<String>,
    pub command: Vec<String>,
}

pub struct CompiledTrigger {
    pub trigger: Trigger,
    patterns: Vec<Regex>,
}

impl CompiledTrigger {
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(path))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub filesystem: FileSystem,
    pub filter: Filter,
    pub triggers: Vec<Trigger>,
    pub created_at: DateTime<Utc>,
}

/// An image with its filter and triggers compiled and its comparable
/// content hash precomputed; what the herd's image cache holds.
pub struct LoadedImage {
    pub image: Image,
    pub filter: CompiledFilter,
    pub triggers: Vec<CompiledTrigger>,
    /// Content hash of the image tree under its own filter; a sub whose
    /// filtered tree hashes to the same value is compliant.
    pub content_hash: ObjectHash,
}

impl LoadedImage {
    pub fn new(image: Image) -> Result<LoadedImage, ImageError> {
        let filter = image.filter.compile()?;
        let triggers = image
            .triggers
            .iter()
            .map(|trigger| {
                let patterns = trigger
                    .match_lines
                    .iter()
                    .map(|line| {
                        Regex::new(&format!("^(?:{})$", line)).map_err(|source| {
                            ImageError::InvalidTrigger {
                                service: trigger.service.clone(),
                                line: line.clone(),
                                source,
                            }
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CompiledTrigger { trigger: trigger.clone(), patterns })
            })
            .collect::<Result<Vec<_>, ImageError>>()?;
        let content_hash =
            image.filesystem.content_hash(&|path| filter.matches(path))?;
        Ok(LoadedImage { image, filter, triggers, content_hash })
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use herd_common::ObjectHash;
    use herd_filesystem::{Directory, File, FileSystem, Inode};

    use super::{Filter, Image, LoadedImage, Trigger};

    fn tiny_filesystem() -> FileSystem {
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
                size: 5,
                symlink_target: None,
                hash: Some(ObjectHash::of(b"hello")),
            },
        );
        let mut root = Directory::new("", 1);
        root.files.push(File { name: "a".to_string(), inode: 2 });
        FileSystem { dev: 1, inode_table, root }
    }

    #[test]
    fn filter_is_anchored() {
        let filter = Filter { lines: vec!["/tmp(/.*)?".to_string()] };
        let compiled = filter.compile().unwrap();
        assert!(compiled.matches("/tmp"));
        assert!(compiled.matches("/tmp/scratch"));
        assert!(!compiled.matches("/tmpfiles"));
        assert!(!compiled.matches("/var/tmp"));
    }

    #[test]
    fn bad_filter_line_is_rejected() {
        let filter = Filter { lines: vec!["[".to_string()] };
        assert!(filter.compile().is_err());
    }

    #[test]
    fn trigger_matching() {
        let image = Image {
            filesystem: tiny_filesystem(),
            filter: Filter::default(),
            triggers: vec![Trigger {
                service: "sshd".to_string(),
                match_lines: vec!["/etc/ssh(/.*)?".to_string()],
                command: vec!["service".to_string(), "sshd".to_string(), "restart".to_string()],
            }],
            created_at: Utc::now(),
        };
        let loaded = LoadedImage::new(image).unwrap();
        assert!(loaded.triggers[0].matches("/etc/ssh/sshd_config"));
        assert!(!loaded.triggers[0].matches("/etc/passwd"));
    }

    #[test]
    fn content_hash_respects_filter() {
        let unfiltered = LoadedImage::new(Image {
            filesystem: tiny_filesystem(),
            filter: Filter::default(),
            triggers: Vec::new(),
            created_at: Utc::now(),
        })
        .unwrap();
        let filtered = LoadedImage::new(Image {
            filesystem: tiny_filesystem(),
            filter: Filter { lines: vec!["/a".to_string()] },
            triggers: Vec::new(),
            created_at: Utc::now(),
        })
        .unwrap();
        assert_ne!(unfiltered.content_hash, filtered.content_hash);
    }
}
