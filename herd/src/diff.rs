// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The diff engine: compares a sub's reported tree against its required
//! image and produces the minimal plan that converges the sub. Paths
//! outside the image's filter are invisible in both directions: never
//! created, never modified, never deleted.

use std::collections::{BTreeMap, BTreeSet};

use herd_common::ObjectHash;
use herd_filesystem::{FileSystem, FileType, Inode, TreeError};
use herd_image::LoadedImage;
use herd_protocol::subd::{
    DirectoryToMake, FileToWrite, MetadataChange, SymlinkToMake, UpdateRequest,
};

pub struct Plan {
    pub update: UpdateRequest,
    /// Hashes the plan's file writes draw from; the scheduler subtracts
    /// what the sub's object cache already holds to decide what to
    /// fetch.
    pub required_objects: BTreeSet<ObjectHash>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.update.is_empty()
    }
}

pub fn build_update_plan(
    image_name: &str,
    image: &LoadedImage,
    sub_fs: &FileSystem,
) -> Result<Plan, TreeError> {
    let excluded = |path: &str| image.filter.matches(path);
    let target_entries = image.image.filesystem.walk_filtered(&excluded)?;
    let sub_entries = sub_fs.walk_filtered(&excluded)?;
    let sub_map: BTreeMap<&str, &Inode> =
        sub_entries.iter().map(|entry| (entry.path.as_str(), entry.inode)).collect();
    let target_paths: BTreeSet<&str> =
        target_entries.iter().map(|entry| entry.path.as_str()).collect();

    let mut update =
        UpdateRequest { image_name: image_name.to_string(), ..Default::default() };
    let mut required_objects = BTreeSet::new();
    let mut touched: Vec<String> = Vec::new();

    for entry in &target_entries {
        if entry.path == "/" {
            // The root itself is never created or re-owned.
            continue;
        }
        let target = entry.inode;
        let existing = sub_map.get(entry.path.as_str()).copied();
        match target.file_type() {
            FileType::Directory => {
                let satisfied = existing.is_some_and(|inode| {
                    inode.is_directory()
                        && inode.permissions() == target.permissions()
                        && inode.uid == target.uid
                        && inode.gid == target.gid
                });
                if !satisfied {
                    update.directories_to_make.push(DirectoryToMake {
                        path: entry.path.clone(),
                        mode: target.mode,
                        uid: target.uid,
                        gid: target.gid,
                    });
                    touched.push(entry.path.clone());
                }
            }
            FileType::Regular => {
                let Some(hash) = target.hash else {
                    // Regular image inodes always carry a hash; an image
                    // that lost one fails closed.
                    return Err(TreeError::MissingInode(entry.inode_number));
                };
                match existing {
                    Some(inode)
                        if inode.is_regular() && inode.hash == Some(hash) =>
                    {
                        let metadata_ok = inode.permissions()
                            == target.permissions()
                            && inode.uid == target.uid
                            && inode.gid == target.gid
                            && inode.mtime == target.mtime;
                        if !metadata_ok {
                            update.inodes_to_change.push(MetadataChange {
                                path: entry.path.clone(),
                                mode: target.mode,
                                uid: target.uid,
                                gid: target.gid,
                                mtime: target.mtime,
                            });
                            touched.push(entry.path.clone());
                        }
                    }
                    _ => {
                        update.files_to_write.push(FileToWrite {
                            path: entry.path.clone(),
                            hash,
                            mode: target.mode,
                            uid: target.uid,
                            gid: target.gid,
                            mtime: target.mtime,
                        });
                        required_objects.insert(hash);
                        touched.push(entry.path.clone());
                    }
                }
            }
            FileType::Symlink => {
                let satisfied = existing.is_some_and(|inode| {
                    inode.is_symlink()
                        && inode.symlink_target == target.symlink_target
                        && inode.uid == target.uid
                        && inode.gid == target.gid
                });
                if !satisfied {
                    update.symlinks_to_make.push(SymlinkToMake {
                        path: entry.path.clone(),
                        target: target.symlink_target.clone().unwrap_or_default(),
                        uid: target.uid,
                        gid: target.gid,
                    });
                    touched.push(entry.path.clone());
                }
            }
            // Special files are recorded by scans but not materialized
            // by updates.
            FileType::Other => {}
        }
    }

    // Names on the sub with no counterpart in the target. Only the
    // topmost path of a doomed subtree is listed; deletion is recursive.
    let mut doomed_prefix: Option<String> = None;
    for entry in &sub_entries {
        if entry.path == "/" {
            continue;
        }
        if let Some(prefix) = &doomed_prefix {
            if herd_filesystem::is_under(&entry.path, prefix) {
                continue;
            }
            doomed_prefix = None;
        }
        if !target_paths.contains(entry.path.as_str()) {
            if entry.inode.is_directory() {
                doomed_prefix = Some(entry.path.clone());
            }
            update.paths_to_delete.push(entry.path.clone());
            touched.push(entry.path.clone());
        }
    }

    // Triggers whose watched paths were touched, deduplicated by
    // service, in image order.
    let mut selected = BTreeSet::new();
    for trigger in &image.triggers {
        if selected.contains(&trigger.trigger.service) {
            continue;
        }
        if touched.iter().any(|path| trigger.matches(path)) {
            selected.insert(trigger.trigger.service.clone());
            update.triggers.push(trigger.trigger.clone());
        }
    }

    Ok(Plan { update, required_objects })
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use herd_common::ObjectHash;
    use herd_filesystem::{Directory, File, FileSystem, Inode};
    use herd_image::{Filter, Image, LoadedImage, Trigger};

    use super::build_update_plan;

    /// Builds trees the way the scanner would report them: sorted child
    /// lists, one inode-table entry per entry.
    struct TreeBuilder {
        fs: FileSystem,
        next_inode: u64,
    }

    impl TreeBuilder {
        fn new() -> TreeBuilder {
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
            TreeBuilder {
                fs: FileSystem {
                    dev: 1,
                    inode_table,
                    root: Directory::new("", 1),
                },
                next_inode: 2,
            }
        }

        fn dir_mut(&mut self, path: &str) -> &mut Directory {
            let mut dir = &mut self.fs.root;
            for part in path.split('/').filter(|part| !part.is_empty()) {
                let index = dir
                    .directories
                    .iter()
                    .position(|child| child.name == part)
                    .expect("parent directory added first");
                dir = &mut dir.directories[index];
            }
            dir
        }

        fn add_dir(&mut self, path: &str, mode: u32) -> &mut TreeBuilder {
            let inode = self.next_inode;
            self.next_inode += 1;
            self.fs.inode_table.insert(
                inode,
                Inode {
                    mode: libc::S_IFDIR as u32 | mode,
                    uid: 0,
                    gid: 0,
                    mtime: 0,
                    size: 0,
                    symlink_target: None,
                    hash: None,
                },
            );
            let (parent, name) = split_parent(path);
            let dir = self.dir_mut(parent);
            dir.directories.push(Directory::new(name, inode));
            dir.directories.sort_by(|a, b| a.name.cmp(&b.name));
            self
        }

        fn add_file_inode(&mut self, path: &str, inode: Inode) -> &mut TreeBuilder {
            let number = self.next_inode;
            self.next_inode += 1;
            self.fs.inode_table.insert(number, inode);
            let (parent, name) = split_parent(path);
            let dir = self.dir_mut(parent);
            dir.files.push(File { name: name.to_string(), inode: number });
            dir.files.sort_by(|a, b| a.name.cmp(&b.name));
            self
        }

        fn add_file(&mut self, path: &str, content: &[u8]) -> &mut TreeBuilder {
            self.add_file_with(path, content, 0o644, 1_000)
        }

        fn add_file_with(
            &mut self,
            path: &str,
            content: &[u8],
            mode: u32,
            mtime: i64,
        ) -> &mut TreeBuilder {
            self.add_file_inode(
                path,
                Inode {
                    mode: libc::S_IFREG as u32 | mode,
                    uid: 0,
                    gid: 0,
                    mtime,
                    size: content.len() as u64,
                    symlink_target: None,
                    hash: Some(ObjectHash::of(content)),
                },
            )
        }

        fn add_symlink(&mut self, path: &str, target: &str) -> &mut TreeBuilder {
            self.add_file_inode(
                path,
                Inode {
                    mode: libc::S_IFLNK as u32 | 0o777,
                    uid: 0,
                    gid: 0,
                    mtime: 1_000,
                    size: target.len() as u64,
                    symlink_target: Some(target.to_string()),
                    hash: None,
                },
            )
        }

        fn build(&self) -> FileSystem {
            self.fs.clone()
        }
    }

    fn split_parent(path: &str) -> (&str, &str) {
        let cut = path.rfind('/').unwrap();
        (&path[..cut], &path[cut + 1..])
    }

    fn loaded(
        builder: &TreeBuilder,
        filter: Filter,
        triggers: Vec<Trigger>,
    ) -> LoadedImage {
        LoadedImage::new(Image {
            filesystem: builder.build(),
            filter,
            triggers,
            created_at: Utc::now(),
        })
        .unwrap()
    }

    #[test]
    fn fresh_sub_needs_everything() {
        let mut target = TreeBuilder::new();
        target.add_file("/a", b"hello");
        let image = loaded(&target, Filter::default(), Vec::new());
        let sub = TreeBuilder::new().build();

        let plan = build_update_plan("img", &image, &sub).unwrap();
        assert_eq!(plan.update.files_to_write.len(), 1);
        assert_eq!(plan.update.files_to_write[0].path, "/a");
        assert!(plan.required_objects.contains(&ObjectHash::of(b"hello")));
        assert!(plan.update.paths_to_delete.is_empty());
    }

    #[test]
    fn partial_duplicate_writes_only_the_missing_file() {
        let mut target = TreeBuilder::new();
        target.add_file("/a", b"alpha").add_file("/b", b"beta");
        let image = loaded(&target, Filter::default(), Vec::new());
        let mut sub = TreeBuilder::new();
        sub.add_file("/a", b"alpha");

        let plan = build_update_plan("img", &image, &sub.build()).unwrap();
        let written: Vec<&str> =
            plan.update.files_to_write.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(written, ["/b"]);
        assert_eq!(
            plan.required_objects.iter().copied().collect::<Vec<_>>(),
            [ObjectHash::of(b"beta")]
        );
    }

    #[test]
    fn extra_paths_are_deleted_topmost_first() {
        let target = TreeBuilder::new();
        let image = loaded(&target, Filter::default(), Vec::new());
        let mut sub = TreeBuilder::new();
        sub.add_dir("/junk", 0o755);
        sub.add_file("/junk/a", b"x").add_file("/junk/b", b"y");

        let plan = build_update_plan("img", &image, &sub.build()).unwrap();
        assert_eq!(plan.update.paths_to_delete, ["/junk"]);
    }

    #[test]
    fn filtered_paths_are_invisible() {
        let mut target = TreeBuilder::new();
        target.add_file("/managed", b"m");
        let filter = Filter { lines: vec!["/scratch(/.*)?".to_string()] };
        let image = loaded(&target, filter, Vec::new());
        let mut sub = TreeBuilder::new();
        sub.add_dir("/scratch", 0o755);
        sub.add_file("/scratch/keep", b"k").add_file("/managed", b"m");

        let plan = build_update_plan("img", &image, &sub.build()).unwrap();
        assert!(plan.is_empty(), "filtered content must not be deleted");
    }

    #[test]
    fn metadata_only_difference_changes_inode_not_content() {
        let mut target = TreeBuilder::new();
        target.add_file_with("/a", b"same", 0o600, 2_000);
        let image = loaded(&target, Filter::default(), Vec::new());
        let mut sub = TreeBuilder::new();
        sub.add_file_with("/a", b"same", 0o644, 1_000);

        let plan = build_update_plan("img", &image, &sub.build()).unwrap();
        assert!(plan.update.files_to_write.is_empty());
        assert_eq!(plan.update.inodes_to_change.len(), 1);
        assert_eq!(plan.update.inodes_to_change[0].path, "/a");
        assert!(plan.required_objects.is_empty());
    }

    #[test]
    fn symlink_with_wrong_target_is_remade() {
        let mut target = TreeBuilder::new();
        target.add_symlink("/link", "/new");
        let image = loaded(&target, Filter::default(), Vec::new());
        let mut sub = TreeBuilder::new();
        sub.add_symlink("/link", "/old");

        let plan = build_update_plan("img", &image, &sub.build()).unwrap();
        assert_eq!(plan.update.symlinks_to_make.len(), 1);
        assert_eq!(plan.update.symlinks_to_make[0].target, "/new");
    }

    #[test]
    fn triggers_fire_only_for_touched_prefixes() {
        let mut target = TreeBuilder::new();
        target.add_dir("/etc", 0o755);
        target.add_file("/etc/app.conf", b"conf").add_file("/data", b"d");
        let triggers = vec![
            Trigger {
                service: "app".to_string(),
                match_lines: vec!["/etc(/.*)?".to_string()],
                command: vec!["restart-app".to_string()],
            },
            Trigger {
                service: "unrelated".to_string(),
                match_lines: vec!["/var/lib(/.*)?".to_string()],
                command: vec!["restart-unrelated".to_string()],
            },
        ];
        let image = loaded(&target, Filter::default(), triggers);
        let sub = TreeBuilder::new().build();

        let plan = build_update_plan("img", &image, &sub).unwrap();
        let services: Vec<&str> =
            plan.update.triggers.iter().map(|t| t.service.as_str()).collect();
        assert_eq!(services, ["app"]);
    }

    #[test]
    fn compliant_sub_produces_empty_plan() {
        let mut target = TreeBuilder::new();
        target.add_dir("/etc", 0o755);
        target.add_file("/etc/motd", b"welcome");
        let image = loaded(&target, Filter::default(), Vec::new());
        // Identical content arrives under different inode numbering.
        let mut sub = TreeBuilder::new();
        sub.add_dir("/etc", 0o755);
        sub.add_file("/etc/motd", b"welcome");

        let plan = build_update_plan("img", &image, &sub.build()).unwrap();
        assert!(plan.is_empty());
        assert!(plan.update.triggers.is_empty());
    }
}
