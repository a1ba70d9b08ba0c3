// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The update applier.
//!
//! Applies a plan in step order: make directories, write files, make
//! symlinks, apply metadata changes, delete obsolete paths, run
//! triggers. Every write lands via a temporary name and a rename, so a
//! failed step leaves its target unchanged. Steps already satisfied on
//! disk are skipped, which makes re-applying a plan a no-op and keeps
//! triggers from re-firing. File content comes from the local object
//! cache, hardlinked into place when the cache entry is free to share
//! its inode and copied otherwise.

use std::collections::BTreeSet;
use std::io::{ErrorKind, Read};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use herd_common::ObjectHash;
use herd_image::Trigger;
use herd_protocol::subd::{
    DirectoryToMake, FileToWrite, MetadataChange, SymlinkToMake, UpdateRequest,
};
use object_store::hash_relative_path;
use regex::Regex;
use sha2::{Digest, Sha512};
use slog::{info, o, warn, Logger};

use crate::SubState;

static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("failed to {verb} `{path}`")]
    File {
        verb: &'static str,
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("object {0} not present in the local cache")]
    MissingObject(ObjectHash),
}

/// Background half of an Update call. Clears the in-progress flag and
/// pokes the scanner when done, whatever the outcome.
pub(crate) async fn run_update(state: Arc<SubState>, request: UpdateRequest) {
    let log = state.log.new(o!("task" => "update"));
    info!(log, "update starting";
        "image" => &request.image_name,
        "writes" => request.files_to_write.len(),
        "deletes" => request.paths_to_delete.len());
    match apply_update(&state, request, &log).await {
        Ok(()) => state.last_update_error.lock().unwrap().clear(),
        Err(message) => {
            warn!(log, "update failed"; "error" => &message);
            *state.last_update_error.lock().unwrap() = message;
        }
    }
    state.flags.lock().unwrap().update_in_progress = false;
    state.request_rescan();
}

async fn apply_update(
    state: &SubState,
    mut request: UpdateRequest,
    log: &Logger,
) -> Result<(), String> {
    // Write mode: no scan may observe the tree mid-plan.
    let _guard = state.work_lock.write().await;

    let triggers = std::mem::take(&mut request.triggers);
    let root = state.config.root_dir.clone();
    let object_dir = state.config.object_dir();
    let touched =
        tokio::task::spawn_blocking(move || apply_plan(&root, &object_dir, &request))
            .await
            .map_err(|err| err.to_string())?
            .map_err(|err| err.to_string())?;
    if touched.is_empty() {
        info!(log, "update was a no-op");
        return Ok(());
    }
    info!(log, "applied filesystem changes"; "paths" => touched.len());

    let mut failures = Vec::new();
    for trigger in triggers_to_run(&triggers, &touched) {
        if let Err(failure) = run_trigger(&trigger, log).await {
            failures.push(format!("trigger {}: {}", trigger.service, failure));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    }
}

/// Apply the filesystem half of a plan. Returns the tree paths actually
/// changed; already-satisfied steps contribute nothing.
fn apply_plan(
    root: &Utf8Path,
    object_dir: &Utf8Path,
    plan: &UpdateRequest,
) -> Result<Vec<String>, UpdateError> {
    let mut touched = Vec::new();
    for directory in &plan.directories_to_make {
        make_directory(root, directory, &mut touched)?;
    }
    for file in &plan.files_to_write {
        write_file(root, object_dir, file, &mut touched)?;
    }
    for symlink in &plan.symlinks_to_make {
        make_symlink(root, symlink, &mut touched)?;
    }
    for change in &plan.inodes_to_change {
        apply_metadata(root, change, &mut touched)?;
    }
    for path in &plan.paths_to_delete {
        delete_path(root, path, &mut touched)?;
    }
    Ok(touched)
}

fn target_path(root: &Utf8Path, tree_path: &str) -> Utf8PathBuf {
    root.join(tree_path.trim_start_matches('/'))
}

fn temp_name(target: &Utf8Path) -> Utf8PathBuf {
    let sequence = TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let parent = target.parent().unwrap_or(target);
    parent.join(format!(".subd.{}.{}", std::process::id(), sequence))
}

fn make_directory(
    root: &Utf8Path,
    spec: &DirectoryToMake,
    touched: &mut Vec<String>,
) -> Result<(), UpdateError> {
    let target = target_path(root, &spec.path);
    match std::fs::symlink_metadata(&target) {
        Ok(meta) if meta.is_dir() => {
            let mut changed = false;
            if meta.mode() & 0o7777 != spec.mode & 0o7777 {
                set_permissions(&target, spec.mode)?;
                changed = true;
            }
            if meta.uid() != spec.uid || meta.gid() != spec.gid {
                chown_path(&target, spec.uid, spec.gid)?;
                changed = true;
            }
            if changed {
                touched.push(spec.path.clone());
            }
            Ok(())
        }
        Ok(_) => {
            // A non-directory squats on the path; replace it.
            std::fs::remove_file(&target).map_err(|err| UpdateError::File {
                verb: "remove",
                path: target.clone(),
                err,
            })?;
            create_directory(&target, spec)?;
            touched.push(spec.path.clone());
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            create_directory(&target, spec)?;
            touched.push(spec.path.clone());
            Ok(())
        }
        Err(err) => Err(UpdateError::File { verb: "stat", path: target, err }),
    }
}

fn create_directory(
    target: &Utf8Path,
    spec: &DirectoryToMake,
) -> Result<(), UpdateError> {
    std::fs::create_dir(target).map_err(|err| UpdateError::File {
        verb: "create",
        path: target.to_path_buf(),
        err,
    })?;
    set_permissions(target, spec.mode)?;
    chown_path(target, spec.uid, spec.gid)
}

fn write_file(
    root: &Utf8Path,
    object_dir: &Utf8Path,
    spec: &FileToWrite,
    touched: &mut Vec<String>,
) -> Result<(), UpdateError> {
    let target = target_path(root, &spec.path);
    if file_satisfied(&target, spec)? {
        return Ok(());
    }
    let source = object_dir.join(hash_relative_path(&spec.hash));
    let source_meta = match std::fs::symlink_metadata(&source) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(UpdateError::MissingObject(spec.hash));
        }
        Err(err) => {
            return Err(UpdateError::File { verb: "stat", path: source, err });
        }
    };

    // Hardlinking shares the cache entry's inode, so it is only safe
    // when no other name holds that inode, or when the metadata already
    // matches and nothing needs changing.
    let metadata_matches = source_meta.mode() & 0o7777 == spec.mode & 0o7777
        && source_meta.uid() == spec.uid
        && source_meta.gid() == spec.gid
        && source_meta.mtime() == spec.mtime;
    let hardlink = source_meta.nlink() == 1 || metadata_matches;

    let temp = temp_name(&target);
    let result = (|| {
        if hardlink {
            std::fs::hard_link(&source, &temp).map_err(|err| UpdateError::File {
                verb: "link",
                path: temp.clone(),
                err,
            })?;
        } else {
            std::fs::copy(&source, &temp).map_err(|err| UpdateError::File {
                verb: "copy into",
                path: temp.clone(),
                err,
            })?;
        }
        if !(hardlink && metadata_matches) {
            set_permissions(&temp, spec.mode)?;
            chown_path(&temp, spec.uid, spec.gid)?;
            set_mtime(&temp, spec.mtime)?;
        }
        match std::fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => {
                std::fs::remove_dir_all(&target).map_err(|err| {
                    UpdateError::File { verb: "remove", path: target.clone(), err }
                })?;
            }
            _ => {}
        }
        std::fs::rename(&temp, &target).map_err(|err| UpdateError::File {
            verb: "rename into",
            path: target.clone(),
            err,
        })
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&temp);
        return result;
    }
    touched.push(spec.path.clone());
    Ok(())
}

/// Whether the target already holds exactly this file: same metadata
/// and, only then, the same content hash.
fn file_satisfied(target: &Utf8Path, spec: &FileToWrite) -> Result<bool, UpdateError> {
    match std::fs::symlink_metadata(target) {
        Ok(meta)
            if meta.is_file()
                && meta.mode() & 0o7777 == spec.mode & 0o7777
                && meta.uid() == spec.uid
                && meta.gid() == spec.gid
                && meta.mtime() == spec.mtime =>
        {
            Ok(hash_of_file(target)? == spec.hash)
        }
        Ok(_) => Ok(false),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(UpdateError::File {
            verb: "stat",
            path: target.to_path_buf(),
            err,
        }),
    }
}

fn hash_of_file(path: &Utf8Path) -> Result<ObjectHash, UpdateError> {
    let mut file = std::fs::File::open(path).map_err(|err| UpdateError::File {
        verb: "open",
        path: path.to_path_buf(),
        err,
    })?;
    let mut hasher = Sha512::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|err| UpdateError::File {
            verb: "read",
            path: path.to_path_buf(),
            err,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(ObjectHash::from_hasher(hasher))
}

fn make_symlink(
    root: &Utf8Path,
    spec: &SymlinkToMake,
    touched: &mut Vec<String>,
) -> Result<(), UpdateError> {
    let target = target_path(root, &spec.path);
    if let Ok(existing) = std::fs::read_link(&target) {
        if existing.to_string_lossy() == spec.target {
            let meta = std::fs::symlink_metadata(&target).map_err(|err| {
                UpdateError::File { verb: "stat", path: target.clone(), err }
            })?;
            if meta.uid() == spec.uid && meta.gid() == spec.gid {
                return Ok(());
            }
            lchown_path(&target, spec.uid, spec.gid)?;
            touched.push(spec.path.clone());
            return Ok(());
        }
    }
    let temp = temp_name(&target);
    let result = (|| {
        std::os::unix::fs::symlink(&spec.target, &temp).map_err(|err| {
            UpdateError::File { verb: "create", path: temp.clone(), err }
        })?;
        lchown_path(&temp, spec.uid, spec.gid)?;
        match std::fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => {
                std::fs::remove_dir_all(&target).map_err(|err| {
                    UpdateError::File { verb: "remove", path: target.clone(), err }
                })?;
            }
            _ => {}
        }
        std::fs::rename(&temp, &target).map_err(|err| UpdateError::File {
            verb: "rename into",
            path: target.clone(),
            err,
        })
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&temp);
        return result;
    }
    touched.push(spec.path.clone());
    Ok(())
}

fn apply_metadata(
    root: &Utf8Path,
    change: &MetadataChange,
    touched: &mut Vec<String>,
) -> Result<(), UpdateError> {
    let target = target_path(root, &change.path);
    let meta = std::fs::symlink_metadata(&target).map_err(|err| {
        UpdateError::File { verb: "stat", path: target.clone(), err }
    })?;
    let mut changed = false;
    if meta.file_type().is_symlink() {
        if meta.uid() != change.uid || meta.gid() != change.gid {
            lchown_path(&target, change.uid, change.gid)?;
            changed = true;
        }
    } else {
        if meta.mode() & 0o7777 != change.mode & 0o7777 {
            set_permissions(&target, change.mode)?;
            changed = true;
        }
        if meta.uid() != change.uid || meta.gid() != change.gid {
            chown_path(&target, change.uid, change.gid)?;
            changed = true;
        }
        if meta.is_file() && meta.mtime() != change.mtime {
            set_mtime(&target, change.mtime)?;
            changed = true;
        }
    }
    if changed {
        touched.push(change.path.clone());
    }
    Ok(())
}

fn delete_path(
    root: &Utf8Path,
    tree_path: &str,
    touched: &mut Vec<String>,
) -> Result<(), UpdateError> {
    let target = target_path(root, tree_path);
    match std::fs::symlink_metadata(&target) {
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(UpdateError::File { verb: "stat", path: target, err }),
        Ok(meta) => {
            let removed = if meta.is_dir() {
                std::fs::remove_dir_all(&target)
            } else {
                std::fs::remove_file(&target)
            };
            removed.map_err(|err| UpdateError::File {
                verb: "remove",
                path: target,
                err,
            })?;
            touched.push(tree_path.to_string());
            Ok(())
        }
    }
}

fn set_permissions(path: &Utf8Path, mode: u32) -> Result<(), UpdateError> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|err| UpdateError::File {
            verb: "chmod",
            path: path.to_path_buf(),
            err,
        })
}

fn chown_path(path: &Utf8Path, uid: u32, gid: u32) -> Result<(), UpdateError> {
    std::os::unix::fs::chown(path, Some(uid), Some(gid)).map_err(|err| {
        UpdateError::File { verb: "chown", path: path.to_path_buf(), err }
    })
}

fn lchown_path(path: &Utf8Path, uid: u32, gid: u32) -> Result<(), UpdateError> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid)).map_err(|err| {
        UpdateError::File { verb: "chown", path: path.to_path_buf(), err }
    })
}

fn set_mtime(path: &Utf8Path, mtime: i64) -> Result<(), UpdateError> {
    let file = std::fs::File::options().read(true).open(path).map_err(|err| {
        UpdateError::File { verb: "open", path: path.to_path_buf(), err }
    })?;
    let time = if mtime >= 0 {
        UNIX_EPOCH + Duration::from_secs(mtime as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(mtime.unsigned_abs())
    };
    file.set_modified(time).map_err(|err| UpdateError::File {
        verb: "set mtime of",
        path: path.to_path_buf(),
        err,
    })
}

/// Triggers whose watched paths were actually touched, deduplicated by
/// service name, in the order given.
fn triggers_to_run(triggers: &[Trigger], touched: &[String]) -> Vec<Trigger> {
    let mut seen = BTreeSet::new();
    let mut selected = Vec::new();
    for trigger in triggers {
        if seen.contains(&trigger.service) {
            continue;
        }
        let patterns: Vec<Regex> = trigger
            .match_lines
            .iter()
            .filter_map(|line| Regex::new(&format!("^(?:{})$", line)).ok())
            .collect();
        if touched
            .iter()
            .any(|path| patterns.iter().any(|pattern| pattern.is_match(path)))
        {
            seen.insert(trigger.service.clone());
            selected.push(trigger.clone());
        }
    }
    selected
}

async fn run_trigger(trigger: &Trigger, log: &Logger) -> Result<(), String> {
    let Some((program, args)) = trigger.command.split_first() else {
        return Err("empty command".to_string());
    };
    info!(log, "running trigger"; "service" => &trigger.service);
    match tokio::process::Command::new(program).args(args).status().await {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(format!("exited with {}", status)),
        Err(err) => Err(format!("failed to spawn: {}", err)),
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::MetadataExt;

    use camino::Utf8Path;
    use herd_common::logging::test_logger;
    use herd_common::ObjectHash;
    use herd_image::Trigger;
    use herd_protocol::subd::{
        DirectoryToMake, FileToWrite, SymlinkToMake, UpdateRequest,
    };
    use object_store::ObjectStore;

    use super::{apply_plan, triggers_to_run, UpdateError};

    struct Fixture {
        _root: camino_tempfile::Utf8TempDir,
        _data: camino_tempfile::Utf8TempDir,
        root: camino::Utf8PathBuf,
        object_dir: camino::Utf8PathBuf,
        uid: u32,
        gid: u32,
    }

    async fn fixture(objects: &[&[u8]]) -> Fixture {
        let root = camino_tempfile::tempdir().unwrap();
        let data = camino_tempfile::tempdir().unwrap();
        let object_dir = data.path().join("objects");
        let store = ObjectStore::open(&object_dir, &test_logger()).await.unwrap();
        for content in objects {
            store
                .add_object(content.len() as u64, None, &mut &content[..])
                .await
                .unwrap();
        }
        let meta = std::fs::metadata(root.path()).unwrap();
        Fixture {
            root: root.path().to_path_buf(),
            object_dir,
            uid: meta.uid(),
            gid: meta.gid(),
            _root: root,
            _data: data,
        }
    }

    fn file_to_write(fixture: &Fixture, path: &str, content: &[u8]) -> FileToWrite {
        FileToWrite {
            path: path.to_string(),
            hash: ObjectHash::of(content),
            mode: libc::S_IFREG as u32 | 0o644,
            uid: fixture.uid,
            gid: fixture.gid,
            mtime: 1_700_000_000,
        }
    }

    fn assert_mtime(path: &Utf8Path, mtime: i64) {
        assert_eq!(std::fs::metadata(path).unwrap().mtime(), mtime);
    }

    #[tokio::test]
    async fn plan_writes_directories_files_and_symlinks() {
        let fixture = fixture(&[b"welcome\n"]).await;
        let plan = UpdateRequest {
            image_name: "img".to_string(),
            directories_to_make: vec![DirectoryToMake {
                path: "/etc".to_string(),
                mode: libc::S_IFDIR as u32 | 0o755,
                uid: fixture.uid,
                gid: fixture.gid,
            }],
            files_to_write: vec![file_to_write(&fixture, "/etc/motd", b"welcome\n")],
            symlinks_to_make: vec![SymlinkToMake {
                path: "/etc/alias".to_string(),
                target: "motd".to_string(),
                uid: fixture.uid,
                gid: fixture.gid,
            }],
            ..Default::default()
        };

        let touched =
            apply_plan(&fixture.root, &fixture.object_dir, &plan).unwrap();
        assert_eq!(touched, ["/etc", "/etc/motd", "/etc/alias"]);
        let motd = fixture.root.join("etc/motd");
        assert_eq!(std::fs::read(&motd).unwrap(), b"welcome\n");
        assert_eq!(
            std::fs::metadata(&motd).unwrap().mode() & 0o7777,
            0o644
        );
        assert_mtime(&motd, 1_700_000_000);
        assert_eq!(
            std::fs::read_link(fixture.root.join("etc/alias")).unwrap(),
            std::path::PathBuf::from("motd")
        );
    }

    #[tokio::test]
    async fn reapplying_a_plan_is_a_no_op() {
        let fixture = fixture(&[b"stable"]).await;
        let plan = UpdateRequest {
            image_name: "img".to_string(),
            files_to_write: vec![file_to_write(&fixture, "/a", b"stable")],
            ..Default::default()
        };
        let touched =
            apply_plan(&fixture.root, &fixture.object_dir, &plan).unwrap();
        assert_eq!(touched, ["/a"]);
        let touched =
            apply_plan(&fixture.root, &fixture.object_dir, &plan).unwrap();
        assert!(touched.is_empty(), "second application must write nothing");
    }

    #[tokio::test]
    async fn missing_object_aborts_without_touching_the_target() {
        let fixture = fixture(&[]).await;
        let plan = UpdateRequest {
            image_name: "img".to_string(),
            files_to_write: vec![file_to_write(&fixture, "/a", b"never uploaded")],
            ..Default::default()
        };
        let err =
            apply_plan(&fixture.root, &fixture.object_dir, &plan).unwrap_err();
        assert!(matches!(err, UpdateError::MissingObject(_)));
        assert!(!fixture.root.join("a").exists());
    }

    #[tokio::test]
    async fn deletes_remove_whole_subtrees() {
        let fixture = fixture(&[]).await;
        std::fs::create_dir_all(fixture.root.join("junk/deep")).unwrap();
        std::fs::write(fixture.root.join("junk/deep/file"), b"x").unwrap();
        let plan = UpdateRequest {
            image_name: "img".to_string(),
            paths_to_delete: vec!["/junk".to_string()],
            ..Default::default()
        };
        let touched =
            apply_plan(&fixture.root, &fixture.object_dir, &plan).unwrap();
        assert_eq!(touched, ["/junk"]);
        assert!(!fixture.root.join("junk").exists());
    }

    #[tokio::test]
    async fn shared_cache_entries_are_copied_not_corrupted() {
        let fixture = fixture(&[b"shared content"]).await;
        // Two targets with different modes drawing from one object.
        let mut restrictive = file_to_write(&fixture, "/secret", b"shared content");
        restrictive.mode = libc::S_IFREG as u32 | 0o600;
        let plan = UpdateRequest {
            image_name: "img".to_string(),
            files_to_write: vec![
                file_to_write(&fixture, "/public", b"shared content"),
                restrictive,
            ],
            ..Default::default()
        };
        apply_plan(&fixture.root, &fixture.object_dir, &plan).unwrap();
        let public = std::fs::metadata(fixture.root.join("public")).unwrap();
        let secret = std::fs::metadata(fixture.root.join("secret")).unwrap();
        assert_eq!(public.mode() & 0o7777, 0o644);
        assert_eq!(secret.mode() & 0o7777, 0o600);
    }

    #[test]
    fn triggers_match_touched_paths_and_deduplicate() {
        let triggers = vec![
            Trigger {
                service: "app".to_string(),
                match_lines: vec!["/etc(/.*)?".to_string()],
                command: vec!["true".to_string()],
            },
            Trigger {
                service: "app".to_string(),
                match_lines: vec!["/etc/other".to_string()],
                command: vec!["true".to_string()],
            },
            Trigger {
                service: "db".to_string(),
                match_lines: vec!["/var/db(/.*)?".to_string()],
                command: vec!["true".to_string()],
            },
        ];
        let touched = vec!["/etc/motd".to_string()];
        let selected = triggers_to_run(&triggers, &touched);
        let services: Vec<&str> =
            selected.iter().map(|t| t.service.as_str()).collect();
        assert_eq!(services, ["app"]);
    }
}
