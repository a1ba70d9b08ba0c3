// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The machine database: an external JSON file mapping hostnames to
//! required and planned images, watched for changes.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use slog::{debug, warn, Logger};

use crate::Herd;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub hostname: String,
    #[serde(default)]
    pub required_image: String,
    #[serde(default)]
    pub planned_image: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MdbError {
    #[error("failed to read machine database `{path}`")]
    Read {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to parse machine database `{path}`")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },
}

/// Load and canonicalize the machine list: sorted by hostname, first
/// entry wins on duplicates.
pub fn load_machine_list(path: &Utf8Path) -> Result<Vec<Machine>, MdbError> {
    let contents = std::fs::read_to_string(path).map_err(|err| MdbError::Read {
        path: path.to_path_buf(),
        err,
    })?;
    let mut machines: Vec<Machine> =
        serde_json::from_str(&contents).map_err(|err| MdbError::Parse {
            path: path.to_path_buf(),
            err,
        })?;
    machines.sort_by(|a, b| a.hostname.cmp(&b.hostname));
    machines.dedup_by(|a, b| a.hostname == b.hostname);
    Ok(machines)
}

/// Re-read the database whenever its mtime moves.
pub async fn run_watcher(herd: Arc<Herd>, path: Utf8PathBuf, log: Logger) {
    let mut last_modified: Option<SystemTime> = None;
    loop {
        match std::fs::metadata(&path).and_then(|meta| meta.modified()) {
            Ok(modified) if Some(modified) != last_modified => {
                match load_machine_list(&path) {
                    Ok(machines) => {
                        last_modified = Some(modified);
                        herd.update_fleet(machines);
                    }
                    Err(err) => {
                        warn!(log, "machine database unusable";
                            "path" => path.as_str(), "error" => %err);
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                debug!(log, "machine database not readable";
                    "path" => path.as_str(), "error" => %err);
            }
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

#[cfg(test)]
mod test {
    use super::{load_machine_list, Machine};

    #[test]
    fn loads_sorted_and_deduplicated() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("mdb.json");
        std::fs::write(
            &path,
            r#"[
                {"hostname": "b.example", "required_image": "img-2"},
                {"hostname": "a.example", "required_image": "img-1",
                 "planned_image": "img-2"},
                {"hostname": "b.example", "required_image": "ignored"}
            ]"#,
        )
        .unwrap();
        let machines = load_machine_list(&path).unwrap();
        assert_eq!(
            machines,
            vec![
                Machine {
                    hostname: "a.example".to_string(),
                    required_image: "img-1".to_string(),
                    planned_image: "img-2".to_string(),
                },
                Machine {
                    hostname: "b.example".to_string(),
                    required_image: "img-2".to_string(),
                    planned_image: String::new(),
                },
            ]
        );
    }

    #[test]
    fn rejects_malformed_json() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("mdb.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_machine_list(&path).is_err());
    }
}
