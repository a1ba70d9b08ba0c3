// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fleet model: the map of sub records, the image cache and the
//! process-wide worker and fetch semaphores. Mutation happens in short
//! critical sections under one mutex; workers never hold it across I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use herd_protocol::dominator::SubInfo;
use slog::{info, o, Logger};
use tokio::sync::Semaphore;

use crate::images::ImageCache;
use crate::mdb::Machine;
use crate::sub::{SubRecord, SubStatus};
use crate::Config;

pub struct Herd {
    pub(crate) log: Logger,
    config: Config,
    fleet: Mutex<BTreeMap<String, SubRecord>>,
    pub(crate) images: ImageCache,
    /// Non-empty while updates are disabled fleet-wide.
    disabled_reason: Mutex<String>,
    pub(crate) worker_slots: Arc<Semaphore>,
    pub(crate) fetch_slots: Arc<Semaphore>,
}

impl Herd {
    pub fn new(config: Config, log: &Logger) -> Herd {
        let log = log.new(o!("component" => "herd"));
        let images = ImageCache::new(&config.image_server_address, &log);
        let worker_slots = Arc::new(Semaphore::new(config.max_workers));
        let fetch_slots = Arc::new(Semaphore::new(config.max_concurrent_fetches));
        Herd {
            log,
            config,
            fleet: Mutex::new(BTreeMap::new()),
            images,
            disabled_reason: Mutex::new(String::new()),
            worker_slots,
            fetch_slots,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replace the fleet membership from a machine-database snapshot.
    /// Existing records survive with their state; new hosts get fresh
    /// records; vanished hosts are destroyed (their in-flight worker, if
    /// any, finishes harmlessly). Images no longer referenced by any
    /// required or planned field are evicted, and referenced ones are
    /// preloaded.
    pub fn update_fleet(self: &Arc<Self>, machines: Vec<Machine>) {
        let mut num_new = 0;
        let num_removed;
        let mut referenced = BTreeSet::new();
        {
            let mut fleet = self.fleet.lock().unwrap();
            let mut next = BTreeMap::new();
            for machine in machines {
                if !machine.required_image.is_empty() {
                    referenced.insert(machine.required_image.clone());
                }
                if !machine.planned_image.is_empty() {
                    referenced.insert(machine.planned_image.clone());
                }
                let mut record =
                    fleet.remove(&machine.hostname).unwrap_or_else(|| {
                        num_new += 1;
                        SubRecord::new(&machine.hostname)
                    });
                record.required_image = machine.required_image;
                record.planned_image = machine.planned_image;
                next.insert(machine.hostname, record);
            }
            num_removed = fleet.len();
            *fleet = next;
        }
        self.images.retain(&referenced);
        for name in referenced {
            let herd = Arc::clone(self);
            tokio::spawn(async move {
                // Preload; a failure here just defers to the workers.
                let _ = herd.images.get(&name).await;
            });
        }
        info!(self.log, "fleet updated";
            "subs" => self.fleet.lock().unwrap().len(),
            "new" => num_new, "removed" => num_removed);
    }

    pub fn disable_updates(&self, reason: &str) {
        *self.disabled_reason.lock().unwrap() = reason.to_string();
        info!(self.log, "updates disabled"; "reason" => reason);
    }

    pub fn enable_updates(&self) {
        self.disabled_reason.lock().unwrap().clear();
        info!(self.log, "updates enabled");
    }

    pub fn updates_disabled(&self) -> Option<String> {
        let reason = self.disabled_reason.lock().unwrap();
        if reason.is_empty() {
            None
        } else {
            Some(reason.clone())
        }
    }

    /// Clear the named sub's backoff so the next tick polls it.
    pub fn poll_sub_now(&self, hostname: &str) -> bool {
        self.with_sub(hostname, |sub| sub.next_poll_at = Instant::now()).is_some()
    }

    pub fn sub_infos(&self) -> Vec<SubInfo> {
        self.fleet.lock().unwrap().values().map(SubRecord::info).collect()
    }

    /// Current status and note of one sub; mainly for tests and views.
    pub fn sub_status(&self, hostname: &str) -> Option<(SubStatus, String)> {
        self.with_sub(hostname, |sub| (sub.status, sub.last_note.clone()))
    }

    /// Run `f` against the named record, if it still exists.
    pub(crate) fn with_sub<R>(
        &self,
        hostname: &str,
        f: impl FnOnce(&mut SubRecord) -> R,
    ) -> Option<R> {
        self.fleet.lock().unwrap().get_mut(hostname).map(f)
    }

    /// Hostnames that are idle and past their backoff.
    pub(crate) fn due_subs(&self) -> Vec<String> {
        let now = Instant::now();
        self.fleet
            .lock()
            .unwrap()
            .values()
            .filter(|sub| !sub.busy && sub.next_poll_at <= now)
            .map(|sub| sub.hostname.clone())
            .collect()
    }
}
