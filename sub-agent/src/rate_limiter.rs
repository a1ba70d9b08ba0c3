// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-rate throttling for content hashing.
//!
//! The scanner hashes every regular file it has not seen before; on a
//! busy machine that must not saturate the disk. The limiter paces a
//! consumer against a bytes-per-second budget; a zero budget means
//! unlimited. The budget can be replaced at any time (the fetch pipeline
//! initializes it from a measured transfer).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub struct RateLimiter {
    max_bytes_per_sec: AtomicU64,
}

impl RateLimiter {
    pub fn new(max_bytes_per_sec: u64) -> RateLimiter {
        RateLimiter { max_bytes_per_sec: AtomicU64::new(max_bytes_per_sec) }
    }

    pub fn set_speed(&self, max_bytes_per_sec: u64) {
        self.max_bytes_per_sec.store(max_bytes_per_sec, Ordering::Relaxed);
    }

    pub fn speed(&self) -> u64 {
        self.max_bytes_per_sec.load(Ordering::Relaxed)
    }

    /// Start a pacing session. Consumption is measured against the time
    /// since the session began.
    pub fn start_session(&self) -> Pacer<'_> {
        Pacer { limiter: self, started: Instant::now(), consumed: 0 }
    }
}

/// Tracks one consumer's progress and sleeps it into compliance.
/// Blocking: only for use on scanner (spawn_blocking) threads.
pub struct Pacer<'a> {
    limiter: &'a RateLimiter,
    started: Instant,
    consumed: u64,
}

impl Pacer<'_> {
    pub fn consume(&mut self, bytes: usize) {
        self.consumed += bytes as u64;
        let rate = self.limiter.speed();
        if rate == 0 {
            return;
        }
        let budget_elapsed = self.consumed as f64 / rate as f64;
        let elapsed = self.started.elapsed().as_secs_f64();
        if budget_elapsed > elapsed {
            std::thread::sleep(Duration::from_secs_f64(budget_elapsed - elapsed));
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use super::RateLimiter;

    #[test]
    fn unlimited_never_sleeps() {
        let limiter = RateLimiter::new(0);
        let mut pacer = limiter.start_session();
        let started = Instant::now();
        for _ in 0..1000 {
            pacer.consume(1 << 20);
        }
        assert!(started.elapsed().as_millis() < 100);
    }

    #[test]
    fn limited_paces_consumption() {
        // 1 MiB/s budget, 100 KiB consumed: should take roughly 100 ms.
        let limiter = RateLimiter::new(1 << 20);
        let mut pacer = limiter.start_session();
        let started = Instant::now();
        for _ in 0..10 {
            pacer.consume(10 * 1024);
        }
        let elapsed = started.elapsed();
        assert!(elapsed.as_millis() >= 80, "finished too fast: {:?}", elapsed);
    }
}
