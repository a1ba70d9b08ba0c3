// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations with exponential backoff.
//!
//! These retry policies should be used when attempting to access some
//! loosely-coupled component which may transiently fail due to:
//! - A service which is still asynchronously initializing
//! - An inaccessible network
//! - An overloaded server

use std::time::Duration;

pub use ::backoff::future::retry;
pub use ::backoff::Error as BackoffError;
pub use ::backoff::ExponentialBackoff;

/// Return a backoff policy for transient I/O inside a scoped operation.
///
/// This policy retries aggressively (starting at 1 ms, doubling, capped at
/// a 100 ms interval) but gives up after a few seconds so the failure
/// surfaces to the caller as a failed operation instead of wedging a
/// worker indefinitely.
pub fn retry_policy_transient() -> ExponentialBackoff {
    ::backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(1))
        .with_multiplier(2.0)
        .with_max_interval(Duration::from_millis(100))
        .with_max_elapsed_time(Some(Duration::from_secs(5)))
        .build()
}
