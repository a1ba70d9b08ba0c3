// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types and utilities shared by every component of the fleet platform:
//! the content-address digest, retry policies, logging setup and the
//! command-line dispatch table used by the admin tools.

pub mod backoff;
pub mod cli;
pub mod hash;
pub mod logging;

pub use hash::ObjectHash;
