// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logger construction shared by every daemon. Each binary deserializes a
//! [`LoggingConfig`] from its config file and builds its root logger from
//! it; components derive child loggers with `log.new(o!(...))`.

use serde::Deserialize;
use slog::{o, Drain, Logger};

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl From<LogLevel> for slog::Level {
    fn from(level: LogLevel) -> slog::Level {
        match level {
            LogLevel::Trace => slog::Level::Trace,
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Warning => slog::Level::Warning,
            LogLevel::Error => slog::Level::Error,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: LogLevel,
}

fn default_level() -> LogLevel {
    LogLevel::Info
}

impl Default for LoggingConfig {
    fn default() -> LoggingConfig {
        LoggingConfig { level: default_level() }
    }
}

impl LoggingConfig {
    /// Build a root logger writing human-readable records to stderr.
    pub fn to_logger(&self, name: &'static str) -> Logger {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog::LevelFilter::new(drain, self.level.into()).fuse();
        let drain = slog_async::Async::new(drain).chan_size(4096).build().fuse();
        Logger::root(drain, o!("name" => name, "pid" => std::process::id()))
    }
}

/// A synchronous stdout logger for tests. Synchronous so nothing is lost
/// when a test panics.
pub fn test_logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}
