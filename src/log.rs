//! File logging for orchestration runs.
//!
//! Lines go to `~/.lanes/lanes.log` (or the path given to [`init_at`]) as
//! `<time> <LEVEL> <message>`. What each level carries:
//!
//! - ERROR: aborted runs, budget exhaustion
//! - WARN: rejected lanes, permission denials, conflicts, halts
//! - INFO: run start and finish, batch dispatch
//! - DEBUG: every orchestration event and lane transition
//! - TRACE: raw model payloads
//!
//! The level is INFO unless `--debug`, `LANES_DEBUG=1` or
//! `LANES_LOG=<level>` raise (or lower) it. Nothing is written before
//! [`init`] or [`init_at`] runs, so library users and tests stay silent.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use crate::Error;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn current() -> Self {
        let raw = LOG_LEVEL.load(Ordering::Relaxed);
        LogLevel::ALL
            .into_iter()
            .find(|l| *l as u8 == raw)
            .unwrap_or(LogLevel::Trace)
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        LogLevel::ALL
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::Validation(format!("unknown log level '{}'", s)))
    }
}

/// Level from the `--debug` flag and the `LANES_DEBUG` / `LANES_LOG`
/// values. An explicit, valid `LANES_LOG` wins.
fn resolve_level(debug: bool, env_debug: Option<&str>, env_level: Option<&str>) -> LogLevel {
    if let Some(level) = env_level.and_then(|v| v.parse().ok()) {
        return level;
    }
    let env_debug = env_debug.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Log to `~/.lanes/lanes.log`.
pub fn init(debug: bool) {
    if let Some(dir) = dirs::home_dir().map(|h| h.join(".lanes")) {
        if std::fs::create_dir_all(&dir).is_ok() {
            init_at(dir.join("lanes.log"), debug);
        }
    }
}

/// Log to `path`, truncating it. Only the first call sets the path.
pub fn init_at(path: PathBuf, debug: bool) {
    let level = resolve_level(
        debug,
        std::env::var("LANES_DEBUG").ok().as_deref(),
        std::env::var("LANES_LOG").ok().as_deref(),
    );
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);

    if LOG_PATH.get().is_none() && std::fs::write(&path, "").is_ok() {
        let _ = LOG_PATH.set(path);
    }
}

pub fn path() -> Option<&'static Path> {
    LOG_PATH.get().map(PathBuf::as_path)
}

pub fn enabled(level: LogLevel) -> bool {
    LOG_PATH.get().is_some() && level <= LogLevel::current()
}

pub fn log_at(level: LogLevel, msg: &str) {
    if !enabled(level) {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
        let _ = writeln!(file, "{} {:<5} {}", timestamp, level.as_str(), msg);
    }
}

#[macro_export]
macro_rules! llog {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! llog_error {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! llog_warn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

/// DEBUG line; the message is only formatted when DEBUG is enabled.
#[macro_export]
macro_rules! llog_debug {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Debug) {
            $crate::log::log_at($crate::log::LogLevel::Debug, &format!($($arg)*))
        }
    };
}

/// TRACE line; the message is only formatted when TRACE is enabled.
#[macro_export]
macro_rules! llog_trace {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Trace) {
            $crate::log::log_at($crate::log::LogLevel::Trace, &format!($($arg)*))
        }
    };
}
