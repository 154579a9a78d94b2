//! File logging for conductor.
//!
//! Log levels:
//! - ERROR: Failures that abort an operation (store unavailable, emergency exit)
//! - WARN: Recoverable anomalies (worker failure, merge conflict, blocked exit)
//! - INFO: Run lifecycle (startup, level start, shutdown)
//! - DEBUG: Scheduling decisions and state transitions
//! - TRACE: Worker payloads and raw command output
//!
//! Debug mode can be enabled with `--debug` or `CONDUCTOR_DEBUG=1`.
//!
//! Pool tasks log from many blocking threads at once, so every line goes
//! through one shared handle and carries the writing thread's name.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

static SINK: OnceLock<(PathBuf, Mutex<File>)> = OnceLock::new();
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
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Log to ~/.conductor/conductor.log at INFO.
pub fn init() {
    init_with_debug(false);
}

/// Log to ~/.conductor/conductor.log, at DEBUG when `debug` is set or the
/// environment asks for it. Failing to open the file leaves logging off.
pub fn init_with_debug(debug: bool) {
    let debug = debug || debug_from_env(std::env::var("CONDUCTOR_DEBUG").ok().as_deref());
    if let Some(dir) = dirs::home_dir().map(|h| h.join(".conductor")) {
        let _ = init_at(&dir.join("conductor.log"), debug);
    }
}

/// Open `path` (truncated) as the log sink. Only the first call in a
/// process installs a sink; later calls just adjust the level.
pub fn init_at(path: &Path, debug: bool) -> io::Result<()> {
    set_level(if debug { LogLevel::Debug } else { LogLevel::Info });
    if SINK.get().is_some() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let _ = SINK.set((path.to_path_buf(), Mutex::new(file)));
    Ok(())
}

fn debug_from_env(value: Option<&str>) -> bool {
    matches!(value.map(str::to_ascii_lowercase).as_deref(), Some("1" | "true"))
}

/// Where log lines are going, if anywhere.
pub fn log_path() -> Option<&'static Path> {
    SINK.get().map(|(path, _)| path.as_path())
}

pub fn is_debug() -> bool {
    get_level() >= LogLevel::Debug
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }
    let Some((_, file)) = SINK.get() else {
        return;
    };
    let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
    let thread = std::thread::current();
    let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
    let _ = writeln!(
        file,
        "[{}] [{}] [{}] {}",
        timestamp,
        level.as_str(),
        thread.name().unwrap_or("-"),
        msg
    );
}

pub fn log(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// Log at INFO level.
#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        $crate::log::log(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Log at DEBUG level (only written in debug mode).
#[macro_export]
macro_rules! clog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
