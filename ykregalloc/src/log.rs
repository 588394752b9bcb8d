//! The implementation of the `YKD_LOG_REGALLOC` environment variable.
//!
//! The allocator never logs through global state: a [Log] is handed to
//! [crate::allocate_registers] and everything it reports goes there.

use crate::RegAllocError;
use parking_lot::Mutex;
use std::{env, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

/// How verbose should the register allocator's logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log the start of each allocation phase.
    Phase,
    /// Log every allocation decision.
    Trace,
}

enum Sink {
    Stderr,
    /// Append to the file at this path.
    File(PathBuf),
    /// Keep lines in memory until [Log::take_lines] is called.
    Buffer(Mutex<Vec<String>>),
}

pub struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    sink: Sink,
}

impl Log {
    /// Configure logging from `YKD_LOG_REGALLOC`, which must be of the format
    /// `[<path|->:]<level>`. If it is not set, only errors are logged, to stderr.
    pub fn from_env() -> Result<Self, RegAllocError> {
        match env::var("YKD_LOG_REGALLOC") {
            Ok(s) => {
                let (sink, level) = match s.split(':').collect::<Vec<_>>()[..] {
                    [path, level] => {
                        if path == "-" {
                            (Sink::Stderr, level)
                        } else {
                            let path = PathBuf::from(path);
                            // If there's an existing log file, truncate (i.e. empty it), so that
                            // later appends to the log aren't appending to a previous log run.
                            File::create(&path).ok();
                            (Sink::File(path), level)
                        }
                    }
                    [level] => (Sink::Stderr, level),
                    [..] => {
                        return Err(RegAllocError::InvalidOption(
                            "YKD_LOG_REGALLOC must be of the format `[<path|->:]<level>`".into(),
                        ))
                    }
                };
                let level = level.parse::<u8>().map_err(|e| {
                    RegAllocError::InvalidOption(format!(
                        "Invalid YKD_LOG_REGALLOC level '{s}': {e}"
                    ))
                })?;
                // This unwrap can only fail dynamically if we've got the types wrong statically
                // (i.e. it'll fail as soon as this code is executed for the first time).
                let max_level = u8::try_from(Verbosity::COUNT).unwrap() - 1;
                let level = Verbosity::from_repr(level).ok_or_else(|| {
                    RegAllocError::InvalidOption(format!(
                        "YKD_LOG_REGALLOC level {level} exceeds maximum {max_level}"
                    ))
                })?;
                Ok(Self { level, sink })
            }
            Err(_) => Ok(Self::stderr(Verbosity::Error)),
        }
    }

    /// A log that discards everything.
    pub fn disabled() -> Self {
        Self {
            level: Verbosity::Disabled,
            sink: Sink::Stderr,
        }
    }

    pub fn stderr(level: Verbosity) -> Self {
        Self {
            level,
            sink: Sink::Stderr,
        }
    }

    /// A log that keeps messages in memory: retrieve them with [Self::take_lines].
    pub fn buffered(level: Verbosity) -> Self {
        Self {
            level,
            sink: Sink::Buffer(Mutex::new(Vec::new())),
        }
    }

    /// Would a message at `level` be logged?
    pub fn enabled(&self, level: Verbosity) -> bool {
        level != Verbosity::Disabled && level <= self.level
    }

    /// Log `msg` with the [Verbosity] level `verbosity`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "regalloc-error",
                Verbosity::Warning => "regalloc-warning",
                Verbosity::Phase => "regalloc-phase",
                Verbosity::Trace => "regalloc-trace",
            };
            match &self.sink {
                Sink::File(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                Sink::Stderr => {
                    eprintln!("{prefix}: {msg}");
                }
                Sink::Buffer(b) => b.lock().push(format!("{prefix}: {msg}")),
            }
        }
    }

    /// Remove and return every line logged so far. Only buffered logs keep lines: other logs
    /// return an empty `Vec`.
    pub fn take_lines(&self) -> Vec<String> {
        match &self.sink {
            Sink::Buffer(b) => std::mem::take(&mut *b.lock()),
            _ => Vec::new(),
        }
    }
}

/// Log a [Verbosity::Trace] message, only formatting it if it will actually be logged.
macro_rules! ra_trace {
    ($log:expr, $($arg:tt)*) => {
        if $log.enabled($crate::log::Verbosity::Trace) {
            $log.log($crate::log::Verbosity::Trace, &format!($($arg)*));
        }
    };
}

pub(crate) use ra_trace;
