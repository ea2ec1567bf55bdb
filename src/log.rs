//! Kernel log for kipc
//!
//! Records are formatted into fixed-size buffers and kept in a ring so logging
//! never allocates. An optional sink forwards every accepted record to a
//! console or serial backend owned by the embedding kernel.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use heapless::{Deque, String};
use spin::Mutex;

/// Maximum formatted length of one record; longer text is truncated
pub const LOG_LINE_MAX: usize = 120;

/// Number of records retained in the ring
pub const LOG_RING_SIZE: usize = 128;

/// Log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
        }
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

/// One formatted log entry
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub seq: u64,
    pub level: LogLevel,
    pub origin: &'static str,
    pub text: String<LOG_LINE_MAX>,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] [{}] {}", self.level.as_str(), self.origin, self.text)
    }
}

/// Sink receiving every accepted record. Called with the log unlocked, so a
/// sink may log itself.
pub type LogSink = fn(&LogRecord);

struct KernelLog {
    ring: Deque<LogRecord, LOG_RING_SIZE>,
    sink: Option<LogSink>,
}

impl KernelLog {
    const fn new() -> Self {
        Self {
            ring: Deque::new(),
            sink: None,
        }
    }

    fn push(&mut self, record: LogRecord) {
        if self.ring.is_full() {
            self.ring.pop_front();
        }
        // Cannot fail: a slot was freed above
        let _ = self.ring.push_back(record);
    }
}

static LOG: Mutex<KernelLog> = Mutex::new(KernelLog::new());
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Debug as u8);
static SEQ: AtomicU64 = AtomicU64::new(0);
static COUNTS: [AtomicU64; 4] = [
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
];

/// Set the minimum level; records below it are dropped before formatting
pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::Relaxed))
}

/// Install (or remove) the output sink
pub fn set_sink(sink: Option<LogSink>) {
    LOG.lock().sink = sink;
}

/// Number of records accepted at `level` since boot
pub fn count(level: LogLevel) -> u64 {
    COUNTS[level as usize].load(Ordering::Relaxed)
}

/// Copy of the records currently retained, oldest first
pub fn recent() -> alloc::vec::Vec<LogRecord> {
    LOG.lock().ring.iter().cloned().collect()
}

/// Record a message. Use the `logd!`/`logi!`/`logw!`/`loge!` macros instead.
pub fn log(level: LogLevel, origin: &'static str, args: fmt::Arguments) {
    if level < self::level() {
        return;
    }

    let mut text = String::new();
    // Overlong text is truncated, not an error
    let _ = text.write_fmt(args);

    let record = LogRecord {
        seq: SEQ.fetch_add(1, Ordering::Relaxed),
        level,
        origin,
        text,
    };

    COUNTS[level as usize].fetch_add(1, Ordering::Relaxed);
    let sink = {
        let mut log = LOG.lock();
        log.push(record.clone());
        log.sink
    };
    if let Some(sink) = sink {
        sink(&record);
    }
}

/// Debug-level kernel log
#[macro_export]
macro_rules! logd {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::log($crate::log::LogLevel::Debug, $origin, format_args!($($arg)*))
    };
}

/// Info-level kernel log
#[macro_export]
macro_rules! logi {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::log($crate::log::LogLevel::Info, $origin, format_args!($($arg)*))
    };
}

/// Warning-level kernel log
#[macro_export]
macro_rules! logw {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::log($crate::log::LogLevel::Warn, $origin, format_args!($($arg)*))
    };
}

/// Error-level kernel log
#[macro_export]
macro_rules! loge {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::log($crate::log::LogLevel::Error, $origin, format_args!($($arg)*))
    };
}
