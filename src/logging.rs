//! Structured logging for the sync engine.
//!
//! Provides the [`mlog!`] macro for consistent log output in the format:
//!
//! ```text
//! 20260805T14:02:51.310 - src/store.rs:210 - store: put_message failed: ...
//! ```
//!
//! When stderr is a terminal, timestamps and source locations are dimmed and
//! user/conversation/message ids are coloured deterministically so the same
//! id always renders the same way across a session.
//!
//! Log lines go to stderr by default.  The embedding application can call
//! [`set_writer`] to redirect output to any [`std::io::Write`] implementor;
//! installing a custom writer also disables ANSI colour codes.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::SystemTime;

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Initialize the logging system. Call once at startup before any logging.
/// Detects whether stderr supports ANSI colours.
pub fn init() {
    COLOUR_ENABLED.store(io::stderr().is_terminal(), Ordering::Relaxed);
}

/// Replace the log writer.  All subsequent [`mlog!`] output goes to `w`.
/// Colour codes are disabled, since the new writer is unlikely to be a
/// terminal.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    *LOG_WRITER.lock().unwrap() = w;
}

fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

/// Bright foreground colours used for id hashing.
const ID_COLOURS: &[&str] = &[
    "\x1b[91m", "\x1b[92m", "\x1b[93m", "\x1b[94m", "\x1b[95m", "\x1b[96m",
];

fn hash_colour(id: &str) -> &'static str {
    let hash: u32 = id
        .bytes()
        .fold(5381u32, |acc, b| acc.wrapping_mul(33).wrapping_add(b as u32));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

const ID_TRUNCATE_LEN: usize = 8;

fn truncate_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(ID_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

fn tagged(tag: char, id: &str) -> String {
    let short = truncate_id(id);
    if colour_enabled() {
        let colour = hash_colour(id);
        format!("{colour}{tag}:{short}{RESET}")
    } else {
        format!("{tag}:{short}")
    }
}

/// Format a user id with consistent colour and truncation, e.g. `u:a81f02c9`.
pub fn user_id(id: &str) -> String {
    tagged('u', id)
}

/// Format a conversation id, e.g. `c:u1:u2`.
pub fn conv_id(id: &str) -> String {
    tagged('c', id)
}

/// Format a message id, e.g. `m:9f31bb04`.
pub fn msg_id(id: &str) -> String {
    tagged('m', id)
}

/// Format the current wall-clock time as `YYYYMMDDTHH:MM:SS.mmm`.
///
/// Civil date from days since epoch (Howard Hinnant's algorithm), so the
/// crate carries no date-time dependency for a single format.
pub fn format_timestamp() -> String {
    let duration = SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    let time_secs = secs % 86400;
    let days = (secs / 86400) as i64;
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!(
        "{:04}{:02}{:02}T{:02}:{:02}:{:02}.{:03}",
        y,
        m,
        d,
        time_secs / 3600,
        (time_secs % 3600) / 60,
        time_secs % 60,
        millis
    )
}

/// Write a single log line to the current writer.
///
/// Called by the [`mlog!`] macro; not intended for direct use.
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = format_timestamp();
    let formatted = if colour_enabled() {
        format!("{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {msg}")
    };
    let mut writer = LOG_WRITER.lock().unwrap();
    let _ = writeln!(*writer, "{formatted}");
}

/// Emit a log line with timestamp and source location.
///
/// ```ignore
/// mlog!("sync: applied {} record(s)", count);
/// mlog!("store: put_message {} failed", logging::msg_id(&id));
/// ```
#[macro_export]
macro_rules! mlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}
