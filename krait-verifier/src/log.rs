//! Bounded diagnostic log.
//!
//! Rejection diagnostics and state traces go through a level-gated buffer
//! owned by the verifier instance. The transport of the buffer is the
//! caller's concern; the verifier only formats into it.

use core::fmt;
use core::fmt::Write as _;

use crate::consts::LOG_BUF_CAP;

/// How much the verifier says while analyzing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Nothing but the final diagnostic of a rejection.
    #[default]
    Off = 0,
    /// Per-instruction trace with register summaries.
    Info = 1,
    /// Full state dumps at forks, prunes, and checkpoints.
    Debug = 2,
}

/// Level-gated, size-bounded text log.
#[derive(Debug, Default)]
pub struct VerifierLog {
    level: LogLevel,
    buf: String,
    cap: usize,
    truncated: bool,
}

impl VerifierLog {
    /// Create a log at the given level with the default capacity.
    pub fn new(level: LogLevel) -> Self {
        Self::with_capacity(level, LOG_BUF_CAP)
    }

    /// Create a log with an explicit byte capacity.
    pub fn with_capacity(level: LogLevel, cap: usize) -> Self {
        Self {
            level,
            buf: String::new(),
            cap,
            truncated: false,
        }
    }

    /// Active level.
    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// Whether messages at `level` are recorded.
    pub fn enabled(&self, level: LogLevel) -> bool {
        self.level >= level && level > LogLevel::Off
    }

    /// Whether output was dropped for lack of space.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Append one line, regardless of level. Used for final diagnostics.
    pub fn line(&mut self, args: fmt::Arguments<'_>) {
        if self.buf.len() >= self.cap {
            self.truncated = true;
            return;
        }
        // Writing to a String cannot fail.
        let _ = self.buf.write_fmt(args);
        self.buf.push('\n');
        if self.buf.len() > self.cap {
            self.buf.truncate(self.cap);
            self.truncated = true;
        }
    }

    /// Append one line when `level` is enabled.
    pub fn say(&mut self, level: LogLevel, args: fmt::Arguments<'_>) {
        if self.enabled(level) {
            self.line(args);
        }
    }

    /// Rendered contents.
    pub fn contents(&self) -> &str {
        &self.buf
    }

    /// Give up the buffer.
    pub fn into_contents(self) -> String {
        self.buf
    }
}

/// Record a line at [`LogLevel::Info`].
macro_rules! vlog {
    ($log:expr, $($arg:tt)*) => {
        $log.say($crate::log::LogLevel::Info, format_args!($($arg)*))
    };
}

/// Record a line at [`LogLevel::Debug`].
macro_rules! vtrace {
    ($log:expr, $($arg:tt)*) => {
        $log.say($crate::log::LogLevel::Debug, format_args!($($arg)*))
    };
}

pub(crate) use vlog;
pub(crate) use vtrace;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gating() {
        let mut log = VerifierLog::new(LogLevel::Info);
        vlog!(log, "visible {}", 1);
        vtrace!(log, "hidden");
        assert_eq!(log.contents(), "visible 1\n");
    }

    #[test]
    fn truncation() {
        let mut log = VerifierLog::with_capacity(LogLevel::Info, 8);
        vlog!(log, "0123456789");
        vlog!(log, "more");
        assert!(log.is_truncated());
        assert!(log.contents().len() <= 8);
    }

    #[test]
    fn final_diagnostic_ignores_level() {
        let mut log = VerifierLog::new(LogLevel::Off);
        log.line(format_args!("R0 invalid mem access"));
        assert_eq!(log.contents(), "R0 invalid mem access\n");
    }
}
