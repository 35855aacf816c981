//! Logging and output control
//!
//! This module provides the [`Logger`] for controlling output verbosity and
//! formatting. A logger is passed explicitly to every component that reports
//! progress; nothing in the crate writes through a global logger.
//!
//! [`Logger::capturing`] additionally records every message as a [`LogEvent`]
//! so callers (mostly tests) can assert on warnings emitted while resolving
//! sync sources.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
}

/// Shared handle to the events recorded by a capturing [`Logger`]
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<LogEvent>>>,
}

impl LogCapture {
    fn record(&self, level: LogLevel, message: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.push(LogEvent {
                level,
                message: message.to_string(),
            });
        }
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Messages recorded at exactly `level`
    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.level == level)
            .map(|e| e.message)
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.messages(LogLevel::Warning)
    }

    pub fn errors(&self) -> Vec<String> {
        self.messages(LogLevel::Error)
    }
}

/// Logger responsible for all user-visible output
#[derive(Debug, Clone)]
pub struct Logger {
    pub verbose: bool,
    pub quiet: bool,
    capture: Option<LogCapture>,
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            quiet: false,
            capture: None,
        }
    }

    pub fn new_quiet() -> Self {
        Self {
            verbose: false,
            quiet: true,
            capture: None,
        }
    }

    /// A quiet logger that records every message, including verbose ones
    pub fn capturing() -> (Self, LogCapture) {
        let capture = LogCapture::default();
        let logger = Self {
            verbose: true,
            quiet: true,
            capture: Some(capture.clone()),
        };
        (logger, capture)
    }

    fn record(&self, level: LogLevel, message: &str) {
        if let Some(capture) = &self.capture {
            capture.record(level, message);
        }
    }

    /// Main section heading
    pub fn section(&self, title: &str) {
        if !self.quiet {
            println!("\n=== {} ===", title);
        }
    }

    /// Sub-section heading
    pub fn subsection(&self, title: &str) {
        if !self.quiet {
            println!("\n--- {} ---", title);
        }
    }

    pub fn trace(&self, message: &str) {
        self.record(LogLevel::Trace, message);
        if self.verbose && !self.quiet {
            println!("🔍 TRACE: {}", message);
        }
    }

    pub fn debug(&self, message: &str) {
        self.record(LogLevel::Debug, message);
        if self.verbose && !self.quiet {
            println!("🐛 DEBUG: {}", message);
        }
    }

    pub fn verbose(&self, message: &str) {
        self.record(LogLevel::Debug, message);
        if self.verbose && !self.quiet {
            println!("📝 {}", message);
        }
    }

    /// Information message
    pub fn info(&self, message: &str) {
        self.record(LogLevel::Info, message);
        if !self.quiet {
            println!("ℹ️  {}", message);
        }
    }

    /// Success message
    pub fn success(&self, message: &str) {
        self.record(LogLevel::Info, message);
        if !self.quiet {
            println!("✅ {}", message);
        }
    }

    /// Warning message
    pub fn warning(&self, message: &str) {
        self.record(LogLevel::Warning, message);
        if !self.quiet {
            println!("⚠️  WARNING: {}", message);
        }
    }

    /// Error message, printed even in quiet mode unless capturing
    pub fn error(&self, message: &str) {
        self.record(LogLevel::Error, message);
        if self.capture.is_none() {
            eprintln!("❌ ERROR: {}", message);
        }
    }

    /// Step information
    pub fn step(&self, message: &str) {
        self.record(LogLevel::Info, message);
        if !self.quiet {
            println!("▶️  {}", message);
        }
    }

    /// Progress information, completed by [`Logger::progress_done`]
    pub fn progress(&self, message: &str) {
        self.record(LogLevel::Info, message);
        if !self.quiet {
            print!("⏳ {}...", message);
            let _ = io::stdout().flush();
        }
    }

    pub fn progress_done(&self) {
        if !self.quiet {
            println!(" Done");
        }
    }

    /// Detailed information (only shown in verbose mode)
    pub fn detail(&self, message: &str) {
        self.record(LogLevel::Debug, message);
        if self.verbose && !self.quiet {
            println!("   {}", message);
        }
    }

    /// Key-value pair summary display
    pub fn summary_kv(&self, title: &str, items: &[(&str, String)]) {
        if !self.quiet {
            self.subsection(title);
            for (key, value) in items {
                println!("  {}: {}", key, value);
            }
        }
    }

    /// Format file size in human-readable units
    pub fn format_size(&self, bytes: u64) -> String {
        if bytes < 1024 {
            format!("{} B", bytes)
        } else if bytes < 1024 * 1024 {
            format!("{:.1} KB", bytes as f64 / 1024.0)
        } else if bytes < 1024 * 1024 * 1024 {
            format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
        } else {
            format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
        }
    }

    /// Format duration in human-readable format
    pub fn format_duration(&self, duration: Duration) -> String {
        let secs = duration.as_secs();
        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m{}s", secs / 60, secs % 60)
        } else {
            format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_records_levels() {
        let (logger, capture) = Logger::capturing();
        logger.info("Processing repo");
        logger.warning("No tags to sync found");
        logger.error("Error parsing repository name, skipping");
        logger.detail("verbose detail");

        assert_eq!(capture.warnings(), vec!["No tags to sync found".to_string()]);
        assert_eq!(capture.errors().len(), 1);
        assert_eq!(capture.events().len(), 4);
        assert_eq!(capture.messages(LogLevel::Debug), vec!["verbose detail".to_string()]);
    }

    #[test]
    fn test_clones_share_capture() {
        let (logger, capture) = Logger::capturing();
        let cloned = logger.clone();
        cloned.warning("from clone");
        assert_eq!(capture.warnings().len(), 1);
    }

    #[test]
    fn test_format_helpers() {
        let logger = Logger::new_quiet();
        assert_eq!(logger.format_size(512), "512 B");
        assert_eq!(logger.format_size(2048), "2.0 KB");
        assert_eq!(logger.format_duration(Duration::from_secs(3725)), "1h2m5s");
        assert_eq!(logger.format_duration(Duration::from_secs(61)), "1m1s");
    }
}
