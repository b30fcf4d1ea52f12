//! Subprocess output formatting
//!
//! Lines from the install subprocess pass through here before they become
//! log events. This decides which lines are hidden, which replace the
//! previous entry in place and which are plain appends.

use crate::protocol::{EventKind, InlineProgress, LogMessage, LogOp, Severity};
use regex::Regex;
use std::sync::LazyLock;

static CONSOLE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("console tag pattern is valid"));

static PLAIN_PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z][A-Za-z ]+)\s+\[[^\]]+\]\s+(\d{1,3})%\s*(\([^)]*\))?\s*$")
        .expect("progress line pattern is valid")
});

static SEEDER_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Running seeder:\s*([A-Za-z0-9_\\-]+)\.\.\.$").expect("seeder start pattern is valid")
});

static SEEDER_DONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^✔\s*Seeder\s+([A-Za-z0-9_\\-]+)\s+completed\.\s*$")
        .expect("seeder done pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One non-empty, sanitized line read from a subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubprocessLine {
    pub text: String,
    pub stream: Stream,
}

impl SubprocessLine {
    /// Sanitize `raw`; `None` if nothing is left.
    pub fn new(raw: &str, stream: Stream) -> Option<Self> {
        let text = sanitize_line(raw);
        (!text.is_empty()).then_some(Self { text, stream })
    }
}

/// Strip console markup tags and surrounding whitespace.
pub fn sanitize_line(raw: &str) -> String {
    CONSOLE_TAG.replace_all(raw, "").trim().to_string()
}

/// Lines that are already reported elsewhere or are pure noise.
pub fn should_suppress(line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return false;
    }
    if (line.starts_with("✔ PHP version ") || line.starts_with("PHP version "))
        && line.contains(" is supported.")
    {
        return true;
    }
    line.starts_with("INFO") && line.contains("Seeding database.")
}

/// Parse "Label [bar] NN% (tail)" into an inline progress descriptor.
pub fn parse_plain_progress(line: &str) -> Option<InlineProgress> {
    let caps = PLAIN_PROGRESS.captures(line.trim())?;
    let label = caps.get(1)?.as_str().trim();
    if label.is_empty() {
        return None;
    }
    let pct: u16 = caps.get(2)?.as_str().parse().ok()?;
    let tail = caps.get(3).map(|m| m.as_str().trim()).unwrap_or_default();
    Some(InlineProgress {
        key: label.to_lowercase(),
        label: label.to_string(),
        pct: pct.min(100) as u8,
        tail: tail.to_string(),
    })
}

pub fn parse_seeder_start(line: &str) -> Option<&str> {
    SEEDER_START
        .captures(line.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

pub fn parse_seeder_done(line: &str) -> Option<&str> {
    SEEDER_DONE
        .captures(line.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// A line ready to be emitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedLine {
    pub kind: EventKind,
    pub severity: Severity,
    pub log: LogMessage,
}

impl FormattedLine {
    fn info(log: LogMessage) -> Self {
        Self {
            kind: EventKind::Log,
            severity: Severity::Info,
            log,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LastPlain {
    text: String,
    step: String,
    stream: Stream,
}

/// Stateful formatter for one supervised run.
#[derive(Debug, Default)]
pub struct OutputFormatter {
    /// Seeder whose start line was the last entry, with its step
    open_seeder: Option<(String, String)>,
    last_plain: Option<LastPlain>,
}

impl OutputFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Format `line`, attributed to `step`. `None` means the line is hidden.
    pub fn format(&mut self, line: &SubprocessLine, step: &str) -> Option<FormattedLine> {
        let text = line.text.as_str();
        if should_suppress(text) {
            return None;
        }

        if let Some(seeder) = parse_seeder_done(text) {
            let matches_open = self
                .open_seeder
                .as_ref()
                .is_some_and(|(name, s)| name == seeder && s == step);
            if matches_open {
                self.open_seeder = None;
                self.last_plain = None;
                return Some(FormattedLine::info(
                    LogMessage::new(text).op(LogOp::ReplaceLast),
                ));
            }
        }
        self.open_seeder = parse_seeder_start(text).map(|s| (s.to_string(), step.to_string()));

        if let Some(inline) = parse_plain_progress(text) {
            let mut log = LogMessage::new(inline.label.clone()).op(LogOp::ReplaceLastIfSame);
            log.inline = Some(inline);
            return Some(FormattedLine::info(log));
        }

        let current = LastPlain {
            text: text.to_string(),
            step: step.to_string(),
            stream: line.stream,
        };
        let op = if self.last_plain.as_ref() == Some(&current) {
            LogOp::ReplaceLast
        } else {
            self.last_plain = Some(current);
            LogOp::Append
        };

        let log = LogMessage::new(text).op(op);
        Some(match line.stream {
            Stream::Stdout => FormattedLine::info(log),
            Stream::Stderr => FormattedLine {
                kind: EventKind::Warning,
                severity: Severity::Warn,
                log,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(text: &str) -> SubprocessLine {
        SubprocessLine::new(text, Stream::Stdout).unwrap()
    }

    fn err(text: &str) -> SubprocessLine {
        SubprocessLine::new(text, Stream::Stderr).unwrap()
    }

    #[test]
    fn test_sanitize_strips_tags() {
        assert_eq!(sanitize_line("  <info>Done</info>  "), "Done");
        assert!(SubprocessLine::new("<comment></comment>  ", Stream::Stdout).is_none());
    }

    #[test]
    fn test_suppressed_lines() {
        assert!(should_suppress("✔ PHP version 8.3.4 is supported."));
        assert!(should_suppress("PHP version 8.4.0 is supported."));
        assert!(should_suppress("INFO  Seeding database."));
        assert!(!should_suppress("PHP version 7.4 is too old"));
        assert!(!should_suppress(""));
    }

    #[test]
    fn test_parse_plain_progress() {
        let p = parse_plain_progress("Downloading [=====>    ] 45% (3/7)").unwrap();
        assert_eq!(p.key, "downloading");
        assert_eq!(p.pct, 45);
        assert_eq!(p.tail, "(3/7)");

        let p = parse_plain_progress("Extracting files [####] 999%").unwrap();
        assert_eq!(p.pct, 100);
        assert_eq!(p.tail, "");

        assert!(parse_plain_progress("Downloading vendor/package").is_none());
    }

    #[test]
    fn test_seeder_done_replaces_start() {
        let mut f = OutputFormatter::new();
        let start = f.format(&out("Running seeder: UsersSeeder..."), "install").unwrap();
        assert_eq!(start.log.op, LogOp::Append);
        let done = f.format(&out("✔ Seeder UsersSeeder completed."), "install").unwrap();
        assert_eq!(done.log.op, LogOp::ReplaceLast);
    }

    #[test]
    fn test_seeder_done_appends_on_mismatch() {
        let mut f = OutputFormatter::new();
        f.format(&out("Running seeder: UsersSeeder..."), "install");
        let done = f.format(&out("✔ Seeder RolesSeeder completed."), "install").unwrap();
        assert_eq!(done.log.op, LogOp::Append);

        f.format(&out("Running seeder: A..."), "install");
        f.format(&out("something else"), "install");
        let done = f.format(&out("✔ Seeder A completed."), "install").unwrap();
        assert_eq!(done.log.op, LogOp::Append);
    }

    #[test]
    fn test_inline_progress_line() {
        let mut f = OutputFormatter::new();
        let line = f.format(&out("Extracting [###   ] 50%"), "download").unwrap();
        assert_eq!(line.log.op, LogOp::ReplaceLastIfSame);
        assert_eq!(line.log.message, "Extracting");
        assert_eq!(line.log.inline.as_ref().map(|i| i.pct), Some(50));
    }

    #[test]
    fn test_repeated_lines_replace_per_step_and_stream() {
        let mut f = OutputFormatter::new();
        let first = f.format(&err("deprecated thing"), "install").unwrap();
        assert_eq!(first.kind, EventKind::Warning);
        assert_eq!(first.severity, Severity::Warn);
        assert_eq!(first.log.op, LogOp::Append);

        let again = f.format(&err("deprecated thing"), "install").unwrap();
        assert_eq!(again.log.op, LogOp::ReplaceLast);

        let other_stream = f.format(&out("deprecated thing"), "install").unwrap();
        assert_eq!(other_stream.log.op, LogOp::Append);

        let other_step = f.format(&out("deprecated thing"), "dependencies").unwrap();
        assert_eq!(other_step.log.op, LogOp::Append);
    }

    #[test]
    fn test_suppressed_line_is_hidden() {
        let mut f = OutputFormatter::new();
        assert!(f.format(&out("✔ PHP version 8.3.4 is supported."), "download").is_none());
    }
}
