//! Event consumers
//!
//! A front end drains the event queue, answers questions on the action queue
//! and decides how the run ended. Two exist:
//!
//! - [`batch`]: non-interactive line output for `--cli`
//! - [`prompt`]: the default interactive mode, answering questions with
//!   terminal prompts
//!
//! Both print the same event lines through [`LinePrinter`] and feed every
//! event into the [`EventLogger`] and an [`InstallView`].

pub mod batch;
pub mod prompt;

use crate::protocol::{Event, EventKind, LogMessage, LogOp, Payload, StepStart};
use crate::report::EventLogger;
use crate::view::InstallView;
use std::collections::HashMap;
use std::io::{self, Write};

/// How a front end finished
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Command to run once the front end has exited
    pub exec: Option<Vec<String>>,
    pub failed: bool,
    pub cancelled: bool,
}

impl Outcome {
    /// Operator-facing reason the run did not succeed
    pub fn error_message(&self) -> Option<&'static str> {
        if self.cancelled {
            Some("installation cancelled")
        } else if self.failed {
            Some("installation failed")
        } else {
            None
        }
    }
}

/// State shared by every front end: the report and the folded view.
pub struct Consumer<'a> {
    pub logger: &'a mut EventLogger,
    pub view: InstallView,
    exec: Option<Vec<String>>,
}

impl<'a> Consumer<'a> {
    pub fn new(logger: &'a mut EventLogger) -> Self {
        Self {
            logger,
            view: InstallView::new(),
            exec: None,
        }
    }

    pub fn observe(&mut self, ev: &Event) {
        self.logger.record(ev);
        self.view.apply(ev);
        if let Payload::Exec(request) = &ev.payload {
            if !request.command.is_empty() {
                self.exec = Some(request.command.clone());
            }
        }
    }

    pub fn mark_failure(&mut self) {
        self.logger.mark_failure();
    }

    pub fn finish(self, failed: bool, cancelled: bool) -> Outcome {
        Outcome {
            exec: self.exec,
            failed,
            cancelled,
        }
    }
}

/// Renders events as `prefix [step] message` lines.
pub struct LinePrinter<O: Write, E: Write> {
    out: O,
    err: E,
    quiet: bool,
    labels: HashMap<String, String>,
    last_log: HashMap<String, String>,
}

impl LinePrinter<io::Stdout, io::Stderr> {
    pub fn stdio(quiet: bool) -> Self {
        Self::new(io::stdout(), io::stderr(), quiet)
    }
}

impl<O: Write, E: Write> LinePrinter<O, E> {
    pub fn new(out: O, err: E, quiet: bool) -> Self {
        Self {
            out,
            err,
            quiet,
            labels: HashMap::new(),
            last_log: HashMap::new(),
        }
    }

    pub fn into_parts(self) -> (O, E) {
        (self.out, self.err)
    }

    /// Print a free-standing line on stdout.
    pub fn say(&mut self, message: &str) {
        let _ = writeln!(self.out, "{message}");
    }

    /// Print a free-standing line on stderr.
    pub fn complain(&mut self, message: &str) {
        let _ = writeln!(self.err, "{message}");
    }

    /// Print the line for `ev`, if it has one. Questions are left to the
    /// caller.
    pub fn print(&mut self, ev: &Event) {
        match (&ev.kind, &ev.payload) {
            (EventKind::Steps, Payload::Steps(steps)) => {
                for step in steps {
                    if !step.id.is_empty() && !step.label.is_empty() {
                        self.labels.insert(step.id.clone(), step.label.clone());
                    }
                }
            }
            (EventKind::StepStart, payload) => {
                let label = self.label(ev.step(), payload);
                line(&mut self.out, "==>", ev.step(), &label);
            }
            (EventKind::StepDone, payload) => {
                let label = self.label(ev.step(), payload);
                let ok = match payload {
                    Payload::StepDone(outcome) => outcome.ok,
                    _ => true,
                };
                if ok {
                    line(&mut self.out, "✓", ev.step(), &label);
                } else {
                    line(&mut self.err, "✗", ev.step(), &label);
                }
            }
            (EventKind::Progress, Payload::Progress(reading)) if !self.quiet => {
                let unit = match reading.unit.trim() {
                    "" => "units",
                    unit => unit,
                };
                let msg = format!("Progress: {}/{} {unit}", reading.current, reading.total);
                line(&mut self.out, "•", ev.step(), &msg);
            }
            (EventKind::Log, Payload::Log(log)) => {
                if let Some(msg) = self.visible(ev.step(), log) {
                    line(&mut self.out, "-", ev.step(), &msg);
                }
            }
            (EventKind::Warning, Payload::Log(log)) => {
                if let Some(msg) = self.visible(ev.step(), log) {
                    line(&mut self.err, "!", ev.step(), &msg);
                }
            }
            (EventKind::Error, Payload::Log(log)) => {
                line(&mut self.err, "✗", ev.step(), &format_log(log));
            }
            _ => {}
        }
    }

    fn label(&mut self, step: &str, payload: &Payload) -> String {
        if let Payload::StepStart(StepStart { label, .. }) = payload {
            let label = label.trim();
            if !label.is_empty() {
                self.labels.insert(step.to_string(), label.to_string());
                return label.to_string();
            }
        }
        match self.labels.get(step).map(|l| l.trim()) {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => step.to_string(),
        }
    }

    /// The message to print for a log line, or `None` when it repeats the
    /// line it replaces or quiet mode hides it.
    fn visible(&mut self, step: &str, log: &LogMessage) -> Option<String> {
        let msg = format_log(log);
        if msg.is_empty() {
            return None;
        }
        let previous = self.last_log.insert(step.to_string(), msg.clone());
        if log.op != LogOp::Append && previous.as_deref() == Some(msg.as_str()) {
            return None;
        }
        if self.quiet && !print_when_quiet(&msg) {
            return None;
        }
        Some(msg)
    }
}

fn line(out: &mut impl Write, prefix: &str, step: &str, message: &str) {
    let step = step.trim();
    let message = message.trim();
    if message.is_empty() {
        return;
    }
    let _ = if step.is_empty() {
        writeln!(out, "{prefix} {message}")
    } else {
        writeln!(out, "{prefix} [{step}] {message}")
    };
}

/// Message text, with inline progress rendered as `label NN% tail`.
pub fn format_log(log: &LogMessage) -> String {
    let Some(inline) = &log.inline else {
        return log.message.trim().to_string();
    };
    let label = match inline.label.trim() {
        "" => log.message.trim(),
        label => label,
    };
    let mut msg = format!("{label} {}%", inline.pct);
    let tail = inline.tail.trim();
    if !tail.is_empty() {
        msg.push(' ');
        msg.push_str(tail);
    }
    msg
}

fn print_when_quiet(message: &str) -> bool {
    let msg = message.trim();
    if msg.is_empty() {
        return false;
    }
    is_issue(msg) || !is_verbose(msg)
}

fn is_issue(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("warning")
        || lower.contains("error")
        || lower.contains("failed")
        || message.contains('⚠')
        || message.contains('✗')
}

fn is_verbose(message: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "- Downloading ",
        "- Installing ",
        "- Syncing ",
        "- Cloning ",
        "Package operations:",
        "Verifying lock file contents can be installed on current platform.",
        "Generating optimized autoload files",
        "Extracting",
        "Created project in ",
        "Use the `composer fund` command",
    ];
    PREFIXES.iter().any(|p| message.starts_with(p))
        || message.contains("packages you are using are looking for funding")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InlineProgress, Severity};

    fn printer(quiet: bool) -> LinePrinter<Vec<u8>, Vec<u8>> {
        LinePrinter::new(Vec::new(), Vec::new(), quiet)
    }

    fn output(printer: LinePrinter<Vec<u8>, Vec<u8>>) -> (String, String) {
        let (out, err) = printer.into_parts();
        (String::from_utf8(out).unwrap(), String::from_utf8(err).unwrap())
    }

    fn log(step: &str, kind: EventKind, log: LogMessage) -> Event {
        let severity = match kind {
            EventKind::Warning => Severity::Warn,
            EventKind::Error => Severity::Error,
            _ => Severity::Info,
        };
        Event::new(kind, step, "install", severity, Payload::Log(log))
    }

    #[test]
    fn test_inline_progress_format() {
        let mut msg = LogMessage::new("Downloading");
        msg.inline = Some(InlineProgress {
            key: "Downloading".to_string(),
            label: "Downloading".to_string(),
            pct: 42,
            tail: "(12/30)".to_string(),
        });
        assert_eq!(format_log(&msg), "Downloading 42% (12/30)");
    }

    #[test]
    fn test_replaced_duplicate_is_not_printed_twice() {
        let mut p = printer(false);
        p.print(&log("install", EventKind::Log, LogMessage::new("Working")));
        p.print(&log(
            "install",
            EventKind::Log,
            LogMessage::new("Working").op(LogOp::ReplaceLast),
        ));
        p.print(&log("install", EventKind::Log, LogMessage::new("Working")));
        let (out, _) = output(p);
        assert_eq!(out, "- [install] Working\n- [install] Working\n");
    }

    #[test]
    fn test_quiet_hides_verbose_lines_but_keeps_issues() {
        let mut p = printer(true);
        p.print(&log("install", EventKind::Log, LogMessage::new("- Downloading symfony/console")));
        p.print(&log("install", EventKind::Log, LogMessage::new("- Installing foo failed")));
        p.print(&Event::new(
            EventKind::Progress,
            "install",
            "install",
            Severity::Info,
            Payload::Progress(crate::protocol::ProgressReading {
                current: 5,
                total: 100,
                unit: String::new(),
            }),
        ));
        let (out, _) = output(p);
        assert_eq!(out, "- [install] - Installing foo failed\n");
    }

    #[test]
    fn test_outcome_messages() {
        assert_eq!(Outcome::default().error_message(), None);
        let failed = Outcome {
            failed: true,
            ..Outcome::default()
        };
        assert_eq!(failed.error_message(), Some("installation failed"));
        let cancelled = Outcome {
            failed: true,
            cancelled: true,
            ..Outcome::default()
        };
        assert_eq!(cancelled.error_message(), Some("installation cancelled"));
    }
}
