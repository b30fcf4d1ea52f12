//! Installer run report
//!
//! [`EventLogger`] records the same event stream the front end sees and turns
//! it into a Markdown report (`log.md`) with a summary, per-step sections and
//! a general section. Consecutive identical lines collapse into one line with
//! a repeat count, and every freeform value is redacted before it is written.
//!
//! The report is only written when the logger is configured to always write
//! or when the run recorded an error.

use crate::config::InstallOptions;
use crate::error::Result;
use crate::protocol::{Event, EventKind, LogMessage, Payload, Severity};
use crate::steps::QuestStep;
use chrono::{DateTime, Local, SecondsFormat, Utc};
use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info};

/// File name of the report inside the report directory
pub const REPORT_FILE: &str = "log.md";

const REDACTED: &str = "<redacted>";

/// Lines whose whole value after the prefix is sensitive
const SENSITIVE_PREFIXES: &[&str] = &[
    "selected database user:",
    "selected database password:",
    "your admin username:",
    "your admin email:",
    "your admin password:",
    "admin username:",
    "admin email:",
    "username:",
    "password:",
];

static FLAG_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(--(?:db-user|db-password|admin-username|admin-email|admin-password))=\S+")
        .expect("flag value pattern is valid")
});

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}").expect("email pattern is valid")
});

static USER_QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(user|username|login)\s*'[^']*'").expect("quoted user pattern is valid")
});

static USER_DOUBLE_QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(user|username|login)\s*"[^"]*""#).expect("quoted user pattern is valid")
});

static KEY_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(username|login|email|password)\s*[:=]\s*(\S+)")
        .expect("key value pattern is valid")
});

/// Everything the summary section prints about the run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportConfig {
    /// Write the report even when the run succeeded
    pub always: bool,
    pub install_dir: String,
    pub version: String,
    pub mode: String,
    pub force: bool,
    pub branch: String,
    pub db_type: String,
    pub db_host: String,
    pub db_port: Option<u16>,
    pub db_name: String,
    pub admin_directory: String,
    pub language: String,
}

impl ReportConfig {
    /// Summary fields taken from the install options; secrets are never copied.
    pub fn from_options(opts: &InstallOptions, mode: &str, always: bool) -> Self {
        Self {
            always,
            install_dir: opts.dir.display().to_string(),
            version: opts.self_version.clone(),
            mode: mode.to_string(),
            force: opts.force,
            branch: opts.branch.clone(),
            db_type: opts.db_type.clone(),
            db_host: opts.db_host.clone(),
            db_port: opts.db_port,
            db_name: opts.db_name.clone(),
            admin_directory: opts.admin_directory.clone(),
            language: opts.language.clone(),
        }
    }

    fn options_line(&self) -> String {
        let mut opts = Vec::new();
        if self.force {
            opts.push("force=true".to_string());
        }
        let named = [
            ("branch", &self.branch),
            ("db-type", &self.db_type),
            ("db-host", &self.db_host),
        ];
        for (key, value) in named {
            if !value.trim().is_empty() {
                opts.push(format!("{key}={}", value.trim()));
            }
        }
        if let Some(port) = self.db_port.filter(|p| *p > 0) {
            opts.push(format!("db-port={port}"));
        }
        let named = [
            ("db-name", &self.db_name),
            ("admin-directory", &self.admin_directory),
            ("language", &self.language),
        ];
        for (key, value) in named {
            if !value.trim().is_empty() {
                opts.push(format!("{key}={}", value.trim()));
            }
        }
        opts.join(", ")
    }
}

#[derive(Debug, Clone)]
struct ReportEntry {
    timestamp: DateTime<Utc>,
    severity: Severity,
    source: String,
    step_id: String,
    message: String,
    fields: BTreeMap<String, String>,
    /// Key of the inline progress bar this entry shows, if any
    inline_key: Option<String>,
}

impl ReportEntry {
    fn plain(ev: &Event, severity: Severity, message: String) -> Self {
        Self {
            timestamp: ev.timestamp,
            severity,
            source: ev.source.clone(),
            step_id: ev.step().to_string(),
            message,
            fields: BTreeMap::new(),
            inline_key: None,
        }
    }

    fn from_log(ev: &Event, severity: Severity, log: &LogMessage) -> Self {
        let (message, inline_key) = match &log.inline {
            Some(inline) => {
                let label = if inline.label.trim().is_empty() {
                    log.message.trim()
                } else {
                    inline.label.trim()
                };
                let mut message = format!("{label} {}%", inline.pct);
                if !inline.tail.trim().is_empty() {
                    message.push(' ');
                    message.push_str(inline.tail.trim());
                }
                (message, Some(inline.key.clone()))
            }
            None => (log.message.trim().to_string(), None),
        };
        Self {
            timestamp: ev.timestamp,
            severity,
            source: ev.source.clone(),
            step_id: ev.step().to_string(),
            message,
            fields: log.fields.clone(),
            inline_key,
        }
    }
}

/// Consecutive identical entries folded together
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReportItem {
    timestamp: DateTime<Utc>,
    severity: Severity,
    source: String,
    message: String,
    fields: String,
    count: usize,
}

impl ReportItem {
    fn is_issue(&self) -> bool {
        if self.severity >= Severity::Warn {
            return true;
        }
        let lower = self.message.to_lowercase();
        ["✗", "⚠", "failed", "error", "warning"]
            .iter()
            .any(|marker| lower.contains(marker))
    }

    fn line(&self, include_fields: bool) -> String {
        let mut line = format!(
            "{} [{}]",
            self.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            level_label(self.severity)
        );
        if !self.source.is_empty() {
            let _ = write!(line, " ({})", self.source);
        }
        if !self.message.is_empty() {
            line.push(' ');
            line.push_str(&self.message);
        }
        if self.count > 1 {
            let _ = write!(line, " (x{})", self.count);
        }
        if include_fields && !self.fields.is_empty() {
            let _ = write!(line, " [{}]", self.fields);
        }
        line
    }
}

struct StepGroup {
    step_id: String,
    label: String,
    entries: Vec<ReportEntry>,
}

/// Records events and writes the Markdown report.
#[derive(Debug)]
pub struct EventLogger {
    config: ReportConfig,
    started: DateTime<Utc>,
    ended: Option<DateTime<Utc>>,
    step_labels: HashMap<String, String>,
    entries: Vec<ReportEntry>,
    had_error: bool,
    failed_steps: Vec<String>,
}

impl EventLogger {
    pub fn new(config: ReportConfig) -> Self {
        Self {
            config,
            started: Utc::now(),
            ended: None,
            step_labels: HashMap::new(),
            entries: Vec::new(),
            had_error: false,
            failed_steps: Vec::new(),
        }
    }

    pub fn had_error(&self) -> bool {
        self.had_error
    }

    /// Force the report to be written, e.g. after the front end failed.
    pub fn mark_failure(&mut self) {
        self.had_error = true;
    }

    pub fn record(&mut self, ev: &Event) {
        self.ended = Some(ev.timestamp);
        match (&ev.kind, &ev.payload) {
            (EventKind::Steps, Payload::Steps(steps)) => {
                for step in steps {
                    if !step.id.is_empty() && !step.label.is_empty() {
                        self.step_labels.insert(step.id.clone(), step.label.clone());
                    }
                }
            }
            (EventKind::StepStart, payload) => {
                let label = match payload {
                    Payload::StepStart(start) if !start.label.trim().is_empty() => {
                        start.label.trim().to_string()
                    }
                    _ => ev.step().to_string(),
                };
                if !ev.step().is_empty() && !label.is_empty() {
                    self.step_labels.insert(ev.step().to_string(), label.clone());
                }
                self.entries
                    .push(ReportEntry::plain(ev, Severity::Info, format!("Step started: {label}")));
            }
            (EventKind::StepDone, payload) => {
                let ok = match payload {
                    Payload::StepDone(outcome) => outcome.ok,
                    _ => true,
                };
                if !ok {
                    self.mark_step_failed(ev.step());
                }
                let label = self
                    .step_labels
                    .get(ev.step())
                    .filter(|l| !l.trim().is_empty())
                    .cloned()
                    .unwrap_or_else(|| ev.step().to_string());
                let entry = if ok {
                    ReportEntry::plain(ev, Severity::Info, format!("Step completed: {label}"))
                } else {
                    ReportEntry::plain(ev, Severity::Warn, format!("Step failed: {label}"))
                };
                self.entries.push(entry);
            }
            (EventKind::Progress, Payload::Progress(reading)) => {
                let unit = match reading.unit.trim() {
                    "" => "units",
                    unit => unit,
                };
                let message = format!("Progress: {}/{} {unit}", reading.current, reading.total);
                self.entries
                    .push(ReportEntry::plain(ev, Severity::Info, message));
            }
            (EventKind::Log, Payload::Log(log)) => self.add_log(ev, Severity::Info, log),
            (EventKind::Warning, Payload::Log(log)) => self.add_log(ev, Severity::Warn, log),
            (EventKind::Error, payload) => {
                self.had_error = true;
                let global = is_global_failure(ev);
                if !global {
                    self.mark_step_failed(ev.step());
                }
                if let Payload::Log(log) = payload {
                    let mut entry = ReportEntry::from_log(ev, Severity::Error, log);
                    if global {
                        entry.step_id.clear();
                    }
                    self.push_entry(entry, log);
                }
            }
            _ => {}
        }
    }

    /// Write the report if required. Returns the path when a file was written.
    pub fn finalize(&mut self) -> Result<Option<PathBuf>> {
        if !self.config.always && !self.had_error {
            debug!("run succeeded, skipping report");
            return Ok(None);
        }
        let dir = resolve_report_dir(&self.config.install_dir);
        let path = dir.join(REPORT_FILE);
        let ended = *self.ended.get_or_insert_with(Utc::now);
        fs::write(&path, self.render(ended))?;
        info!(path = %path.display(), "report written");
        Ok(Some(path))
    }

    fn mark_step_failed(&mut self, step_id: &str) {
        if !step_id.is_empty() && !self.failed_steps.iter().any(|s| s == step_id) {
            self.failed_steps.push(step_id.to_string());
        }
    }

    fn add_log(&mut self, ev: &Event, severity: Severity, log: &LogMessage) {
        self.push_entry(ReportEntry::from_log(ev, severity, log), log);
    }

    fn push_entry(&mut self, entry: ReportEntry, log: &LogMessage) {
        use crate::protocol::LogOp;

        let replace = self.entries.last().is_some_and(|last| match log.op {
            LogOp::Append => false,
            LogOp::ReplaceLast => true,
            LogOp::ReplaceLastIfSame => {
                last.inline_key.is_some() && last.inline_key == entry.inline_key
            }
        });
        if replace {
            if let Some(last) = self.entries.last_mut() {
                *last = entry;
            }
            return;
        }
        self.entries.push(entry);
    }

    fn render(&self, ended: DateTime<Utc>) -> String {
        let (groups, general) = self.group_entries();
        let mut out = String::new();

        let _ = writeln!(out, "# Evolution CMS Installer log\n");
        let _ = writeln!(out, "## Summary");
        let _ = writeln!(out, "- Started: {}", rfc3339(self.started));
        let _ = writeln!(out, "- Ended: {}", rfc3339(ended));
        let result = if self.had_error { "Failed" } else { "Completed" };
        let _ = writeln!(out, "- Result: {result}");
        if let Some(reason) = failure_reason(&self.entries).filter(|_| self.had_error) {
            let _ = writeln!(out, "- Failure reason: {reason}");
        }
        let failed = self.failed_step_refs(&groups);
        if !failed.is_empty() {
            let _ = writeln!(out, "- Failed steps: {}", failed.join("; "));
        }
        let summary = [
            ("Install dir", self.config.install_dir.trim()),
            ("Version", self.config.version.trim()),
            ("Mode", self.config.mode.trim()),
        ];
        for (key, value) in summary {
            if !value.is_empty() {
                let _ = writeln!(out, "- {key}: {value}");
            }
        }
        let options = self.config.options_line();
        if !options.is_empty() {
            let _ = writeln!(out, "- Options: {options}");
        }

        let _ = writeln!(out, "\n## Steps");
        if groups.is_empty() {
            let _ = writeln!(out, "_No step logs recorded._");
        }
        for group in &groups {
            let _ = writeln!(out, "{}", step_heading(&group.label, &group.step_id));
            write_entries(&mut out, &group.entries);
            out.push('\n');
        }
        if !general.is_empty() {
            let _ = writeln!(out, "\n## General");
            write_entries(&mut out, &general);
        }
        out
    }

    fn group_entries(&self) -> (Vec<StepGroup>, Vec<ReportEntry>) {
        let mut groups: Vec<StepGroup> = Vec::new();
        let mut general = Vec::new();
        for entry in &self.entries {
            let step_id = entry.step_id.trim();
            if step_id.is_empty() {
                general.push(entry.clone());
                continue;
            }
            match groups.iter_mut().find(|g| g.step_id == step_id) {
                Some(group) => group.entries.push(entry.clone()),
                None => groups.push(StepGroup {
                    step_id: step_id.to_string(),
                    label: self
                        .step_labels
                        .get(step_id)
                        .map(|l| l.trim().to_string())
                        .unwrap_or_default(),
                    entries: vec![entry.clone()],
                }),
            }
        }
        (groups, general)
    }

    fn failed_step_refs(&self, groups: &[StepGroup]) -> Vec<String> {
        let mut refs: Vec<String> = groups
            .iter()
            .filter(|g| self.failed_steps.contains(&g.step_id))
            .map(|g| step_ref(&g.label, &g.step_id))
            .collect();
        refs.extend(
            self.failed_steps
                .iter()
                .filter(|id| !groups.iter().any(|g| &g.step_id == *id))
                .map(|id| step_ref("", id)),
        );
        refs
    }
}

/// The download step's "Installation failed." is about the whole run.
fn is_global_failure(ev: &Event) -> bool {
    if ev.step() != QuestStep::Download.id() {
        return false;
    }
    ev.log_message().is_some_and(|log| {
        let msg = log.message.trim();
        msg.eq_ignore_ascii_case("Installation failed.") || msg.eq_ignore_ascii_case("Installation failed")
    })
}

fn write_entries(out: &mut String, entries: &[ReportEntry]) {
    let items = compress(entries);
    if items.is_empty() {
        let _ = writeln!(out, "_No logs recorded._");
        return;
    }

    let issues: Vec<&ReportItem> = items.iter().filter(|i| i.is_issue()).collect();
    let highlights: Vec<&ReportItem> = items
        .iter()
        .filter(|i| !is_verbose_message(&i.message) || i.is_issue())
        .collect();
    let has_verbose = items.iter().any(|i| is_verbose_message(&i.message));

    if !issues.is_empty() {
        let _ = writeln!(out, "#### Issues\n```text");
        for item in &issues {
            let _ = writeln!(out, "{}", item.line(true));
        }
        let _ = writeln!(out, "```\n");
    }
    if !highlights.is_empty() {
        let _ = writeln!(out, "#### Highlights");
        for item in &highlights {
            let _ = writeln!(out, "- {}", item.line(false));
        }
        out.push('\n');
    }
    if has_verbose {
        let _ = writeln!(out, "<details>");
        let _ = writeln!(out, "<summary>Full output ({} lines)</summary>\n", items.len());
        let _ = writeln!(out, "```text");
        for item in &items {
            let _ = writeln!(out, "{}", item.line(true));
        }
        let _ = writeln!(out, "```\n</details>");
    }
}

fn compress(entries: &[ReportEntry]) -> Vec<ReportItem> {
    let mut items: Vec<ReportItem> = Vec::with_capacity(entries.len());
    for entry in entries {
        let item = ReportItem {
            timestamp: entry.timestamp,
            severity: entry.severity,
            source: entry.source.trim().to_string(),
            message: sanitize_message(&entry.message),
            fields: format_fields(&entry.fields),
            count: 1,
        };
        match items.last_mut() {
            Some(last)
                if last.severity == item.severity
                    && last.source == item.source
                    && last.message == item.message
                    && last.fields == item.fields =>
            {
                last.count += 1;
            }
            _ => items.push(item),
        }
    }
    items
}

fn level_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Trace | Severity::Info => "INFO",
        Severity::Warn => "WARNING",
        Severity::Error => "ERROR",
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn is_verbose_message(message: &str) -> bool {
    let msg = message.trim();
    ["- Downloading ", "- Installing ", "- Syncing ", "- Cloning "]
        .iter()
        .any(|p| msg.starts_with(p))
        || msg.starts_with("Package operations:")
        || msg.starts_with("Generating optimized autoload files")
}

fn is_failure_message(message: &str) -> bool {
    let msg = message.trim().to_lowercase();
    msg.starts_with('✗') || msg.starts_with('⚠') || msg.contains("failed") || msg.contains("error")
}

/// First error, else the first failure-looking warning, else any failure line.
fn failure_reason(entries: &[ReportEntry]) -> Option<String> {
    let error_field = |entry: &ReportEntry| {
        entry
            .fields
            .get("error")
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .map(sanitize_message)
    };

    for entry in entries.iter().filter(|e| e.severity == Severity::Error) {
        if let Some(error) = error_field(entry) {
            return Some(error);
        }
        let msg = sanitize_message(&entry.message);
        if !msg.is_empty() {
            return Some(msg);
        }
    }
    for entry in entries.iter().filter(|e| e.severity == Severity::Warn) {
        if let Some(error) = error_field(entry) {
            return Some(error);
        }
        let msg = sanitize_message(&entry.message);
        if !msg.is_empty() && is_failure_message(&msg) {
            return Some(msg);
        }
    }
    entries
        .iter()
        .map(|e| sanitize_message(&e.message))
        .find(|msg| !msg.is_empty() && is_failure_message(msg))
}

fn step_heading(label: &str, step_id: &str) -> String {
    let label = match (label.trim(), step_id.trim()) {
        ("", "") => "Unknown step",
        ("", id) => id,
        (label, _) => label,
    };
    if step_id.trim().is_empty() {
        format!("### {label}")
    } else {
        format!("### {label} (`{}`)", step_id.trim())
    }
}

fn step_ref(label: &str, step_id: &str) -> String {
    match (label.trim(), step_id.trim()) {
        ("", id) => format!("`{id}`"),
        (label, "") => label.to_string(),
        (label, id) => format!("{label} (`{id}`)"),
    }
}

fn is_internal_field(key: &str) -> bool {
    matches!(
        key.trim().to_lowercase().as_str(),
        "op" | "kind" | "progress_key" | "label" | "pct" | "tail"
    )
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.trim().to_lowercase();
    ["password", "email", "user", "login"]
        .iter()
        .any(|k| key.contains(k))
}

fn format_fields(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .filter(|(k, _)| !is_internal_field(k))
        .map(|(k, v)| {
            let value = if is_sensitive_key(k) {
                REDACTED.to_string()
            } else {
                sanitize_message(v)
            };
            format!("{k}={}", format_value(&value))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_value(value: &str) -> String {
    let value = value.trim().replace(['\n', '\r'], " ");
    if value.is_empty() {
        "\"\"".to_string()
    } else if value.contains([' ', '\t']) {
        format!("{value:?}")
    } else {
        value
    }
}

/// Redact secrets and strip control characters from a freeform value.
pub fn sanitize_message(message: &str) -> String {
    if message.trim().is_empty() {
        return String::new();
    }
    let message = strip_control_chars(message);
    let message = redact_by_prefix(&message);
    let message = FLAG_VALUE.replace_all(&message, "$1=<redacted>");
    let message = EMAIL.replace_all(&message, REDACTED);
    let message = USER_QUOTED.replace_all(&message, "$1 '<redacted>'");
    let message = USER_DOUBLE_QUOTED.replace_all(&message, "$1 \"<redacted>\"");
    KEY_VALUE
        .replace_all(&message, |caps: &Captures<'_>| {
            if caps[2].starts_with(REDACTED) {
                caps[0].to_string()
            } else {
                format!("{}: {REDACTED}", &caps[1])
            }
        })
        .into_owned()
}

fn strip_control_chars(message: &str) -> String {
    message
        .chars()
        .filter_map(|c| match c {
            '\n' | '\t' | '\r' => Some(' '),
            c if (c as u32) < 32 || c as u32 == 127 => None,
            c => Some(c),
        })
        .collect()
}

fn redact_by_prefix(message: &str) -> String {
    let trimmed = message.trim_start_matches([' ', '\t']);
    let leading = &message[..message.len() - trimmed.len()];
    let lower = trimmed.to_lowercase();
    SENSITIVE_PREFIXES
        .iter()
        .filter(|prefix| lower.starts_with(*prefix))
        .find_map(|prefix| trimmed.get(..prefix.len()))
        .map_or_else(
            || message.to_string(),
            |original| format!("{leading}{original} {REDACTED}."),
        )
}

/// Install dir, else the working directory, else the temp dir.
pub fn resolve_report_dir(install_dir: &str) -> PathBuf {
    let dir = match install_dir.trim() {
        "" => Path::new("."),
        dir => Path::new(dir),
    };
    if fs::create_dir_all(dir).is_ok() {
        return dir.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) if fs::create_dir_all(&cwd).is_ok() => cwd,
        _ => std::env::temp_dir(),
    }
}
