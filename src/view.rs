//! Consumer-side install state
//!
//! [`InstallView`] folds the event stream into the state a front end renders:
//! the quest track, the log, the outstanding question, the latest progress
//! reading, the system status and the extras sub-workflow.
//!
//! # Rules
//!
//! - Step statuses only move forward; a repeated `active` is a no-op and a
//!   terminal status never changes.
//! - Starting one step never demotes another.
//! - Warnings are logged without touching the step status; errors mark a
//!   non-terminal step as failed.
//! - Extras item results never move backwards.

use crate::extras::ExtrasState;
use crate::protocol::{Event, EventKind, InlineProgress, LogMessage, LogOp, Payload, QuestionState, Severity};
use crate::release::ReleaseInfo;
use crate::status::SystemStatus;
use crate::steps::{
    FETCH_RELEASE_STEP, PREFLIGHT_STEP, SELF_UPDATE_STEP, SYSTEM_STATUS_STEP, StepState, StepStatus,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Default number of log entries kept in memory
pub const DEFAULT_LOG_LIMIT: usize = 2000;

/// Steps that drive the workflow but are not part of the quest track
pub fn is_internal_step(step_id: &str) -> bool {
    matches!(
        step_id,
        FETCH_RELEASE_STEP | SYSTEM_STATUS_STEP | SELF_UPDATE_STEP | PREFLIGHT_STEP
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub source: String,
    pub step_id: String,
    pub message: String,
    pub fields: BTreeMap<String, String>,
    pub inline: Option<InlineProgress>,
}

impl LogEntry {
    fn from_event(ev: &Event, log: &LogMessage) -> Self {
        Self {
            timestamp: ev.timestamp,
            severity: ev.severity,
            source: ev.source.clone(),
            step_id: ev.step().to_string(),
            message: log.message.clone(),
            fields: log.fields.clone(),
            inline: log.inline.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressView {
    pub step_id: String,
    pub current: u64,
    pub total: u64,
    pub unit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseView {
    pub highest: Option<ReleaseInfo>,
    pub error: String,
    pub loading: bool,
}

#[derive(Debug, Clone)]
pub struct InstallView {
    pub steps: Vec<StepState>,
    pub system_status: SystemStatus,
    pub logs: Vec<LogEntry>,
    pub progress: Option<ProgressView>,
    pub question: Option<QuestionState>,
    pub release: ReleaseView,
    pub extras: ExtrasState,
    /// Post-exit command requested by the engine
    pub exec: Option<Vec<String>>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    log_limit: usize,
}

impl Default for InstallView {
    fn default() -> Self {
        Self::new()
    }
}

impl InstallView {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            system_status: SystemStatus::default(),
            logs: Vec::new(),
            progress: None,
            question: None,
            release: ReleaseView::default(),
            extras: ExtrasState::inactive(),
            exec: None,
            started_at: Utc::now(),
            ended_at: None,
            log_limit: DEFAULT_LOG_LIMIT,
        }
    }

    pub fn with_log_limit(mut self, limit: usize) -> Self {
        self.log_limit = limit;
        self
    }

    pub fn step(&self, id: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn status_of(&self, id: &str) -> Option<StepStatus> {
        self.step(id).map(|s| s.status)
    }

    /// Every quest step has reached a terminal status
    pub fn is_complete(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.status.is_terminal())
    }

    /// Forget the outstanding question once it has been answered.
    pub fn clear_question(&mut self, question_id: &str) {
        if self.question.as_ref().is_some_and(|q| q.id == question_id) {
            self.question = None;
        }
    }

    /// Fold one event into the view.
    pub fn apply(&mut self, ev: &Event) {
        match (&ev.kind, &ev.payload) {
            (EventKind::Steps, Payload::Steps(steps)) => {
                self.steps = steps.clone();
            }
            (EventKind::StepStart, payload) => {
                if !is_internal_step(ev.step()) {
                    let label = match payload {
                        Payload::StepStart(start) if !start.label.is_empty() => start.label.as_str(),
                        _ => ev.step(),
                    };
                    self.start_step(ev.step(), label);
                }
                if ev.step() == FETCH_RELEASE_STEP {
                    self.release.loading = true;
                    self.release.error.clear();
                }
            }
            (EventKind::StepDone, payload) => {
                let outcome = match payload {
                    Payload::StepDone(outcome) => Some(outcome),
                    _ => None,
                };
                let ok = outcome.is_none_or(|o| o.ok);
                if !is_internal_step(ev.step()) {
                    let status = match (ok, ev.severity) {
                        (true, _) => StepStatus::Done,
                        (false, Severity::Error) => StepStatus::Error,
                        (false, _) => StepStatus::Warn,
                    };
                    self.advance_step(ev.step(), status);
                    if self.is_complete() && self.ended_at.is_none() {
                        self.ended_at = Some(ev.timestamp);
                    }
                }
                if ev.step() == FETCH_RELEASE_STEP {
                    self.release.loading = false;
                    if let Some(release) = outcome.and_then(|o| o.release.clone()) {
                        self.release.highest = Some(release);
                        self.release.error.clear();
                    }
                }
            }
            (EventKind::Progress, Payload::Progress(reading)) => {
                self.progress = Some(ProgressView {
                    step_id: ev.step().to_string(),
                    current: reading.current,
                    total: reading.total,
                    unit: reading.unit.clone(),
                });
            }
            (EventKind::SystemStatus, Payload::SystemStatus(status)) => {
                self.system_status = status.clone().normalize();
            }
            (EventKind::Warning | EventKind::Error, Payload::Log(log)) => {
                self.push_log(ev, log);
                if ev.kind == EventKind::Error {
                    self.advance_step(ev.step(), StepStatus::Error);
                }
                if ev.step() == FETCH_RELEASE_STEP {
                    self.release.loading = false;
                    self.release.error = if log.message.is_empty() {
                        ev.kind.to_string()
                    } else {
                        log.message.clone()
                    };
                }
            }
            (EventKind::Log, Payload::Question(question)) => {
                self.question = Some(question.clone());
            }
            (EventKind::Log, Payload::Log(log)) => self.push_log(ev, log),
            (EventKind::Extras, Payload::Extras(state)) => self.merge_extras(state),
            (EventKind::ExecRequest, Payload::Exec(request)) => {
                self.exec = Some(request.command.clone());
            }
            _ => {}
        }
    }

    fn start_step(&mut self, id: &str, label: &str) {
        if id.is_empty() {
            return;
        }
        match self.steps.iter_mut().find(|s| s.id == id) {
            Some(step) => {
                if step.advance(StepStatus::Active) {
                    step.label = label.to_string();
                }
            }
            None => {
                let mut step = StepState::new(id, label);
                step.advance(StepStatus::Active);
                self.steps.push(step);
            }
        }
    }

    fn advance_step(&mut self, id: &str, status: StepStatus) {
        if let Some(step) = self.steps.iter_mut().find(|s| s.id == id) {
            step.advance(status);
        }
    }

    fn push_log(&mut self, ev: &Event, log: &LogMessage) {
        let entry = LogEntry::from_event(ev, log);
        let replace = self.logs.last().is_some_and(|last| {
            last.step_id == entry.step_id
                && match log.op {
                    LogOp::Append => false,
                    LogOp::ReplaceLast => true,
                    LogOp::ReplaceLastIfSame => match (&last.inline, &entry.inline) {
                        (Some(prev), Some(next)) => prev.key == next.key,
                        _ => false,
                    },
                }
        });
        if replace {
            if let Some(last) = self.logs.last_mut() {
                *last = entry;
            }
            return;
        }
        self.logs.push(entry);
        if self.log_limit > 0 && self.logs.len() > self.log_limit {
            let excess = self.logs.len() - self.log_limit;
            self.logs.drain(..excess);
        }
    }

    fn merge_extras(&mut self, next: &ExtrasState) {
        let mut merged = next.clone();
        if self.extras.active && next.active {
            for result in &mut merged.results {
                let Some(prev) = self.extras.results.iter().find(|p| p.name == result.name) else {
                    continue;
                };
                let mut probe = prev.clone();
                if !probe.advance(result.status) && prev.status != result.status {
                    *result = prev.clone();
                }
            }
        }
        self.extras = merged;
    }
}
