//! Event/action protocol
//!
//! The engine talks to exactly one consumer through two bounded queues:
//! typed [`Event`]s flow out, [`Action`]s (answers to questions) flow back.
//!
//! - The engine is the only writer of the event queue. Dropping the last
//!   [`EventSink`] closes it, and that closure is the completion signal.
//! - Emission checks the cancellation token first and becomes a no-op once
//!   it has fired, so a vanished consumer never blocks the engine.
//! - [`ActionSender::send`] never blocks. A full queue drops the answer.

use crate::extras::{ExtrasSelection, ExtrasState};
use crate::release::ReleaseInfo;
use crate::status::SystemStatus;
use crate::steps::{QuestStep, StepState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use strum::Display;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const EVENT_QUEUE_CAPACITY: usize = 256;
pub const ACTION_QUEUE_CAPACITY: usize = 16;

/// Mask used wherever a secret would otherwise be echoed
pub const SECRET_MASK: &str = "••••••••";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Steps,
    StepStart,
    StepDone,
    Progress,
    Log,
    SystemStatus,
    Warning,
    Error,
    ExecRequest,
    Extras,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Trace,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepStart {
    pub label: String,
    pub index: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub ok: bool,
    /// Set on the release detection step
    pub release: Option<ReleaseInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressReading {
    pub current: u64,
    pub total: u64,
    pub unit: String,
}

/// How a log line relates to the previous one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOp {
    #[default]
    Append,
    /// Replace the last entry of the same step
    ReplaceLast,
    /// Replace the last entry only if it carries the same inline progress key
    ReplaceLastIfSame,
}

/// An in-place progress bar line from the install subprocess
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineProgress {
    pub key: String,
    pub label: String,
    pub pct: u8,
    pub tail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogMessage {
    pub message: String,
    pub fields: BTreeMap<String, String>,
    pub op: LogOp,
    pub inline: Option<InlineProgress>,
}

impl LogMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn op(mut self, op: LogOp) -> Self {
        self.op = op;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QuestionKind {
    Select,
    Input,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuestionOption {
    pub id: String,
    pub label: String,
    pub enabled: bool,
    pub reason: String,
}

impl QuestionOption {
    pub fn enabled(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            enabled: true,
            reason: String::new(),
        }
    }

    pub fn disabled(id: impl Into<String>, label: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            enabled: false,
            reason: reason.into(),
        }
    }
}

/// A question the engine is blocked on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuestionState {
    pub id: String,
    pub kind: QuestionKind,
    pub prompt: String,
    pub options: Vec<QuestionOption>,
    pub selected: usize,
    pub default: String,
    pub secret: bool,
}

impl QuestionState {
    pub fn select(id: impl Into<String>, prompt: impl Into<String>, options: Vec<QuestionOption>) -> Self {
        Self {
            id: id.into(),
            kind: QuestionKind::Select,
            prompt: prompt.into(),
            options,
            selected: 0,
            default: String::new(),
            secret: false,
        }
    }

    pub fn input(id: impl Into<String>, prompt: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: QuestionKind::Input,
            prompt: prompt.into(),
            options: Vec::new(),
            selected: 0,
            default: default.into(),
            secret: false,
        }
    }

    pub fn with_selected(mut self, index: usize) -> Self {
        self.selected = index;
        self
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    /// Whether `option_id` names an enabled option of this question
    pub fn accepts(&self, option_id: &str) -> bool {
        self.options
            .iter()
            .any(|o| o.enabled && o.id == option_id)
    }

    pub fn option(&self, option_id: &str) -> Option<&QuestionOption> {
        self.options.iter().find(|o| o.id == option_id)
    }
}

/// Command the consumer should run after it exits
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Steps(Vec<StepState>),
    StepStart(StepStart),
    StepDone(StepOutcome),
    Progress(ProgressReading),
    Log(LogMessage),
    Question(QuestionState),
    SystemStatus(SystemStatus),
    Extras(ExtrasState),
    Exec(ExecRequest),
}

/// One observable state change of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub step_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub severity: Severity,
    pub payload: Payload,
}

impl Event {
    pub fn new(
        kind: EventKind,
        step_id: &str,
        source: &str,
        severity: Severity,
        payload: Payload,
    ) -> Self {
        Self {
            kind,
            step_id: (!step_id.is_empty()).then(|| step_id.to_string()),
            timestamp: Utc::now(),
            source: source.to_string(),
            severity,
            payload,
        }
    }

    pub fn step(&self) -> &str {
        self.step_id.as_deref().unwrap_or_default()
    }

    pub fn log_message(&self) -> Option<&LogMessage> {
        match &self.payload {
            Payload::Log(log) => Some(log),
            _ => None,
        }
    }

    pub fn question(&self) -> Option<&QuestionState> {
        match &self.payload {
            Payload::Question(q) => Some(q),
            _ => None,
        }
    }
}

/// Engine-side handle on the event queue, scoped to one `source`.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    source: String,
}

impl EventSink {
    /// Same queue, events tagged with another source
    pub fn with_source(&self, source: &str) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
            source: source.to_string(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Deliver `event`. Returns false once cancelled or the consumer is gone.
    pub async fn emit(&self, event: Event) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    async fn emit_payload(&self, kind: EventKind, step: &str, severity: Severity, payload: Payload) -> bool {
        self.emit(Event::new(kind, step, &self.source, severity, payload))
            .await
    }

    pub async fn steps(&self, steps: Vec<StepState>) -> bool {
        self.emit_payload(EventKind::Steps, "", Severity::Info, Payload::Steps(steps))
            .await
    }

    pub async fn step_start(&self, step: &str, label: &str, index: usize, total: usize) -> bool {
        let payload = Payload::StepStart(StepStart {
            label: label.to_string(),
            index,
            total,
        });
        self.emit_payload(EventKind::StepStart, step, Severity::Info, payload)
            .await
    }

    /// Start one of the quest track steps
    pub async fn quest_start(&self, step: QuestStep) -> bool {
        self.step_start(step.id(), step.label(), step.index(), QuestStep::TOTAL)
            .await
    }

    pub async fn step_done(&self, step: &str, ok: bool, severity: Severity) -> bool {
        let payload = Payload::StepDone(StepOutcome { ok, release: None });
        self.emit_payload(EventKind::StepDone, step, severity, payload)
            .await
    }

    pub async fn release_done(&self, step: &str, release: ReleaseInfo) -> bool {
        let payload = Payload::StepDone(StepOutcome {
            ok: true,
            release: Some(release),
        });
        self.emit_payload(EventKind::StepDone, step, Severity::Info, payload)
            .await
    }

    pub async fn progress(&self, step: &str, current: u64, total: u64) -> bool {
        let payload = Payload::Progress(ProgressReading {
            current,
            total,
            unit: "pct".to_string(),
        });
        self.emit_payload(EventKind::Progress, step, Severity::Info, payload)
            .await
    }

    pub async fn log(&self, step: &str, message: impl Into<String>) -> bool {
        self.log_with(step, LogMessage::new(message)).await
    }

    pub async fn log_with(&self, step: &str, log: LogMessage) -> bool {
        self.emit_payload(EventKind::Log, step, Severity::Info, Payload::Log(log))
            .await
    }

    pub async fn warn(&self, step: &str, message: impl Into<String>) -> bool {
        self.warn_with(step, LogMessage::new(message)).await
    }

    pub async fn warn_with(&self, step: &str, log: LogMessage) -> bool {
        self.emit_payload(EventKind::Warning, step, Severity::Warn, Payload::Log(log))
            .await
    }

    pub async fn error(&self, step: &str, message: impl Into<String>) -> bool {
        self.error_with(step, LogMessage::new(message)).await
    }

    pub async fn error_with(&self, step: &str, log: LogMessage) -> bool {
        self.emit_payload(EventKind::Error, step, Severity::Error, Payload::Log(log))
            .await
    }

    pub async fn question(&self, step: &str, question: QuestionState) -> bool {
        self.emit_payload(EventKind::Log, step, Severity::Info, Payload::Question(question))
            .await
    }

    pub async fn system_status(&self, step: &str, status: SystemStatus, severity: Severity) -> bool {
        self.emit_payload(EventKind::SystemStatus, step, severity, Payload::SystemStatus(status))
            .await
    }

    pub async fn extras(&self, step: &str, state: ExtrasState) -> bool {
        self.emit_payload(EventKind::Extras, step, Severity::Info, Payload::Extras(state))
            .await
    }

    pub async fn exec_request(&self, step: &str, command: Vec<String>) -> bool {
        let payload = Payload::Exec(ExecRequest { command });
        self.emit_payload(EventKind::ExecRequest, step, Severity::Info, payload)
            .await
    }
}

/// Create the bounded event queue. Emission stops once `cancel` fires.
pub fn event_channel(cancel: CancellationToken, source: &str) -> (EventSink, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let sink = EventSink {
        tx,
        cancel,
        source: source.to_string(),
    };
    (sink, rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionKind {
    AnswerSelect,
    AnswerInput,
    ExtrasDecision,
}

/// A reply correlated to a question by `question_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    pub question_id: String,
    pub option_id: String,
    pub text: String,
    pub values: Vec<String>,
    pub extras: Vec<ExtrasSelection>,
}

impl Action {
    pub fn select(question_id: impl Into<String>, option_id: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::AnswerSelect,
            question_id: question_id.into(),
            option_id: option_id.into(),
            text: String::new(),
            values: Vec::new(),
            extras: Vec::new(),
        }
    }

    pub fn input(question_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::AnswerInput,
            question_id: question_id.into(),
            option_id: String::new(),
            text: text.into(),
            values: Vec::new(),
            extras: Vec::new(),
        }
    }

    pub fn extras_decision(
        question_id: impl Into<String>,
        option_id: impl Into<String>,
        extras: Vec<ExtrasSelection>,
    ) -> Self {
        Self {
            kind: ActionKind::ExtrasDecision,
            question_id: question_id.into(),
            option_id: option_id.into(),
            text: String::new(),
            values: Vec::new(),
            extras,
        }
    }
}

/// Consumer-side handle on the action queue
#[derive(Debug, Clone)]
pub struct ActionSender {
    tx: mpsc::Sender<Action>,
}

impl ActionSender {
    /// Enqueue or drop. Answers arriving after their question closed are
    /// discarded by the engine anyway.
    pub fn send(&self, action: Action) -> bool {
        match self.tx.try_send(action) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "dropping action");
                false
            }
        }
    }
}

/// Engine-side handle on the action queue
#[derive(Debug)]
pub struct ActionSource {
    rx: mpsc::Receiver<Action>,
}

impl ActionSource {
    /// Next action, or `None` once cancelled or every sender is gone.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Option<Action> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            action = self.rx.recv() => action,
        }
    }

    /// Wait for a reply of `kind` to `question_id`, discarding anything else.
    pub async fn reply_to(
        &mut self,
        cancel: &CancellationToken,
        kind: ActionKind,
        question_id: &str,
    ) -> Option<Action> {
        loop {
            let action = self.next(cancel).await?;
            if action.kind == kind && action.question_id == question_id {
                return Some(action);
            }
            tracing::debug!(
                expected = question_id,
                got = %action.question_id,
                "discarding stale action"
            );
        }
    }
}

pub fn action_channel() -> (ActionSender, ActionSource) {
    let (tx, rx) = mpsc::channel(ACTION_QUEUE_CAPACITY);
    (ActionSender { tx }, ActionSource { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_after_cancel_is_noop() {
        let cancel = CancellationToken::new();
        let (sink, mut rx) = event_channel(cancel.clone(), "install");
        assert!(sink.log("php", "first").await);
        cancel.cancel();
        assert!(!sink.log("php", "second").await);
        drop(sink);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.log_message().unwrap().message, "first");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_emit_does_not_block_when_full_and_cancelled() {
        let cancel = CancellationToken::new();
        let (sink, _rx) = event_channel(cancel.clone(), "install");
        for _ in 0..EVENT_QUEUE_CAPACITY {
            assert!(sink.log("", "filler").await);
        }
        let pending = tokio::spawn({
            let sink = sink.clone();
            async move { sink.log("", "blocked").await }
        });
        cancel.cancel();
        assert!(!pending.await.unwrap());
    }

    #[tokio::test]
    async fn test_event_fields() {
        let (sink, mut rx) = event_channel(CancellationToken::new(), "install");
        sink.quest_start(QuestStep::Download).await;
        sink.with_source("extras").warn("", "careful").await;
        drop(sink);

        let start = rx.recv().await.unwrap();
        assert_eq!(start.kind, EventKind::StepStart);
        assert_eq!(start.step(), "download");
        assert_eq!(
            start.payload,
            Payload::StepStart(StepStart {
                label: "Step 3: Download Evolution CMS".to_string(),
                index: 3,
                total: 8,
            })
        );

        let warning = rx.recv().await.unwrap();
        assert_eq!(warning.kind, EventKind::Warning);
        assert_eq!(warning.severity, Severity::Warn);
        assert_eq!(warning.source, "extras");
        assert_eq!(warning.step_id, None);
    }

    #[test]
    fn test_action_send_drops_when_full() {
        let (sender, _source) = action_channel();
        for i in 0..ACTION_QUEUE_CAPACITY {
            assert!(sender.send(Action::input("db_name", format!("db{i}"))));
        }
        assert!(!sender.send(Action::input("db_name", "overflow")));
    }

    #[tokio::test]
    async fn test_reply_to_discards_mismatched_ids() {
        let cancel = CancellationToken::new();
        let (sender, mut source) = action_channel();
        sender.send(Action::input("db_host", "stale"));
        sender.send(Action::select("db_name", "wrong-kind"));
        sender.send(Action::input("db_name", "evo"));

        let reply = source
            .reply_to(&cancel, ActionKind::AnswerInput, "db_name")
            .await
            .unwrap();
        assert_eq!(reply.text, "evo");
    }

    #[tokio::test]
    async fn test_reply_to_observes_cancellation() {
        let cancel = CancellationToken::new();
        let (_sender, mut source) = action_channel();
        cancel.cancel();
        assert!(source.reply_to(&cancel, ActionKind::AnswerInput, "x").await.is_none());
    }

    #[test]
    fn test_question_accepts_only_enabled_options() {
        let q = QuestionState::select(
            "db_driver",
            "Which database driver do you want to use?",
            vec![
                QuestionOption::enabled("mysql", "MySQL or MariaDB"),
                QuestionOption::disabled("pgsql", "PostgreSQL", "Missing PDO driver: pdo_pgsql"),
            ],
        );
        assert!(q.accepts("mysql"));
        assert!(!q.accepts("pgsql"));
        assert!(!q.accepts("sqlite"));
    }
}
