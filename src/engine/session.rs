//! Engine-side view of one run: the event sink, the action queue and the
//! cancellation token, plus the blocking question helpers built on them.

use crate::protocol::{Action, ActionKind, ActionSource, EventSink, QuestionState};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Race `work` against `cancel`.
pub async fn until_cancelled<F: Future>(cancel: &CancellationToken, work: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = work => Some(out),
    }
}

pub struct Session {
    sink: EventSink,
    actions: ActionSource,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(sink: EventSink, actions: ActionSource, cancel: CancellationToken) -> Self {
        Self {
            sink,
            actions,
            cancel,
        }
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Await `work` unless the run is cancelled first.
    ///
    /// `None` means cancellation won; `work` is dropped, which kills any
    /// child it spawned with `kill_on_drop`.
    pub async fn or_cancelled<F: Future>(&self, work: F) -> Option<F::Output> {
        until_cancelled(&self.cancel, work).await
    }

    /// Ask a select question on `step` and wait for an enabled option id.
    ///
    /// Replies naming a disabled or unknown option are discarded like stale
    /// ones. `None` means the run was cancelled or the consumer went away.
    pub async fn ask_select(&mut self, step: &str, question: QuestionState) -> Option<String> {
        let id = question.id.clone();
        self.sink.question(step, question.clone()).await;
        loop {
            let reply = self
                .actions
                .reply_to(&self.cancel, ActionKind::AnswerSelect, &id)
                .await?;
            let option_id = reply.option_id.trim();
            if question.options.is_empty() || question.accepts(option_id) {
                return Some(option_id.to_string());
            }
            debug!(question = %id, option = option_id, "ignoring answer for unavailable option");
        }
    }

    /// Ask an input question on `step` and wait for the raw text.
    pub async fn ask_input(&mut self, step: &str, question: QuestionState) -> Option<String> {
        let id = question.id.clone();
        self.sink.question(step, question).await;
        self.actions
            .reply_to(&self.cancel, ActionKind::AnswerInput, &id)
            .await
            .map(|reply| reply.text)
    }

    /// Wait for the extras decision correlated to `question_id`.
    pub async fn extras_decision(&mut self, question_id: &str) -> Option<Action> {
        self.actions
            .reply_to(&self.cancel, ActionKind::ExtrasDecision, question_id)
            .await
    }
}
