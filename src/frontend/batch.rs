//! Non-interactive front end (`--cli`)
//!
//! Prints one line per event. Questions cannot be answered here: the
//! self-update offer is skipped, extras are declined unless `--extras` named
//! them, a failed database connection exits. Any other question means a
//! required flag was missing.

use super::{Consumer, LinePrinter, Outcome};
use crate::engine::database::{EXIT_OPTION, RETRY_QUESTION};
use crate::engine::extras::PROMPT_QUESTION;
use crate::engine::self_update::{SELF_UPDATE_QUESTION, SKIP_OPTION};
use crate::protocol::{Action, ActionSender, Event, EventKind, Payload, QuestionState};
use crate::report::EventLogger;
use std::io::Write;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const BANNER: &str = "Running installer in CLI mode (no TUI).";

/// Flag that supplies the answer to `question_id`
pub fn flag_for(question_id: &str) -> Option<&'static str> {
    let flag = match question_id {
        "db_type" | "db_driver" => "--db-type",
        "db_host" => "--db-host",
        "db_name" | "db_sqlite_path" => "--db-name",
        "db_user" => "--db-user",
        "db_password" => "--db-password",
        "admin_username" => "--admin-username",
        "admin_email" => "--admin-email",
        "admin_password" => "--admin-password",
        "admin_directory" => "--admin-directory",
        "language" => "--language",
        _ => return None,
    };
    Some(flag)
}

pub fn missing_input_message(question: &QuestionState) -> String {
    match flag_for(&question.id) {
        Some(flag) => format!("CLI mode is non-interactive; provide {flag} to continue."),
        None => "CLI mode is non-interactive; missing required input.".to_string(),
    }
}

pub struct Batch<O: Write, E: Write> {
    printer: LinePrinter<O, E>,
    actions: ActionSender,
    cancel: CancellationToken,
    failed: bool,
}

impl<O: Write, E: Write> Batch<O, E> {
    pub fn new(printer: LinePrinter<O, E>, actions: ActionSender, cancel: CancellationToken) -> Self {
        Self {
            printer,
            actions,
            cancel,
            failed: false,
        }
    }

    pub fn into_printer(self) -> LinePrinter<O, E> {
        self.printer
    }

    /// Consume events until the engine closes the queue or the run is
    /// cancelled.
    pub async fn drive(&mut self, mut events: mpsc::Receiver<Event>, logger: &mut EventLogger) -> Outcome {
        self.printer.say(BANNER);
        let mut consumer = Consumer::new(logger);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                ev = events.recv() => Some(ev),
            };
            match next {
                Some(Some(ev)) => self.handle(&mut consumer, &ev),
                Some(None) => break,
                None => {
                    // Whatever the engine queued before it saw the cancellation.
                    while let Ok(ev) = events.try_recv() {
                        self.handle(&mut consumer, &ev);
                    }
                    if self.failed {
                        consumer.mark_failure();
                    }
                    return consumer.finish(self.failed, true);
                }
            }
        }

        if self.failed {
            consumer.mark_failure();
        }
        consumer.finish(self.failed, false)
    }

    fn handle(&mut self, consumer: &mut Consumer<'_>, ev: &Event) {
        consumer.observe(ev);
        if let Some(question) = ev.question() {
            self.answer(question);
            consumer.view.clear_question(&question.id);
            return;
        }
        match (&ev.kind, &ev.payload) {
            (EventKind::Error, _) => self.failed = true,
            (EventKind::StepDone, Payload::StepDone(outcome)) if !outcome.ok => self.failed = true,
            _ => {}
        }
        self.printer.print(ev);
    }

    fn answer(&mut self, question: &QuestionState) {
        debug!(question = %question.id, "question in batch mode");
        match question.id.as_str() {
            SELF_UPDATE_QUESTION => {
                self.actions.send(Action::select(&question.id, SKIP_OPTION));
                self.printer
                    .say("Installer update available; skipping in --cli mode.");
            }
            PROMPT_QUESTION => {
                self.actions.send(Action::select(&question.id, "no"));
                self.printer
                    .say("Skipping extras in --cli mode; pass --extras to install them.");
            }
            RETRY_QUESTION => {
                self.actions.send(Action::select(&question.id, EXIT_OPTION));
                self.failed = true;
                self.printer
                    .complain("Database connection failed; exiting (no retry in --cli mode).");
            }
            _ => {
                self.failed = true;
                self.printer.complain(&missing_input_message(question));
                self.cancel.cancel();
            }
        }
    }
}

/// Run the batch front end on stdout/stderr.
pub async fn run(
    events: mpsc::Receiver<Event>,
    actions: ActionSender,
    cancel: CancellationToken,
    logger: &mut EventLogger,
    quiet: bool,
) -> Outcome {
    let mut batch = Batch::new(LinePrinter::stdio(quiet), actions, cancel);
    batch.drive(events, logger).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ActionKind, QuestionOption, action_channel, event_channel};
    use crate::report::ReportConfig;

    #[test]
    fn test_missing_input_names_flag() {
        let q = QuestionState::input("db_sqlite_path", "Path?", "");
        assert_eq!(
            missing_input_message(&q),
            "CLI mode is non-interactive; provide --db-name to continue."
        );
        let q = QuestionState::input("something_else", "?", "");
        assert_eq!(
            missing_input_message(&q),
            "CLI mode is non-interactive; missing required input."
        );
    }

    #[tokio::test]
    async fn test_db_retry_answers_exit() {
        let cancel = CancellationToken::new();
        let (sink, rx) = event_channel(cancel.clone(), "install");
        let (tx, mut actions) = action_channel();

        let question = QuestionState::select(
            RETRY_QUESTION,
            "Database connection failed",
            vec![
                QuestionOption::enabled(EXIT_OPTION, "Exit installation"),
                QuestionOption::enabled("retry", "Try again"),
            ],
        );
        sink.question("database", question).await;
        drop(sink);

        let mut logger = EventLogger::new(ReportConfig::default());
        let mut batch = Batch::new(LinePrinter::new(Vec::new(), Vec::new(), false), tx, cancel.clone());
        let outcome = batch.drive(rx, &mut logger).await;

        assert!(outcome.failed);
        assert!(!outcome.cancelled);
        let action = actions.next(&cancel).await.unwrap();
        assert_eq!(action.kind, ActionKind::AnswerSelect);
        assert_eq!(action.option_id, EXIT_OPTION);

        let (out, err) = batch.into_printer().into_parts();
        assert_eq!(String::from_utf8(out).unwrap(), format!("{BANNER}\n"));
        assert!(String::from_utf8(err).unwrap().contains("no retry in --cli mode"));
    }

    #[tokio::test]
    async fn test_extras_prompt_declined() {
        let cancel = CancellationToken::new();
        let (sink, rx) = event_channel(cancel.clone(), "install");
        let (tx, mut actions) = action_channel();
        sink.question("extras", crate::engine::extras::prompt_question())
            .await;
        drop(sink);

        let mut logger = EventLogger::new(ReportConfig::default());
        let mut batch = Batch::new(LinePrinter::new(Vec::new(), Vec::new(), false), tx, cancel.clone());
        let outcome = batch.drive(rx, &mut logger).await;

        assert_eq!(outcome, Outcome::default());
        let action = actions.next(&cancel).await.unwrap();
        assert_eq!(action.question_id, PROMPT_QUESTION);
        assert_eq!(action.option_id, "no");
    }

    #[tokio::test]
    async fn test_unanswerable_question_cancels() {
        let cancel = CancellationToken::new();
        let (sink, rx) = event_channel(cancel.clone(), "install");
        let (tx, _actions) = action_channel();

        sink.step_start("database", "Step 2: Check database connection", 2, 8)
            .await;
        sink.question("database", QuestionState::input("admin_email", "Email?", ""))
            .await;

        let mut logger = EventLogger::new(ReportConfig::default());
        let mut batch = Batch::new(LinePrinter::new(Vec::new(), Vec::new(), false), tx, cancel.clone());
        let outcome = batch.drive(rx, &mut logger).await;

        assert!(cancel.is_cancelled());
        assert!(outcome.cancelled);
        assert_eq!(outcome.error_message(), Some("installation cancelled"));
        assert!(logger.had_error());

        let (out, err) = batch.into_printer().into_parts();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("==> [database] Step 2: Check database connection"));
        assert!(String::from_utf8(err).unwrap().contains("provide --admin-email"));
        drop(sink);
    }
}
