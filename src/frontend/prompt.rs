//! Interactive front end
//!
//! Prints the same event lines as batch mode and answers each question with
//! a terminal prompt. Prompts block, so they run on the blocking pool while
//! the run stays cancellable.

use super::{Consumer, LinePrinter, Outcome};
use crate::engine::extras::{INSTALL_OPTION, SELECT_QUESTION, SKIP_OPTION};
use crate::extras::{ExtrasPackage, ExtrasSelection, ExtrasStage, ExtrasState};
use crate::protocol::{
    Action, ActionSender, Event, EventKind, Payload, QuestionKind, QuestionOption, QuestionState,
};
use crate::report::EventLogger;
use inquire::{InquireError, MultiSelect, Password, PasswordDisplayMode, Select, Text};
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PAGE_SIZE: usize = 10;

/// A selectable question option
#[derive(Debug, Clone)]
struct Choice {
    id: String,
    label: String,
}

impl From<&QuestionOption> for Choice {
    fn from(option: &QuestionOption) -> Self {
        Self {
            id: option.id.clone(),
            label: option.label.clone(),
        }
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.label.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}", self.label)
        }
    }
}

#[derive(Debug, Clone)]
struct PackageChoice(ExtrasPackage);

impl fmt::Display for PackageChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pkg = &self.0;
        let version = pkg.default_version();
        write!(f, "{}", pkg.name)?;
        if !version.is_empty() {
            write!(f, " ({version})")?;
        }
        // Multi-line descriptions break the list layout.
        if let Some(first) = pkg.description.lines().next().filter(|l| !l.trim().is_empty()) {
            write!(f, " - {}", first.trim())?;
        }
        Ok(())
    }
}

/// Versions offered for `pkg`, its default first.
pub fn version_candidates(pkg: &ExtrasPackage) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    let all = std::iter::once(pkg.default_version())
        .chain(std::iter::once(pkg.version.clone()))
        .chain(pkg.versions.iter().cloned())
        .chain(std::iter::once(pkg.default_branch.clone()));
    for version in all {
        let version = version.trim().to_string();
        if !version.is_empty() && !candidates.contains(&version) {
            candidates.push(version);
        }
    }
    candidates
}

/// Ask `question` on the terminal and build the reply.
fn answer(question: &QuestionState) -> Result<Action, InquireError> {
    match question.kind {
        QuestionKind::Select => {
            for option in question.options.iter().filter(|o| !o.enabled) {
                eprintln!("  {} is unavailable: {}", option.label, option.reason);
            }
            let choices: Vec<Choice> = question
                .options
                .iter()
                .filter(|o| o.enabled)
                .map(Choice::from)
                .collect();
            if choices.is_empty() {
                return Err(InquireError::InvalidConfiguration(
                    "no selectable options".to_string(),
                ));
            }
            let preferred = question.options.get(question.selected).map(|o| o.id.as_str());
            let cursor = choices
                .iter()
                .position(|c| Some(c.id.as_str()) == preferred)
                .unwrap_or(0);
            let choice = Select::new(&question.prompt, choices)
                .with_starting_cursor(cursor)
                .with_page_size(PAGE_SIZE)
                .prompt()?;
            Ok(Action::select(&question.id, choice.id))
        }
        QuestionKind::Input if question.secret => {
            let text = Password::new(&question.prompt)
                .without_confirmation()
                .with_display_mode(PasswordDisplayMode::Masked)
                .prompt()?;
            Ok(Action::input(&question.id, text))
        }
        QuestionKind::Input => {
            let mut prompt = Text::new(&question.prompt);
            if !question.default.is_empty() {
                prompt = prompt.with_default(&question.default);
            }
            Ok(Action::input(&question.id, prompt.prompt()?))
        }
    }
}

/// Pick extras and their versions. `None` skips the extras install.
fn choose_extras(packages: &[ExtrasPackage]) -> Result<Option<Vec<ExtrasSelection>>, InquireError> {
    let items: Vec<PackageChoice> = packages.iter().cloned().map(PackageChoice).collect();
    let chosen = MultiSelect::new("Select Extras to install", items)
        .with_page_size(PAGE_SIZE)
        .with_help_message("↑↓ navigate, space select, enter confirm, esc skip")
        .prompt_skippable()?;
    let Some(chosen) = chosen.filter(|c| !c.is_empty()) else {
        return Ok(None);
    };

    let mut selections = Vec::with_capacity(chosen.len());
    for PackageChoice(pkg) in chosen {
        let candidates = version_candidates(&pkg);
        let version = if candidates.len() > 1 {
            Select::new(&format!("Version for {}", pkg.name), candidates)
                .with_page_size(PAGE_SIZE)
                .prompt()?
        } else {
            candidates.into_iter().next().unwrap_or_default()
        };
        selections.push(ExtrasSelection::new(pkg.name, version));
    }
    Ok(Some(selections))
}

fn extras_reply(choice: Option<Vec<ExtrasSelection>>) -> Action {
    match choice {
        Some(selections) => Action::extras_decision(SELECT_QUESTION, INSTALL_OPTION, selections),
        None => Action::extras_decision(SELECT_QUESTION, SKIP_OPTION, Vec::new()),
    }
}

enum Prompted {
    Reply(Action),
    /// Operator pressed Esc or Ctrl-C
    Aborted,
    /// The terminal cannot prompt
    Failed(String),
    Cancelled,
}

/// Run a blocking prompt without holding up cancellation.
async fn prompt<F>(cancel: &CancellationToken, ask: F) -> Prompted
where
    F: FnOnce() -> Result<Action, InquireError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(ask);
    let joined = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Prompted::Cancelled,
        joined = task => joined,
    };
    match joined {
        Ok(Ok(action)) => Prompted::Reply(action),
        Ok(Err(InquireError::OperationCanceled | InquireError::OperationInterrupted)) => {
            Prompted::Aborted
        }
        Ok(Err(e)) => Prompted::Failed(e.to_string()),
        Err(e) => Prompted::Failed(e.to_string()),
    }
}

fn is_extras_selection(state: &ExtrasState) -> bool {
    state.active && state.stage == ExtrasStage::Select && !state.packages.is_empty()
}

/// Run the interactive front end on the terminal.
pub async fn run(
    mut events: mpsc::Receiver<Event>,
    actions: ActionSender,
    cancel: CancellationToken,
    logger: &mut EventLogger,
) -> Outcome {
    let mut printer = LinePrinter::stdio(false);
    let mut consumer = Consumer::new(logger);
    let mut failed = false;

    loop {
        let ev = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            ev = events.recv() => ev,
        };
        let Some(ev) = ev else {
            break;
        };
        consumer.observe(&ev);

        let prompted = if let Some(question) = ev.question() {
            let question = question.clone();
            debug!(question = %question.id, "prompting");
            Some(prompt(&cancel, move || answer(&question)).await)
        } else {
            if let Payload::Extras(state) = &ev.payload {
                if is_extras_selection(state) {
                    let packages = state.packages.clone();
                    let outcome = prompt(&cancel, move || choose_extras(&packages).map(extras_reply)).await;
                    if let Prompted::Aborted = outcome {
                        // Esc on a version picker skips extras, it does not abort the run.
                        actions.send(extras_reply(None));
                        continue;
                    }
                    Some(outcome)
                } else {
                    None
                }
            } else {
                printer.print(&ev);
                None
            }
        };

        match prompted {
            None => {}
            Some(Prompted::Reply(action)) => {
                consumer.view.clear_question(&action.question_id);
                actions.send(action);
            }
            Some(Prompted::Aborted) => {
                printer.complain("Installation aborted by operator.");
                cancel.cancel();
            }
            Some(Prompted::Failed(reason)) => {
                warn!(error = %reason, "prompt failed");
                printer.complain(&format!("Unable to prompt: {reason}"));
                failed = true;
                cancel.cancel();
            }
            Some(Prompted::Cancelled) => {}
        }

        match (&ev.kind, &ev.payload) {
            (EventKind::Error, _) => failed = true,
            (EventKind::StepDone, Payload::StepDone(outcome)) if !outcome.ok => {
                failed = true
            }
            _ => {}
        }
    }

    let cancelled = cancel.is_cancelled();
    if failed {
        consumer.mark_failure();
    }
    consumer.finish(failed, cancelled)
}
