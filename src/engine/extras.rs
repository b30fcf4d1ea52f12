//! Extras sub-workflow (quest step 8)
//!
//! Entered only after the core install succeeded:
//!
//! ```text
//! prerequisites → opt-in prompt → catalog → selection
//!     → install each package → artisan migrate → artisan cache:clear-full
//!     → summary
//! ```
//!
//! The opt-in prompt and the selection are skipped when packages were
//! pre-selected. In fail-fast mode the first failing package aborts the
//! remaining ones and the finishing commands.

use super::Session;
use super::session::until_cancelled;
use crate::extras::{
    DETAIL_TAIL_LINES, ExtrasItemDetail, ExtrasItemResult, ExtrasItemStatus, ExtrasPackage,
    ExtrasSelection, ExtrasStage, ExtrasState, detect_failure, last_non_empty_line,
    normalize_selections, tail_output,
};
use crate::protocol::{EventSink, QuestionOption, QuestionState, Severity};
use crate::steps::QuestStep;
use crate::toolchain::{CommandOutput, ExtrasEnv, Toolchain};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const EXTRAS_SOURCE: &str = "extras";
pub const PROMPT_QUESTION: &str = "extras_prompt";
pub const SELECT_QUESTION: &str = "extras_select";
pub const INSTALL_OPTION: &str = "install";
pub const SKIP_OPTION: &str = "skip";

const STEP: &str = QuestStep::Extras.id();
const NO_OUTPUT: &str = "(no output captured)";
const MIGRATE_LABEL: &str = "artisan migrate";
const CACHE_CLEAR_LABEL: &str = "artisan cache:clear-full";
const CANCELLED: &str = "Cancelled.";

/// Settings for one extras run
#[derive(Debug, Clone, Default)]
pub struct ExtrasRun {
    pub preselected: Vec<ExtrasSelection>,
    pub github_token: Option<String>,
    pub fail_fast: bool,
}

pub fn prompt_question() -> QuestionState {
    QuestionState::select(
        PROMPT_QUESTION,
        "Do you want to install additional packages (Extras) now?",
        vec![
            QuestionOption::enabled("yes", "Yes"),
            QuestionOption::enabled("no", "No"),
        ],
    )
}

/// Arguments for `artisan extras` installing `selection`
pub fn install_args(selection: &ExtrasSelection) -> Vec<String> {
    let mut args = vec!["extras".to_string(), "extras".to_string(), selection.name.clone()];
    let version = selection.version.trim();
    if !version.is_empty() {
        args.push(version.to_string());
    }
    args.push("--no-ansi".to_string());
    args.push("--no-interaction".to_string());
    args
}

fn message_or_error(output: &CommandOutput) -> String {
    match last_non_empty_line(&output.output) {
        Some(line) => line.to_string(),
        None => output.error.clone().unwrap_or_default(),
    }
}

/// Log every non-empty output line as `label: line`.
async fn log_output(sink: &EventSink, label: &str, output: &str) {
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        sink.log(STEP, format!("{label}: {line}")).await;
    }
}

struct Flow<'a> {
    sink: EventSink,
    toolchain: &'a dyn Toolchain,
    env: ExtrasEnv,
    token: Option<String>,
    cancel: CancellationToken,
}

impl Flow<'_> {
    async fn publish(&self, state: &ExtrasState) {
        self.sink.extras(STEP, state.clone()).await;
    }

    /// `None` when the run was cancelled while the command ran.
    async fn artisan(&self, label: &str, args: &[String]) -> Option<CommandOutput> {
        let run = self.toolchain.run_artisan(&self.env, self.token.as_deref(), args);
        let output = until_cancelled(&self.cancel, run).await?;
        log_output(&self.sink, label, &output.output).await;
        Some(output)
    }

    /// Install every selection, then run the finishing commands unless
    /// fail-fast aborted the batch.
    async fn install(&self, selections: Vec<ExtrasSelection>, fail_fast: bool) -> ExtrasState {
        let mut state = ExtrasState {
            active: true,
            stage: ExtrasStage::Progress,
            results: selections
                .iter()
                .map(|s| ExtrasItemResult::pending(s.to_string()))
                .collect(),
            total: selections.len(),
            selections,
            ..ExtrasState::default()
        };
        self.publish(&state).await;

        let mut aborted = false;
        let selections = state.selections.clone();
        for (i, selection) in selections.iter().enumerate() {
            let label = selection.to_string();
            state.current = label.clone();
            state.current_index = i + 1;
            state.results[i].advance(ExtrasItemStatus::Running);
            self.publish(&state).await;

            let Some(output) = self.artisan(&label, &install_args(selection)).await else {
                state.results[i].advance(ExtrasItemStatus::Error);
                state.results[i].message = CANCELLED.to_string();
                return state;
            };
            let failure = detect_failure(&output.output);
            if failure.is_some() || !output.success() {
                let message = failure.unwrap_or_else(|| message_or_error(&output));
                state.results[i].advance(ExtrasItemStatus::Error);
                state.results[i].message = message;
                info!(package = %label, "extras package failed");
                aborted = fail_fast;
            } else {
                state.results[i].advance(ExtrasItemStatus::Success);
            }

            let tail = tail_output(&output.output, DETAIL_TAIL_LINES);
            state.details.push(ExtrasItemDetail {
                name: label,
                output: if tail.is_empty() { NO_OUTPUT.to_string() } else { tail },
            });
            self.publish(&state).await;

            if aborted {
                break;
            }
        }

        if !aborted {
            let migrate = ["migrate".to_string(), "--force".to_string()];
            if self.finishing_command(&mut state, MIGRATE_LABEL, &migrate).await.is_none() {
                return state;
            }
            let clear = ["cache:clear-full".to_string()];
            if self.finishing_command(&mut state, CACHE_CLEAR_LABEL, &clear).await.is_none() {
                return state;
            }
        }

        state.stage = ExtrasStage::Summary;
        state.current.clear();
        self.publish(&state).await;
        state
    }

    async fn finishing_command(&self, state: &mut ExtrasState, label: &str, args: &[String]) -> Option<()> {
        let mut result = ExtrasItemResult::pending(label);
        result.advance(ExtrasItemStatus::Running);
        state.results.push(result);
        state.current = label.to_string();
        state.current_index = state.total;
        self.publish(state).await;

        let idx = state.results.len() - 1;
        let Some(output) = self.artisan(label, args).await else {
            state.results[idx].advance(ExtrasItemStatus::Error);
            state.results[idx].message = CANCELLED.to_string();
            return None;
        };
        if output.success() {
            state.results[idx].advance(ExtrasItemStatus::Success);
        } else {
            state.results[idx].advance(ExtrasItemStatus::Error);
            state.results[idx].message = message_or_error(&output);
        }
        if !output.output.trim().is_empty() {
            state.details.push(ExtrasItemDetail {
                name: label.to_string(),
                output: tail_output(&output.output, DETAIL_TAIL_LINES),
            });
        }
        self.publish(state).await;
        Some(())
    }
}

/// Run the extras step. Always ends the step exactly once.
pub async fn run(session: &mut Session, toolchain: &dyn Toolchain, workdir: &Path, settings: ExtrasRun) {
    let sink = session.sink().with_source(EXTRAS_SOURCE);
    sink.quest_start(QuestStep::Extras).await;

    let ok = drive(session, &sink, toolchain, workdir, settings).await;
    let severity = if ok { Severity::Info } else { Severity::Warn };
    sink.step_done(STEP, ok, severity).await;
}

/// Returns the step outcome.
async fn drive(
    session: &mut Session,
    sink: &EventSink,
    toolchain: &dyn Toolchain,
    workdir: &Path,
    settings: ExtrasRun,
) -> bool {
    let Some(prerequisites) = session.or_cancelled(toolchain.extras_prerequisites(workdir)).await else {
        return false;
    };
    let env = match prerequisites {
        Ok(env) => env,
        Err(e) => {
            sink.warn(STEP, format!("Extras install skipped: {e}")).await;
            return false;
        }
    };
    if let Some(warning) = &env.warning {
        sink.warn(STEP, warning.clone()).await;
    }

    let preselected = settings.preselected;
    if preselected.is_empty() {
        let Some(choice) = session.ask_select(STEP, prompt_question()).await else {
            return false;
        };
        if !choice.eq_ignore_ascii_case("yes") {
            sink.log(STEP, "Skipping extras installation.").await;
            sink.extras(STEP, ExtrasState::skipped_summary()).await;
            return true;
        }
    }

    sink.log(STEP, "Fetching extras list...").await;
    let token = settings.github_token.filter(|t| !t.trim().is_empty());
    let mut ok = true;
    let Some(listed) = session.or_cancelled(toolchain.list_extras(&env, token.as_deref())).await else {
        return false;
    };
    let packages: Vec<ExtrasPackage> = match listed {
        Ok(packages) if !packages.is_empty() => packages,
        result => {
            let message = match result {
                Err(e) => format!("Extras list unavailable: {e}"),
                Ok(_) => "Extras list unavailable.".to_string(),
            };
            sink.warn(STEP, message).await;
            ok = false;
            if preselected.is_empty() {
                return false;
            }
            Vec::new()
        }
    };

    let mut selections = if preselected.is_empty() {
        sink.extras(
            STEP,
            ExtrasState {
                active: true,
                stage: ExtrasStage::Select,
                packages: packages.clone(),
                ..ExtrasState::default()
            },
        )
        .await;
        let Some(decision) = session.extras_decision(SELECT_QUESTION).await else {
            return false;
        };
        let chosen = if decision.extras.is_empty() {
            ExtrasSelection::parse_list(&decision.values)
        } else {
            decision.extras
        };
        if decision.option_id.trim() != INSTALL_OPTION || chosen.is_empty() {
            sink.extras(STEP, ExtrasState::inactive()).await;
            sink.log(STEP, "Extras installation skipped.").await;
            sink.extras(STEP, ExtrasState::skipped_summary()).await;
            return ok;
        }
        chosen
    } else {
        preselected.clone()
    };

    if !packages.is_empty() {
        selections = normalize_selections(&packages, &selections);
    }
    if selections.is_empty() {
        sink.warn(STEP, "No valid extras selected; skipping.").await;
        sink.extras(STEP, ExtrasState::inactive()).await;
        return false;
    }

    let labels = selections
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    if !preselected.is_empty() {
        sink.log(STEP, format!("Extras preselected: {labels}")).await;
    }
    sink.log(STEP, format!("Installing extras: {labels}")).await;
    debug!(count = selections.len(), fail_fast = settings.fail_fast, "installing extras");

    let flow = Flow {
        sink: sink.clone(),
        toolchain,
        env,
        token,
        cancel: session.cancel_token().clone(),
    };
    let state = flow.install(selections, settings.fail_fast).await;
    ok && !state.has_errors()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::protocol::{Action, action_channel, event_channel};
    use crate::status::SystemStatus;
    use crate::toolchain::{DbParams, DbProbeResult, InstallPlan};
    use async_trait::async_trait;
    use tokio::process::Command;

    /// Cancels the run from inside the prerequisites check or the catalog listing.
    struct CancellingToolchain {
        cancel: CancellationToken,
        in_listing: bool,
    }

    #[async_trait]
    impl Toolchain for CancellingToolchain {
        async fn system_status(&self) -> Result<SystemStatus> {
            Ok(SystemStatus::new(Vec::new()))
        }

        async fn runtime_version(&self) -> Result<String> {
            Ok("8.3.0".to_string())
        }

        async fn test_database(&self, _workdir: &Path, _params: &DbParams) -> Result<DbProbeResult> {
            Ok(DbProbeResult {
                ok: true,
                error: String::new(),
            })
        }

        fn install_command(&self, _plan: &InstallPlan) -> Result<Command> {
            Ok(Command::new("true"))
        }

        fn updater_command(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn extras_prerequisites(&self, workdir: &Path) -> Result<ExtrasEnv> {
            if !self.in_listing {
                self.cancel.cancel();
            }
            Ok(ExtrasEnv {
                core_dir: workdir.join("core"),
                warning: None,
            })
        }

        async fn list_extras(&self, _env: &ExtrasEnv, _token: Option<&str>) -> Result<Vec<ExtrasPackage>> {
            if self.in_listing {
                self.cancel.cancel();
            }
            Ok(vec![ExtrasPackage {
                name: "sSeo".to_string(),
                version: "1.0.0".to_string(),
                ..ExtrasPackage::default()
            }])
        }

        async fn run_artisan(&self, _env: &ExtrasEnv, _token: Option<&str>, _args: &[String]) -> CommandOutput {
            CommandOutput {
                output: String::new(),
                error: None,
            }
        }
    }

    /// Drive the interactive flow with the opt-in already answered "yes".
    async fn drive_until_cancelled(in_listing: bool) -> bool {
        let cancel = CancellationToken::new();
        let (sink, _events) = event_channel(cancel.clone(), EXTRAS_SOURCE);
        let (sender, actions) = action_channel();
        sender.send(Action::select(PROMPT_QUESTION, "yes"));
        let mut session = Session::new(sink.clone(), actions, cancel.clone());
        let toolchain = CancellingToolchain { cancel, in_listing };
        drive(&mut session, &sink, &toolchain, Path::new("."), ExtrasRun::default()).await
    }

    #[tokio::test]
    async fn test_cancelled_prompt_is_not_success() {
        assert!(!drive_until_cancelled(false).await);
    }

    #[tokio::test]
    async fn test_cancelled_selection_is_not_success() {
        assert!(!drive_until_cancelled(true).await);
    }

    #[test]
    fn test_install_args() {
        let args = install_args(&ExtrasSelection::new("sSeo", "1.2.3"));
        assert_eq!(args, ["extras", "extras", "sSeo", "1.2.3", "--no-ansi", "--no-interaction"]);

        let args = install_args(&ExtrasSelection::new("sUsers", " "));
        assert_eq!(args, ["extras", "extras", "sUsers", "--no-ansi", "--no-interaction"]);
    }

    #[test]
    fn test_message_prefers_output() {
        let output = CommandOutput {
            output: "Installing\nDone with warnings\n\n".to_string(),
            error: Some("exit status: 1".to_string()),
        };
        assert_eq!(message_or_error(&output), "Done with warnings");

        let output = CommandOutput {
            output: String::new(),
            error: Some("exit status: 1".to_string()),
        };
        assert_eq!(message_or_error(&output), "exit status: 1");
    }
}
