//! Database provisioning (quest step 2)
//!
//! A retry loop: pick a driver, collect connection parameters, probe the
//! connection, and on failure ask whether to try again or exit. Drivers are
//! only selectable when the system status reports both `pdo` and the
//! driver's PDO extension as ok.

use super::Session;
use crate::config::{DbDriver, InstallOptions};
use crate::protocol::{LogMessage, LogOp, QuestionOption, QuestionState, SECRET_MASK, Severity};
use crate::status::{StatusLevel, SystemStatus};
use crate::steps::QuestStep;
use crate::toolchain::{DbParams, Toolchain};
use std::path::Path;
use strum::IntoEnumIterator;
use tracing::{debug, info};

pub const DRIVER_QUESTION: &str = "db_driver";
pub const RETRY_QUESTION: &str = "db_retry";
pub const RETRY_OPTION: &str = "retry";
pub const EXIT_OPTION: &str = "exit";

/// Longest connection error shown inside the retry prompt
const PROMPT_ERROR_MAX_CHARS: usize = 160;

const STEP: &str = QuestStep::Database.id();

/// Driver options derived from the system status.
///
/// Without any status items every driver is offered.
pub fn driver_options(status: &SystemStatus) -> Vec<QuestionOption> {
    if status.is_empty() {
        return DbDriver::iter()
            .map(|d| QuestionOption::enabled(d.to_string(), d.option_label()))
            .collect();
    }

    let pdo_ok = status.level_for("pdo") == Some(StatusLevel::Ok);
    DbDriver::iter()
        .map(|driver| {
            let id = driver.to_string();
            let label = driver.option_label();
            if !pdo_ok {
                return QuestionOption::disabled(id, label, "Missing PHP extension: pdo");
            }
            let extension = driver.pdo_extension();
            if status.level_for(extension) == Some(StatusLevel::Ok) {
                QuestionOption::enabled(id, label)
            } else {
                QuestionOption::disabled(id, label, format!("Missing PDO driver: {extension}"))
            }
        })
        .collect()
}

/// Connection error reduced to one line for the retry prompt.
pub fn prompt_error(message: &str) -> String {
    let collapsed = message.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > PROMPT_ERROR_MAX_CHARS {
        let cut: String = collapsed.chars().take(PROMPT_ERROR_MAX_CHARS).collect();
        format!("{cut}...")
    } else {
        collapsed
    }
}

fn retry_question(error: &str) -> QuestionState {
    QuestionState::select(
        RETRY_QUESTION,
        format!(
            "Database connection failed: {} — try again or exit installation?",
            prompt_error(error)
        ),
        vec![
            QuestionOption::enabled(EXIT_OPTION, "Exit installation"),
            QuestionOption::enabled(RETRY_OPTION, "Try again"),
        ],
    )
    .with_selected(1)
}

/// Ask for `id` unless `preset` already holds a value. Empty answers take
/// the default.
async fn input_or_preset(
    session: &mut Session,
    preset: &str,
    id: &str,
    prompt: &str,
    default: &str,
) -> Option<String> {
    let preset = preset.trim();
    if !preset.is_empty() {
        return Some(preset.to_string());
    }
    let answer = session
        .ask_input(STEP, QuestionState::input(id, prompt, default))
        .await?;
    let answer = answer.trim();
    Some(if answer.is_empty() { default.to_string() } else { answer.to_string() })
}

async fn select_driver(session: &mut Session, opts: &InstallOptions, status: &SystemStatus) -> Option<DbDriver> {
    let options = driver_options(status);
    let enabled: Vec<usize> = options
        .iter()
        .enumerate()
        .filter(|(_, o)| o.enabled)
        .map(|(i, _)| i)
        .collect();
    let sink = session.sink();

    let Some(&first_enabled) = enabled.first() else {
        sink.error(
            STEP,
            "No supported PDO database drivers are available. \
             Please install one of: pdo_mysql, pdo_pgsql, pdo_sqlite, pdo_sqlsrv.",
        )
        .await;
        sink.step_done(STEP, false, Severity::Error).await;
        return None;
    };

    let requested = opts.db_type.trim().to_lowercase();
    if !requested.is_empty() {
        match options.iter().find(|o| o.id == requested) {
            Some(option) if option.enabled => return DbDriver::parse(&option.id),
            Some(option) => {
                let reason = option.reason.trim();
                let reason = if reason.is_empty() { "not available" } else { reason };
                sink.warn(
                    STEP,
                    format!("Requested database driver '{requested}' cannot be used: {reason}."),
                )
                .await;
            }
            None => {
                sink.warn(STEP, format!("Unknown database driver requested: '{requested}'."))
                    .await;
            }
        }
    }

    if enabled.len() == 1 {
        return DbDriver::parse(&options[first_enabled].id);
    }
    let question = QuestionState::select(DRIVER_QUESTION, "Which database driver do you want to use?", options)
        .with_selected(first_enabled);
    let answer = session.ask_select(STEP, question).await?;
    DbDriver::parse(&answer)
}

async fn collect_params(session: &mut Session, opts: &InstallOptions, driver: DbDriver) -> Option<DbParams> {
    if driver == DbDriver::Sqlite {
        let path = input_or_preset(
            session,
            &opts.db_name,
            "db_sqlite_path",
            "What is the path to your SQLite database file?",
            "database.sqlite",
        )
        .await?;
        session
            .sink()
            .log(STEP, format!("Selected database path: {path}."))
            .await;
        return Some(DbParams::sqlite(path));
    }

    let host = input_or_preset(
        session,
        &opts.db_host,
        "db_host",
        "Where is your database server located?",
        "localhost",
    )
    .await?;
    session.sink().log(STEP, format!("Selected database host: {host}.")).await;

    let name = input_or_preset(session, &opts.db_name, "db_name", "What is your database name?", "evo_db")
        .await?;
    session.sink().log(STEP, format!("Selected database name: {name}.")).await;

    let user = input_or_preset(session, &opts.db_user, "db_user", "What is your database username?", "root")
        .await?;
    session.sink().log(STEP, format!("Selected database user: {user}.")).await;

    let password = if opts.db_password.is_empty() {
        session
            .ask_input(
                STEP,
                QuestionState::input("db_password", "What is your database password?", "").secret(),
            )
            .await?
    } else {
        opts.db_password.clone()
    };
    let shown = if password.trim().is_empty() { "(empty)" } else { SECRET_MASK };
    session
        .sink()
        .log(STEP, format!("Selected database password: {shown}."))
        .await;

    Some(DbParams {
        driver,
        host,
        port: opts.db_port.filter(|p| *p > 0).unwrap_or(driver.default_port()),
        name,
        user,
        password,
    })
}

/// Run the database step up to a working connection.
///
/// Starts the step but leaves it open; the admin questions that follow
/// belong to it. `None` halts the workflow.
pub async fn provision(
    session: &mut Session,
    toolchain: &dyn Toolchain,
    opts: &InstallOptions,
    status: &SystemStatus,
    workdir: &Path,
) -> Option<DbParams> {
    session.sink().quest_start(QuestStep::Database).await;

    loop {
        let driver = select_driver(session, opts, status).await?;
        session
            .sink()
            .log(STEP, format!("Selected database driver: {}.", driver.label()))
            .await;

        let params = collect_params(session, opts, driver).await?;
        session.sink().log(STEP, "Testing database connection...").await;

        let probe = match session.or_cancelled(toolchain.test_database(workdir, &params)).await? {
            Ok(probe) => probe,
            Err(e) => {
                let sink = session.sink();
                sink.error_with(
                    STEP,
                    LogMessage::new("Database connection check failed unexpectedly.")
                        .field("error", e.to_string()),
                )
                .await;
                sink.step_done(STEP, false, Severity::Error).await;
                return None;
            }
        };
        if probe.ok {
            info!(driver = %driver, "database connection verified");
            session
                .sink()
                .log_with(
                    STEP,
                    LogMessage::new("✔ Database connection successful!").op(LogOp::ReplaceLast),
                )
                .await;
            return Some(params);
        }

        debug!(driver = %driver, "database connection failed");
        session
            .sink()
            .warn(STEP, format!("Database connection failed: {}", probe.error))
            .await;
        let choice = session.ask_select(STEP, retry_question(&probe.error)).await?;
        if choice == EXIT_OPTION {
            let sink = session.sink();
            sink.error(STEP, "Installation cancelled by user.").await;
            sink.step_done(STEP, false, Severity::Error).await;
            return None;
        }
    }
}
