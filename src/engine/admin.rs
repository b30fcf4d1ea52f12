//! Admin account and language questions, asked on the database step

use super::Session;
use crate::config::{
    DEFAULT_ADMIN_DIRECTORY, DEFAULT_LANGUAGE, InstallOptions, LANGUAGES, is_valid_admin_password,
    is_valid_email, language_label, sanitize_admin_dir,
};
use crate::protocol::{QuestionOption, QuestionState, SECRET_MASK};
use crate::steps::QuestStep;

pub const LANGUAGE_QUESTION: &str = "language";

const STEP: &str = QuestStep::Database.id();
const DEFAULT_ADMIN_USERNAME: &str = "admin";

/// Answers collected for the admin account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminAnswers {
    pub username: String,
    pub email: String,
    pub password: String,
    pub directory: String,
    pub language: String,
}

pub fn language_question() -> QuestionState {
    let options = LANGUAGES
        .iter()
        .map(|(id, label)| QuestionOption::enabled(*id, *label))
        .collect::<Vec<_>>();
    let selected = LANGUAGES
        .iter()
        .position(|(id, _)| *id == DEFAULT_LANGUAGE)
        .unwrap_or(0);
    QuestionState::select(
        LANGUAGE_QUESTION,
        "Which language do you want to use for installation?",
        options,
    )
    .with_selected(selected)
}

async fn username(session: &mut Session, preset: &str) -> Option<String> {
    let mut name = preset.trim().to_string();
    if name.is_empty() {
        name = session
            .ask_input(
                STEP,
                QuestionState::input("admin_username", "Enter your Admin username:", DEFAULT_ADMIN_USERNAME),
            )
            .await?
            .trim()
            .to_string();
    }
    if name.is_empty() {
        name = DEFAULT_ADMIN_USERNAME.to_string();
    }
    session
        .sink()
        .log(STEP, format!("Your Admin username: {name}."))
        .await;
    Some(name)
}

async fn email(session: &mut Session, preset: &str) -> Option<String> {
    let preset = preset.trim();
    if !preset.is_empty() {
        if is_valid_email(preset) {
            return Some(preset.to_string());
        }
        session
            .sink()
            .warn(STEP, "Provided --admin-email is invalid; please enter it again.")
            .await;
    }
    loop {
        let answer = session
            .ask_input(STEP, QuestionState::input("admin_email", "Enter your Admin email:", ""))
            .await?;
        let answer = answer.trim();
        if answer.is_empty() {
            session
                .sink()
                .warn(STEP, "Email address cannot be empty. Please try again.")
                .await;
            continue;
        }
        if !is_valid_email(answer) {
            session
                .sink()
                .warn(STEP, "Please enter a valid email address. Try again.")
                .await;
            continue;
        }
        return Some(answer.to_string());
    }
}

async fn password(session: &mut Session, preset: &str) -> Option<String> {
    let preset = preset.trim();
    if !preset.is_empty() {
        if is_valid_admin_password(preset) {
            return Some(preset.to_string());
        }
        session
            .sink()
            .warn(STEP, "Provided --admin-password is too short; please enter it again.")
            .await;
    }
    loop {
        let question = QuestionState::input("admin_password", "Enter your Admin password:", "").secret();
        let answer = session.ask_input(STEP, question).await?;
        let answer = answer.trim();
        if answer.is_empty() {
            session
                .sink()
                .warn(STEP, "Password cannot be empty. Please try again.")
                .await;
            continue;
        }
        if !is_valid_admin_password(answer) {
            session
                .sink()
                .warn(STEP, "Password must be at least 6 characters long. Try again.")
                .await;
            continue;
        }
        return Some(answer.to_string());
    }
}

/// Collect the admin account and installation language.
///
/// Pre-supplied options skip their question; invalid ones are asked again.
pub async fn gather(session: &mut Session, opts: &InstallOptions) -> Option<AdminAnswers> {
    let username = username(session, &opts.admin_username).await?;

    let email = email(session, &opts.admin_email).await?;
    session
        .sink()
        .log(STEP, format!("Your Admin email: {email}."))
        .await;

    let password = password(session, &opts.admin_password).await?;
    session
        .sink()
        .log(STEP, format!("Your Admin password: {SECRET_MASK}."))
        .await;

    let mut directory = opts.admin_directory.trim().to_string();
    if directory.is_empty() {
        directory = session
            .ask_input(
                STEP,
                QuestionState::input("admin_directory", "Enter your Admin directory:", DEFAULT_ADMIN_DIRECTORY),
            )
            .await?;
    }
    let directory = sanitize_admin_dir(&directory);
    session
        .sink()
        .log(STEP, format!("Your Admin directory: {directory}."))
        .await;

    let mut language = opts.language.trim().to_lowercase();
    if language.is_empty() {
        language = session.ask_select(STEP, language_question()).await?;
    }
    session
        .sink()
        .log(STEP, format!("Selected language: {}.", language_label(&language)))
        .await;

    Some(AdminAnswers {
        username,
        email,
        password,
        directory,
        language,
    })
}
