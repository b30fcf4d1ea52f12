//! PHP runtime validation (quest step 1)

use super::Session;
use crate::protocol::{LogMessage, Severity};
use crate::release::Semver;
use crate::steps::QuestStep;
use crate::toolchain::Toolchain;

/// Lowest supported PHP version
pub const MIN_PHP_VERSION: Semver = Semver::new(8, 3, 0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCheck {
    Supported(String),
    Unsupported(String),
    /// The version could not be read or parsed
    Undetectable(String),
}

/// Classify a raw `PHP_VERSION` string.
pub fn classify_version(raw: &str) -> RuntimeCheck {
    let version = raw.trim().to_string();
    match Semver::parse_prefix(&version) {
        Some(v) if v >= MIN_PHP_VERSION => RuntimeCheck::Supported(version),
        Some(_) => RuntimeCheck::Unsupported(version),
        None => RuntimeCheck::Undetectable(format!("unable to parse PHP_VERSION: {version:?}")),
    }
}

/// Run the PHP step. `None` halts the workflow.
pub async fn validate(session: &Session, toolchain: &dyn Toolchain) -> Option<()> {
    let sink = session.sink();
    let step = QuestStep::Php.id();
    sink.quest_start(QuestStep::Php).await;

    let check = match session.or_cancelled(toolchain.runtime_version()).await? {
        Ok(raw) => classify_version(&raw),
        Err(e) => RuntimeCheck::Undetectable(e.to_string()),
    };
    match check {
        RuntimeCheck::Supported(version) => {
            sink.log(step, format!("✔ PHP version {version} is supported."))
                .await;
            sink.step_done(step, true, Severity::Info).await;
            Some(())
        }
        RuntimeCheck::Unsupported(version) => {
            sink.error(
                step,
                format!("PHP version {version} is not supported (requires >= {MIN_PHP_VERSION})."),
            )
            .await;
            sink.step_done(step, false, Severity::Error).await;
            None
        }
        RuntimeCheck::Undetectable(reason) => {
            sink.error_with(
                step,
                LogMessage::new("Unable to detect PHP version.").field("error", reason),
            )
            .await;
            sink.step_done(step, false, Severity::Error).await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_version() {
        assert_eq!(classify_version("8.3.4\n"), RuntimeCheck::Supported("8.3.4".into()));
        assert_eq!(classify_version("8.4.0-dev"), RuntimeCheck::Supported("8.4.0-dev".into()));
        assert_eq!(classify_version("9.0.0"), RuntimeCheck::Supported("9.0.0".into()));
        assert_eq!(classify_version("8.2.27"), RuntimeCheck::Unsupported("8.2.27".into()));
        assert!(matches!(classify_version("garbage"), RuntimeCheck::Undetectable(_)));
    }
}
