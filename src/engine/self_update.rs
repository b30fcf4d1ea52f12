//! Installer self-update check
//!
//! Compares the running installer with the highest release of the installer
//! repository. When a newer version exists the operator may choose to leave
//! the engine and run the updater instead; that choice ends the run with an
//! exec request.

use super::Session;
use crate::protocol::{LogMessage, QuestionOption, QuestionState};
use crate::release::{
    DetectOptions, GithubRelease, ReleaseInfo, ReleaseOrigin, ReleaseSource, Semver, VersionCache,
    detect_highest_stable,
};
use crate::steps::SELF_UPDATE_STEP;
use crate::toolchain::Toolchain;
use std::time::Duration;
use tracing::debug;

pub const INSTALLER_OWNER: &str = "evolution-cms";
pub const INSTALLER_REPO: &str = "installer";
pub const SELF_UPDATE_QUESTION: &str = "self_update";
pub const UPDATE_OPTION: &str = "update";
pub const SKIP_OPTION: &str = "skip";

/// Command shown to the operator
pub const UPDATE_COMMAND: &str = "evo self-update";

const CACHE_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Parse a running or released version for comparison.
///
/// Development builds (`dev`, `unknown`, empty) never compare.
pub fn parse_version(raw: &str) -> Option<Semver> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("dev") || raw.eq_ignore_ascii_case("unknown") {
        return None;
    }
    Semver::parse_prefix(raw)
}

/// Whether `latest` is strictly newer than `current`.
pub fn is_newer(latest: &str, current: &str) -> bool {
    match (parse_version(latest), parse_version(current)) {
        (Some(latest), Some(current)) => latest > current,
        _ => false,
    }
}

/// Release info from the "latest release" endpoint.
fn from_latest(release: GithubRelease) -> Option<ReleaseInfo> {
    let tag_name = release.tag_name.trim().to_string();
    if tag_name.is_empty() {
        return None;
    }
    let stripped = tag_name
        .strip_prefix('v')
        .or_else(|| tag_name.strip_prefix('V'))
        .unwrap_or(&tag_name);
    let highest = if stripped.is_empty() { tag_name.clone() } else { stripped.to_string() };
    let tag = if tag_name.to_ascii_lowercase().starts_with('v') {
        tag_name.clone()
    } else {
        format!("v{highest}")
    };
    Some(ReleaseInfo {
        repo: format!("{INSTALLER_OWNER}/{INSTALLER_REPO}"),
        highest_version: highest,
        tag,
        name: release.name.unwrap_or_default(),
        url: release.html_url,
        is_prerelease: release.prerelease,
        fetched_at: Some(chrono::Utc::now()),
        source: Some(ReleaseOrigin::GithubApi),
    })
}

async fn latest_installer_release(
    releases: &dyn ReleaseSource,
    cache: Option<&VersionCache>,
) -> crate::error::Result<ReleaseInfo> {
    let options = DetectOptions {
        ttl: CACHE_TTL,
        ..DetectOptions::default()
    };
    let detected =
        detect_highest_stable(releases, cache, INSTALLER_OWNER, INSTALLER_REPO, &options, |_| async {})
            .await;
    let detect_err = match detected {
        Ok(info) if !info.highest_version.is_empty() => return Ok(info),
        Ok(_) => None,
        Err(e) => Some(e),
    };
    debug!(error = ?detect_err, "falling back to the latest release endpoint");

    match releases.fetch_latest(INSTALLER_OWNER, INSTALLER_REPO).await {
        Ok(release) => from_latest(release).ok_or_else(|| {
            detect_err.unwrap_or_else(|| crate::error::InstallerError::probe("latest release has no tag"))
        }),
        Err(e) => Err(e),
    }
}

/// Offer a self-update when a newer installer exists.
///
/// Returns true when the operator accepted and an exec request was emitted;
/// the engine must stop right after.
pub async fn offer(
    session: &mut Session,
    current: &str,
    toolchain: &dyn Toolchain,
    releases: &dyn ReleaseSource,
    cache: Option<&VersionCache>,
) -> bool {
    let current = current.trim();
    if parse_version(current).is_none() {
        debug!(version = current, "skipping self-update check for development build");
        return false;
    }

    let Some(lookup) = session
        .or_cancelled(latest_installer_release(releases, cache))
        .await
    else {
        return false;
    };
    let info = match lookup {
        Ok(info) => info,
        Err(e) => {
            session
                .sink()
                .warn_with(
                    SELF_UPDATE_STEP,
                    LogMessage::new("Unable to check for installer updates.")
                        .field("error", e.to_string()),
                )
                .await;
            return false;
        }
    };
    if !is_newer(&info.highest_version, current) {
        return false;
    }

    let tag = info.display_tag();
    let sink = session.sink();
    sink.log(
        SELF_UPDATE_STEP,
        format!("New installer version available: {tag} (current {current})."),
    )
    .await;
    sink.log(SELF_UPDATE_STEP, format!("Recommended update command: {UPDATE_COMMAND}"))
        .await;

    let updater = toolchain.updater_command();
    let update_label = format!("Update now ({UPDATE_COMMAND})");
    let update_option = match &updater {
        Ok(_) => QuestionOption::enabled(UPDATE_OPTION, update_label),
        Err(e) => QuestionOption::disabled(UPDATE_OPTION, update_label, e.to_string()),
    };
    let question = QuestionState::select(
        SELF_UPDATE_QUESTION,
        "A new installer version is available. Update now?",
        vec![
            update_option,
            QuestionOption::enabled(SKIP_OPTION, "Continue without updating"),
        ],
    )
    .with_selected(1);

    let choice = session.ask_select(SELF_UPDATE_STEP, question).await;
    if choice.as_deref() != Some(UPDATE_OPTION) {
        return false;
    }
    let Ok(command) = updater else {
        return false;
    };

    let sink = session.sink();
    sink.log(SELF_UPDATE_STEP, format!("Exiting installer and running: {UPDATE_COMMAND}"))
        .await;
    sink.exec_request(SELF_UPDATE_STEP, command).await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_versions_never_compare() {
        assert_eq!(parse_version("dev"), None);
        assert_eq!(parse_version("UNKNOWN"), None);
        assert_eq!(parse_version(" "), None);
        assert_eq!(parse_version("v1.4.2"), Some(Semver::new(1, 4, 2)));
        assert!(!is_newer("9.9.9", "dev"));
    }

    #[test]
    fn test_is_newer_compares_numerically() {
        assert!(is_newer("1.10.0", "1.9.9"));
        assert!(is_newer("2.0.0", "V1.99.99"));
        assert!(!is_newer("1.4.2", "1.4.2"));
        assert!(!is_newer("1.4.1", "v1.4.2"));
    }

    #[test]
    fn test_from_latest_synthesizes_tag() {
        let release = GithubRelease {
            tag_name: "1.5.0".to_string(),
            ..GithubRelease::default()
        };
        let info = from_latest(release).unwrap();
        assert_eq!(info.highest_version, "1.5.0");
        assert_eq!(info.tag, "v1.5.0");
        assert_eq!(info.repo, "evolution-cms/installer");

        let release = GithubRelease {
            tag_name: "v1.5.1".to_string(),
            ..GithubRelease::default()
        };
        let info = from_latest(release).unwrap();
        assert_eq!(info.highest_version, "1.5.1");
        assert_eq!(info.tag, "v1.5.1");

        assert!(from_latest(GithubRelease::default()).is_none());
    }
}
