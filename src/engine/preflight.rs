//! Working directory preparation and the existing-installation guard

use super::Session;
use crate::protocol::LogMessage;
use crate::steps::PREFLIGHT_STEP;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Marker written by a finished installation
const INSTALL_MARKER: &str = "core/.install";
/// Layout of an already populated directory
const LAYOUT_MARKER: &str = "core/ + manager/ + index.php";

/// Working directory for `dir`: trimmed, `.` when empty.
pub fn resolve_workdir(dir: &Path) -> PathBuf {
    let raw = dir.to_string_lossy();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        PathBuf::from(".")
    } else {
        PathBuf::from(trimmed)
    }
}

/// Look for an existing Evolution CMS installation in `dir`.
///
/// Returns the marker that matched.
pub fn detect_existing_install(dir: &Path) -> Option<&'static str> {
    if !dir.is_dir() {
        return None;
    }
    if dir.join("core").join(".install").is_file() {
        return Some(INSTALL_MARKER);
    }
    if dir.join("core").is_dir() && dir.join("manager").is_dir() && dir.join("index.php").is_file() {
        return Some(LAYOUT_MARKER);
    }
    None
}

/// Create the working directory and refuse to install over an existing
/// installation unless `force` is set.
pub async fn prepare(session: &Session, dir: &Path, force: bool) -> Option<PathBuf> {
    let sink = session.sink();
    let workdir = resolve_workdir(dir);
    let shown = workdir.display().to_string();

    if let Err(e) = tokio::fs::create_dir_all(&workdir).await {
        sink.error_with(
            PREFLIGHT_STEP,
            LogMessage::new("Unable to prepare installation directory.")
                .field("error", e.to_string())
                .field("dir", shown),
        )
        .await;
        return None;
    }
    debug!(dir = %workdir.display(), "working directory ready");

    if force {
        return Some(workdir);
    }
    if let Some(marker) = detect_existing_install(&workdir) {
        info!(dir = %workdir.display(), marker, "existing installation found");
        sink.error(
            PREFLIGHT_STEP,
            format!(
                "Existing Evolution CMS installation detected ({marker}) in {shown}. \
                 Re-run with -f/--force to install anyway."
            ),
        )
        .await;
        return None;
    }
    Some(workdir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_dir_has_no_installation() {
        let dir = TempDir::new().unwrap();
        assert_eq!(detect_existing_install(dir.path()), None);
    }

    #[test]
    fn test_install_marker_wins() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("core")).unwrap();
        fs::write(dir.path().join("core/.install"), "").unwrap();
        fs::create_dir_all(dir.path().join("manager")).unwrap();
        fs::write(dir.path().join("index.php"), "<?php").unwrap();
        assert_eq!(detect_existing_install(dir.path()), Some("core/.install"));
    }

    #[test]
    fn test_layout_heuristic() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("core")).unwrap();
        fs::create_dir_all(dir.path().join("manager")).unwrap();
        assert_eq!(detect_existing_install(dir.path()), None);

        fs::write(dir.path().join("index.php"), "<?php").unwrap();
        assert_eq!(
            detect_existing_install(dir.path()),
            Some("core/ + manager/ + index.php")
        );
    }

    #[test]
    fn test_missing_dir_is_not_an_installation() {
        assert_eq!(detect_existing_install(Path::new("/nonexistent/evo-site")), None);
    }

    #[test]
    fn test_resolve_workdir() {
        assert_eq!(resolve_workdir(Path::new("")), PathBuf::from("."));
        assert_eq!(resolve_workdir(Path::new("  site ")), PathBuf::from("site"));
    }
}
