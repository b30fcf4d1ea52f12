//! Extras catalog and selection model
//!
//! Extras are optional add-on packages installed after the core platform.
//! This module holds the data exchanged with front ends and the pure helpers
//! around it: catalog parsing, selection normalization, default versions and
//! failure detection in installer output. The sub-workflow itself lives in
//! `engine::extras`.

use crate::error::{InstallerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use strum::Display;

/// Number of output lines kept per installed package
pub const DETAIL_TAIL_LINES: usize = 24;

/// Output line that reports a no-op install and must not count as failure
const NOOP_OPERATIONS: &str = "package operations: 0 installs, 0 updates, 0 removals";

/// Substrings (lowercase) that mark a failed extras install
const FAILURE_HINTS: &[&str] = &[
    "the limit that is provided for free use of github has been exceeded",
    "github api rate limit exceeded",
    "api rate limit exceeded",
    "rate limit exceeded",
    "authentication required",
    "requires authentication",
    "could not open input file",
    "no composer.json",
    "your requirements could not be resolved",
    "could not resolve host",
    "failed to download",
    "failed to open stream",
];

/// One installable package from the catalog
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtrasPackage {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default_install_mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_branch: String,
}

impl ExtrasPackage {
    /// Version to install when the operator did not pick one.
    ///
    /// `latest-release` favors the released version, `default-branch` favors
    /// the branch; otherwise version, then branch, then the first listed
    /// version.
    pub fn default_version(&self) -> String {
        let mode = self.default_install_mode.trim().to_ascii_lowercase();
        let version = self.version.trim();
        let branch = self.default_branch.trim();
        if mode == "latest-release" && !version.is_empty() {
            return version.to_string();
        }
        if mode == "default-branch" && !branch.is_empty() {
            return branch.to_string();
        }
        if !version.is_empty() {
            return version.to_string();
        }
        if !branch.is_empty() {
            return branch.to_string();
        }
        self.versions
            .iter()
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
            .unwrap_or_default()
            .to_string()
    }

    fn sanitized(mut self) -> Option<Self> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return None;
        }
        self.version = self.version.trim().to_string();
        self.description = self.description.trim().to_string();
        self.default_install_mode = self.default_install_mode.trim().to_string();
        self.default_branch = self.default_branch.trim().to_string();

        let mut seen = HashSet::new();
        self.versions = self
            .versions
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty() && seen.insert(v.clone()))
            .collect();
        Some(self)
    }
}

/// A package the operator chose, with an optional version or branch
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtrasSelection {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl ExtrasSelection {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Parse `name` or `name@version`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (name, version) = match value.split_once('@') {
            Some((name, version)) => (name.trim(), version.trim()),
            None => (value, ""),
        };
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, version))
    }

    /// Parse a list of `name@version` strings, skipping empty entries.
    pub fn parse_list<S: AsRef<str>>(values: &[S]) -> Vec<Self> {
        values
            .iter()
            .filter_map(|v| Self::parse(v.as_ref()))
            .collect()
    }
}

impl fmt::Display for ExtrasSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name.trim();
        let version = self.version.trim();
        if version.is_empty() {
            f.write_str(name)
        } else {
            write!(f, "{name}@{version}")
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExtrasStage {
    #[default]
    Select,
    Progress,
    Summary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExtrasItemStatus {
    #[default]
    Pending,
    Running,
    Success,
    Error,
}

impl ExtrasItemStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Success | Self::Error => 2,
        }
    }
}

/// Progress of one item in the extras batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtrasItemResult {
    pub name: String,
    pub status: ExtrasItemStatus,
    pub message: String,
}

impl ExtrasItemResult {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Move forward to `status`; regressions are ignored.
    pub fn advance(&mut self, status: ExtrasItemStatus) -> bool {
        if status.rank() <= self.status.rank() {
            return false;
        }
        self.status = status;
        true
    }
}

/// Captured output tail of one installed item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtrasItemDetail {
    pub name: String,
    pub output: String,
}

/// Snapshot of the extras sub-workflow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtrasState {
    pub active: bool,
    pub stage: ExtrasStage,
    pub packages: Vec<ExtrasPackage>,
    pub selections: Vec<ExtrasSelection>,
    pub results: Vec<ExtrasItemResult>,
    pub current: String,
    pub current_index: usize,
    pub total: usize,
    pub details: Vec<ExtrasItemDetail>,
}

impl ExtrasState {
    pub fn inactive() -> Self {
        Self::default()
    }

    /// Summary shown when the operator declines extras
    pub fn skipped_summary() -> Self {
        Self {
            active: true,
            stage: ExtrasStage::Summary,
            results: vec![ExtrasItemResult {
                name: "Extras skipped".to_string(),
                status: ExtrasItemStatus::Success,
                message: String::new(),
            }],
            ..Self::default()
        }
    }

    pub fn has_errors(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.status == ExtrasItemStatus::Error)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogEnvelope {
    ok: Option<bool>,
    #[serde(default)]
    error: String,
    #[serde(default)]
    packages: Vec<ExtrasPackage>,
}

/// Parse the catalog printed by `artisan extras --list --json`.
///
/// Accepts either `{ok, error, packages}` or a bare array of packages.
pub fn parse_catalog(raw: &[u8]) -> Result<Vec<ExtrasPackage>> {
    let raw = raw.trim_ascii();
    if raw.is_empty() {
        return Err(InstallerError::probe("empty extras list JSON"));
    }

    if let Ok(envelope) = serde_json::from_slice::<CatalogEnvelope>(raw) {
        if envelope.ok == Some(false) {
            let error = envelope.error.trim();
            return Err(InstallerError::probe(if error.is_empty() {
                "extras list returned ok=false"
            } else {
                error
            }));
        }
        if !envelope.packages.is_empty() {
            return Ok(sanitize_catalog(envelope.packages));
        }
    }

    match serde_json::from_slice::<Vec<ExtrasPackage>>(raw) {
        Ok(flat) if !flat.is_empty() => Ok(sanitize_catalog(flat)),
        _ => Err(InstallerError::probe("unable to parse extras list JSON")),
    }
}

fn sanitize_catalog(packages: Vec<ExtrasPackage>) -> Vec<ExtrasPackage> {
    packages
        .into_iter()
        .filter_map(ExtrasPackage::sanitized)
        .collect()
}

/// Restrict `selections` to catalog packages, fill missing versions with the
/// package default, and keep the first selection per name.
pub fn normalize_selections(
    catalog: &[ExtrasPackage],
    selections: &[ExtrasSelection],
) -> Vec<ExtrasSelection> {
    let by_name: HashMap<&str, &ExtrasPackage> = catalog
        .iter()
        .filter(|p| !p.name.is_empty())
        .map(|p| (p.name.as_str(), p))
        .collect();

    let mut out: Vec<ExtrasSelection> = Vec::with_capacity(selections.len());
    let mut seen: HashMap<String, usize> = HashMap::new();

    for selection in selections {
        let name = selection.name.trim();
        let Some(package) = by_name.get(name) else {
            continue;
        };
        let mut version = selection.version.trim().to_string();
        if version.is_empty() {
            version = package.default_version();
        }
        if let Some(&idx) = seen.get(name) {
            if out[idx].version.is_empty() && !version.is_empty() {
                out[idx].version = version;
            }
            continue;
        }
        seen.insert(name.to_string(), out.len());
        out.push(ExtrasSelection::new(name, version));
    }
    out
}

/// Scan installer output from the last line backwards for a failure
/// signature; returns the offending line.
pub fn detect_failure(output: &str) -> Option<String> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find(|line| {
            let lower = line.to_lowercase();
            if lower.contains(NOOP_OPERATIONS) {
                return false;
            }
            FAILURE_HINTS.iter().any(|hint| lower.contains(hint))
                || lower.starts_with("fatal:")
                || lower.starts_with("error:")
                || lower.contains("exception")
        })
        .map(str::to_string)
}

pub fn last_non_empty_line(output: &str) -> Option<&str> {
    output.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

/// Last `max_lines` lines of `output`, trimmed.
pub fn tail_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..]
        .iter()
        .map(|l| l.trim_end_matches('\r'))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<ExtrasPackage> {
        vec![
            ExtrasPackage {
                name: "sSeo".to_string(),
                version: "1.2.4".to_string(),
                versions: vec!["1.2.4".to_string(), "1.2.3".to_string()],
                default_install_mode: "latest-release".to_string(),
                ..ExtrasPackage::default()
            },
            ExtrasPackage {
                name: "sUsers".to_string(),
                version: "2.0.0".to_string(),
                default_install_mode: "default-branch".to_string(),
                default_branch: "main".to_string(),
                ..ExtrasPackage::default()
            },
        ]
    }

    #[test]
    fn test_parse_catalog_wrapped() {
        let raw = br#"{"ok":true,"type":"extras","packages":[{"name":"sSeo","version":"1.2.3","versions":["1.2.3"," 1.2.2 ","1.2.3"],"description":"SEO tools","defaultInstallMode":"latest-release"}]}"#;
        let packages = parse_catalog(raw).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].name, "sSeo");
        assert_eq!(packages[0].version, "1.2.3");
        assert_eq!(packages[0].versions, vec!["1.2.3", "1.2.2"]);
    }

    #[test]
    fn test_parse_catalog_bare_array() {
        let raw = br#"[{"name":"sUsers","version":"","description":" User tools ","defaultInstallMode":"default-branch"},{"name":"  "}]"#;
        let packages = parse_catalog(raw).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].description, "User tools");
        assert_eq!(packages[0].version, "");
    }

    #[test]
    fn test_parse_catalog_error_payload() {
        let err = parse_catalog(br#"{"ok":false,"error":"rate limit"}"#).unwrap_err();
        assert!(err.to_string().contains("rate limit"));
        assert!(parse_catalog(b"   ").is_err());
        assert!(parse_catalog(b"not json").is_err());
    }

    #[test]
    fn test_default_version_by_mode() {
        let packages = catalog();
        assert_eq!(packages[0].default_version(), "1.2.4");
        assert_eq!(packages[1].default_version(), "main");

        let only_versions = ExtrasPackage {
            name: "x".to_string(),
            versions: vec![" ".to_string(), "0.9.0".to_string()],
            ..ExtrasPackage::default()
        };
        assert_eq!(only_versions.default_version(), "0.9.0");
        assert_eq!(ExtrasPackage::default().default_version(), "");
    }

    #[test]
    fn test_normalize_fills_default_and_keeps_explicit() {
        let selections = ExtrasSelection::parse_list(&["sSeo@1.2.3", "sUsers"]);
        let normalized = normalize_selections(&catalog(), &selections);
        assert_eq!(
            normalized,
            vec![
                ExtrasSelection::new("sSeo", "1.2.3"),
                ExtrasSelection::new("sUsers", "main"),
            ]
        );
    }

    #[test]
    fn test_normalize_drops_unknown_and_duplicates() {
        let selections = ExtrasSelection::parse_list(&["ghost", "sSeo@1.2.3", "sSeo@9.9.9", "@x", ""]);
        let normalized = normalize_selections(&catalog(), &selections);
        assert_eq!(normalized, vec![ExtrasSelection::new("sSeo", "1.2.3")]);
    }

    #[test]
    fn test_selection_display() {
        assert_eq!(ExtrasSelection::new("sSeo", "").to_string(), "sSeo");
        assert_eq!(ExtrasSelection::new("sSeo", "1.0").to_string(), "sSeo@1.0");
    }

    #[test]
    fn test_detect_failure_signatures() {
        let out = "Installing sSeo\nYour requirements could not be resolved to an installable set\n\n";
        assert_eq!(
            detect_failure(out).as_deref(),
            Some("Your requirements could not be resolved to an installable set")
        );
        assert!(detect_failure("fatal: repository not found").is_some());
        assert!(detect_failure("RuntimeException thrown").is_some());
        assert!(detect_failure("Package operations: 0 installs, 0 updates, 0 removals").is_none());
        assert!(detect_failure("Package installed successfully").is_none());
    }

    #[test]
    fn test_tail_and_last_line() {
        let out = (1..=30).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let tail = tail_output(&out, DETAIL_TAIL_LINES);
        assert_eq!(tail.lines().count(), 24);
        assert!(tail.starts_with("line 7"));
        assert_eq!(last_non_empty_line("a\nb\n\n  "), Some("b"));
        assert_eq!(last_non_empty_line(""), None);
    }

    #[test]
    fn test_item_result_moves_forward_only() {
        let mut result = ExtrasItemResult::pending("sSeo");
        assert!(result.advance(ExtrasItemStatus::Running));
        assert!(result.advance(ExtrasItemStatus::Error));
        assert!(!result.advance(ExtrasItemStatus::Success));
        assert!(!result.advance(ExtrasItemStatus::Pending));
        assert_eq!(result.status, ExtrasItemStatus::Error);
    }
}
