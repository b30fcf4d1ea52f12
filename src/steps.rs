//! Quest track and step lifecycle
//!
//! The quest track is the ordered list of high-level steps shown to the
//! operator. Each step has an observable status that only ever moves forward:
//!
//! ```text
//! Pending
//!     ↓
//! Active
//!     ↓
//! Done | Warn | Error   (terminal)
//! ```
//!
//! A repeated `Active` is a no-op and a terminal status never changes again.

use serde::Serialize;
use std::fmt;
use strum::{Display, EnumIter, IntoEnumIterator};

/// Step id used while looking up the highest stable release
pub const FETCH_RELEASE_STEP: &str = "fetch_release_version";
/// Step id used while probing the system status
pub const SYSTEM_STATUS_STEP: &str = "check_system_status";
/// Step id used while checking for a newer installer
pub const SELF_UPDATE_STEP: &str = "check_installer_update";
/// Step id used for working directory failures
pub const PREFLIGHT_STEP: &str = "preflight";

/// Steps of the quest track, in workflow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum QuestStep {
    Php,
    Database,
    Download,
    Install,
    Presets,
    Dependencies,
    Finalize,
    Extras,
}

impl QuestStep {
    /// Number of steps on the quest track
    pub const TOTAL: usize = 8;

    /// Stable identifier used in events
    pub const fn id(self) -> &'static str {
        match self {
            Self::Php => "php",
            Self::Database => "database",
            Self::Download => "download",
            Self::Install => "install",
            Self::Presets => "presets",
            Self::Dependencies => "dependencies",
            Self::Finalize => "finalize",
            Self::Extras => "extras",
        }
    }

    /// Operator-facing label
    pub const fn label(self) -> &'static str {
        match self {
            Self::Php => "Step 1: Validate PHP version",
            Self::Database => "Step 2: Check database connection",
            Self::Download => "Step 3: Download Evolution CMS",
            Self::Install => "Step 4: Install Evolution CMS",
            Self::Presets => "Step 5: Install presets",
            Self::Dependencies => "Step 6: Install dependencies",
            Self::Finalize => "Step 7: Finalize installation",
            Self::Extras => "Step 8: Install Extras (optional)",
        }
    }

    /// 1-based position on the quest track
    pub const fn index(self) -> usize {
        self as usize + 1
    }

    /// Look a step up by its event id
    pub fn from_id(id: &str) -> Option<Self> {
        Self::iter().find(|step| step.id() == id)
    }

    /// The full track as pending step states
    pub fn declared() -> Vec<StepState> {
        Self::iter()
            .map(|step| StepState::new(step.id(), step.label()))
            .collect()
    }
}

/// Observable status of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Done,
    Warn,
    Error,
}

impl StepStatus {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Warn | Self::Error)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Active => 1,
            Self::Done | Self::Warn | Self::Error => 2,
        }
    }
}

/// One entry of the quest track
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepState {
    pub id: String,
    pub label: String,
    pub status: StepStatus,
}

impl StepState {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            status: StepStatus::Pending,
        }
    }

    /// Move to `next` if it is strictly further along.
    ///
    /// Returns whether the status changed.
    pub fn advance(&mut self, next: StepStatus) -> bool {
        if next.rank() <= self.status.rank() {
            return false;
        }
        self.status = next;
        true
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.label, self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quest_track_order() {
        let ids: Vec<&str> = QuestStep::iter().map(QuestStep::id).collect();
        assert_eq!(
            ids,
            vec![
                "php",
                "database",
                "download",
                "install",
                "presets",
                "dependencies",
                "finalize",
                "extras"
            ]
        );
        assert_eq!(QuestStep::Download.index(), 3);
        assert_eq!(QuestStep::Extras.index(), QuestStep::TOTAL);
    }

    #[test]
    fn test_display_matches_id() {
        for step in QuestStep::iter() {
            assert_eq!(step.to_string(), step.id());
            assert_eq!(QuestStep::from_id(step.id()), Some(step));
        }
        assert_eq!(QuestStep::from_id("preflight"), None);
    }

    #[test]
    fn test_declared_steps_are_pending() {
        let steps = QuestStep::declared();
        assert_eq!(steps.len(), QuestStep::TOTAL);
        assert!(steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut step = StepState::new("install", "Step 4: Install Evolution CMS");
        assert!(step.advance(StepStatus::Active));
        assert!(!step.advance(StepStatus::Active));
        assert!(!step.advance(StepStatus::Pending));
        assert!(step.advance(StepStatus::Done));
        assert!(!step.advance(StepStatus::Error));
        assert!(!step.advance(StepStatus::Active));
        assert_eq!(step.status, StepStatus::Done);
    }

    #[test]
    fn test_pending_can_finish_directly() {
        let mut step = StepState::new("presets", "Step 5: Install presets");
        assert!(step.advance(StepStatus::Warn));
        assert!(step.status.is_terminal());
    }
}
