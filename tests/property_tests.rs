//! Property-Based Tests for the Evolution CMS installer
//!
//! These tests verify:
//! - Report sanitizing never leaks credentials or control characters
//! - The folded view never moves a step backwards
//! - Extras selection parsing and catalog normalization
//! - System status normalization

use std::collections::HashSet;

use proptest::prelude::*;

use evo_installer::extras::{ExtrasPackage, ExtrasSelection, normalize_selections};
use evo_installer::protocol::{
    Event, EventKind, LogMessage, Payload, Severity, StepOutcome, StepStart,
};
use evo_installer::report::sanitize_message;
use evo_installer::status::{StatusItem, StatusLevel, SystemStatus};
use evo_installer::steps::{QuestStep, StepStatus};
use evo_installer::view::InstallView;

// =============================================================================
// Report Sanitizing
// =============================================================================

/// Secrets start with an uppercase marker the surrounding text never contains.
fn secret_strategy() -> impl Strategy<Value = String> {
    "S3[A-Za-z0-9]{8,16}"
}

fn filler_strategy() -> impl Strategy<Value = String> {
    "[a-z ]{0,24}"
}

proptest! {
    /// Credentials passed as flags never reach the report
    #[test]
    fn flag_secrets_are_redacted(
        secret in secret_strategy(),
        before in filler_strategy(),
        after in filler_strategy(),
        flag in prop_oneof![
            Just("--db-password"),
            Just("--admin-password"),
            Just("--db-user"),
            Just("--admin-username"),
        ],
    ) {
        let line = format!("{before} {flag}={secret} {after}");
        let clean = sanitize_message(&line);
        prop_assert!(!clean.contains(&secret), "leaked in {clean:?}");
    }

    /// `password: value` style pairs are redacted
    #[test]
    fn key_value_secrets_are_redacted(
        secret in secret_strategy(),
        before in filler_strategy(),
        key in prop_oneof![Just("password"), Just("Password"), Just("login"), Just("username")],
        sep in prop_oneof![Just(": "), Just("="), Just(" = ")],
    ) {
        let line = format!("{before} {key}{sep}{secret}");
        let clean = sanitize_message(&line);
        prop_assert!(!clean.contains(&secret), "leaked in {clean:?}");
    }

    /// Output is always a single line without control characters
    #[test]
    fn sanitized_output_has_no_control_chars(raw in any::<String>()) {
        let clean = sanitize_message(&raw);
        prop_assert!(clean.chars().all(|c| c as u32 >= 32 && c as u32 != 127));
    }
}

// =============================================================================
// View Step Status
// =============================================================================

#[derive(Debug, Clone)]
enum StepEvent {
    Start(QuestStep),
    Done(QuestStep, bool),
    Error(QuestStep),
}

fn quest_step_strategy() -> impl Strategy<Value = QuestStep> {
    (0..QuestStep::TOTAL).prop_map(|i| {
        QuestStep::from_id(&QuestStep::declared()[i].id).unwrap_or(QuestStep::Php)
    })
}

fn step_event_strategy() -> impl Strategy<Value = StepEvent> {
    prop_oneof![
        quest_step_strategy().prop_map(StepEvent::Start),
        (quest_step_strategy(), any::<bool>()).prop_map(|(s, ok)| StepEvent::Done(s, ok)),
        quest_step_strategy().prop_map(StepEvent::Error),
    ]
}

fn to_event(step_event: &StepEvent) -> Event {
    match step_event {
        StepEvent::Start(step) => Event::new(
            EventKind::StepStart,
            step.id(),
            "install",
            Severity::Info,
            Payload::StepStart(StepStart {
                label: step.label().to_string(),
                index: step.index(),
                total: QuestStep::TOTAL,
            }),
        ),
        StepEvent::Done(step, ok) => Event::new(
            EventKind::StepDone,
            step.id(),
            "install",
            if *ok { Severity::Info } else { Severity::Error },
            Payload::StepDone(StepOutcome {
                ok: *ok,
                release: None,
            }),
        ),
        StepEvent::Error(step) => Event::new(
            EventKind::Error,
            step.id(),
            "install",
            Severity::Error,
            Payload::Log(LogMessage::new("boom")),
        ),
    }
}

fn rank(status: StepStatus) -> u8 {
    match status {
        StepStatus::Pending => 0,
        StepStatus::Active => 1,
        _ => 2,
    }
}

proptest! {
    /// No event sequence moves a step back, and terminal statuses stick
    #[test]
    fn view_step_status_is_monotonic(events in prop::collection::vec(step_event_strategy(), 0..40)) {
        let mut view = InstallView::new();
        view.apply(&Event::new(
            EventKind::Steps,
            "",
            "install",
            Severity::Info,
            Payload::Steps(QuestStep::declared()),
        ));

        for step_event in &events {
            let before: Vec<StepStatus> = view.steps.iter().map(|s| s.status).collect();
            view.apply(&to_event(step_event));
            for (old, new) in before.iter().zip(view.steps.iter().map(|s| s.status)) {
                prop_assert!(rank(new) >= rank(*old));
                if old.is_terminal() {
                    prop_assert_eq!(*old, new);
                }
            }
        }
        prop_assert_eq!(view.steps.len(), QuestStep::TOTAL);
    }
}

// =============================================================================
// Extras Selections
// =============================================================================

fn package_name_strategy() -> impl Strategy<Value = String> {
    "s[A-Z][a-z]{2,8}"
}

fn version_strategy() -> impl Strategy<Value = String> {
    prop_oneof![Just(String::new()), "[0-9]\\.[0-9]\\.[0-9]", Just("main".to_string())]
}

proptest! {
    /// `name@version` text parses back to the same selection
    #[test]
    fn selection_display_parses_back(name in package_name_strategy(), version in version_strategy()) {
        let selection = ExtrasSelection::new(name, version);
        let parsed = ExtrasSelection::parse(&selection.to_string());
        prop_assert_eq!(parsed, Some(selection));
    }

    /// A missing name never parses
    #[test]
    fn selection_without_name_is_rejected(version in "[0-9a-z.]{0,8}", pad in " {0,3}") {
        let raw = format!("{pad}@{version}");
        prop_assert_eq!(ExtrasSelection::parse(&raw), None);
    }

    /// Normalized selections name catalog packages once each, with a version
    #[test]
    fn normalized_selections_come_from_catalog(
        catalog_names in prop::collection::hash_set(package_name_strategy(), 1..6),
        wanted in prop::collection::vec((package_name_strategy(), version_strategy()), 0..10),
    ) {
        let catalog: Vec<ExtrasPackage> = catalog_names
            .iter()
            .map(|name| ExtrasPackage {
                name: name.clone(),
                version: "1.0.0".to_string(),
                ..ExtrasPackage::default()
            })
            .collect();
        let selections: Vec<ExtrasSelection> = wanted
            .iter()
            .map(|(name, version)| ExtrasSelection::new(name.clone(), version.clone()))
            .chain(catalog_names.iter().take(1).map(|name| ExtrasSelection::new(name.clone(), "")))
            .collect();

        let normalized = normalize_selections(&catalog, &selections);
        let mut seen = HashSet::new();
        for selection in &normalized {
            prop_assert!(catalog_names.contains(&selection.name));
            prop_assert!(seen.insert(selection.name.clone()), "duplicate {}", selection.name);
            prop_assert!(!selection.version.is_empty());
        }
        prop_assert!(!normalized.is_empty());
    }
}

// =============================================================================
// System Status
// =============================================================================

fn status_level_strategy() -> impl Strategy<Value = StatusLevel> {
    prop_oneof![Just(StatusLevel::Ok), Just(StatusLevel::Warn), Just(StatusLevel::Error)]
}

fn status_item_strategy() -> impl Strategy<Value = StatusItem> {
    ("[a-z_]{1,10}", status_level_strategy()).prop_map(|(key, level)| StatusItem {
        label: key.clone(),
        key,
        level,
        details: String::new(),
    })
}

proptest! {
    /// Overall level is the worst item level and survives renormalizing
    #[test]
    fn status_overall_is_worst_item(items in prop::collection::vec(status_item_strategy(), 0..8)) {
        let worst = items.iter().map(|i| i.level).max().unwrap_or(StatusLevel::Ok);
        let status = SystemStatus::new(items);
        prop_assert_eq!(status.overall, worst);

        let again = status.clone().normalize();
        prop_assert_eq!(again.overall, status.overall);
        prop_assert_eq!(again.overall_label, status.overall_label);
    }
}
