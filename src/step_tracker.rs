//! Step tracker for the supervised install subprocess
//!
//! The install command prints plain-text milestones. The tracker turns them
//! into quest-track transitions for download, install, presets,
//! dependencies and finalize, and guarantees every one of those steps ends
//! exactly once.

use crate::steps::QuestStep;
use std::collections::HashSet;

/// Steps driven by the install subprocess, in order
pub const TRACKED_STEPS: [QuestStep; 5] = [
    QuestStep::Download,
    QuestStep::Install,
    QuestStep::Presets,
    QuestStep::Dependencies,
    QuestStep::Finalize,
];

/// A change the engine must emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTransition {
    Start(QuestStep),
    Done { step: QuestStep, ok: bool },
}

#[derive(Debug, Clone, Copy)]
enum Effect {
    Start(QuestStep),
    Done(QuestStep, bool),
}

use Effect::{Done, Start};

/// How a rule is matched against a line
#[derive(Debug, Clone, Copy)]
enum Match {
    /// Case-insensitive substring, checked before anything else
    Failure(&'static str),
    Marker(&'static [&'static str]),
}

/// Ordered rule table; the first matching rule wins.
const RULES: &[(Match, &[Effect])] = &[
    (
        Match::Failure("failed to download evolution cms"),
        &[Done(QuestStep::Download, false)],
    ),
    (Match::Failure("migration failed"), &[Done(QuestStep::Install, false)]),
    (
        Match::Failure("failed to install dependencies"),
        &[Done(QuestStep::Install, false)],
    ),
    (
        Match::Failure("failed to update dependencies"),
        &[Done(QuestStep::Dependencies, false)],
    ),
    (
        Match::Marker(&["Downloading Evolution CMS", "Finding compatible Evolution CMS version"]),
        &[Start(QuestStep::Download)],
    ),
    (
        Match::Marker(&["downloaded and extracted successfully"]),
        &[Done(QuestStep::Download, true), Start(QuestStep::Install)],
    ),
    (
        Match::Marker(&[
            "Setting up database",
            "Running database migrations",
            "Running database seeders",
        ]),
        &[Start(QuestStep::Install)],
    ),
    (
        Match::Marker(&["All seeders completed successfully"]),
        &[Done(QuestStep::Install, true), Done(QuestStep::Presets, true)],
    ),
    (
        Match::Marker(&["Updating dependencies with Composer"]),
        &[
            Done(QuestStep::Install, true),
            Done(QuestStep::Presets, true),
            Start(QuestStep::Dependencies),
        ],
    ),
    (
        Match::Marker(&[
            "Dependencies updated successfully",
            "composer.json not found. Skipping dependency update",
        ]),
        &[Done(QuestStep::Dependencies, true), Start(QuestStep::Finalize)],
    ),
    (
        Match::Marker(&["Finalizing installation"]),
        &[Start(QuestStep::Finalize)],
    ),
    (
        Match::Marker(&["Installation finalized successfully"]),
        &[Done(QuestStep::Finalize, true)],
    ),
];

impl Match {
    fn matches(self, line: &str, lower: &str) -> bool {
        match self {
            Self::Failure(needle) => lower.contains(needle),
            Self::Marker(needles) => needles.iter().any(|n| line.contains(n)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepTracker {
    current: QuestStep,
    started: HashSet<QuestStep>,
    done: HashSet<QuestStep>,
    failed: bool,
}

impl Default for StepTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StepTracker {
    /// New tracker with download as the current, already announced step.
    pub fn new() -> Self {
        Self {
            current: QuestStep::Download,
            started: HashSet::from([QuestStep::Download]),
            done: HashSet::new(),
            failed: false,
        }
    }

    /// Step that subprocess output is attributed to
    pub fn current(&self) -> QuestStep {
        self.current
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn is_done(&self, step: QuestStep) -> bool {
        self.done.contains(&step)
    }

    /// Feed one sanitized output line.
    pub fn on_line(&mut self, line: &str) -> Vec<StepTransition> {
        let lower = line.to_lowercase();
        let Some((_, effects)) = RULES.iter().find(|(m, _)| m.matches(line, &lower)) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for effect in *effects {
            let transition = match *effect {
                Start(step) => self.start(step),
                Done(step, ok) => self.finish(step, ok),
            };
            out.extend(transition);
        }
        out
    }

    /// Close out the track after a successful exit.
    ///
    /// After a failure this behaves like [`fail_remaining`](Self::fail_remaining).
    /// Otherwise every started step that has not ended is marked done.
    /// Presets log nothing, so they close once install is done.
    /// Steps that never started stay open.
    pub fn finish_remaining(&mut self) -> Vec<StepTransition> {
        if self.failed {
            return self.fail_remaining();
        }
        let mut out = Vec::new();
        for step in TRACKED_STEPS {
            let reached = match step {
                QuestStep::Presets => self.done.contains(&QuestStep::Install),
                _ => self.started.contains(&step),
            };
            if reached {
                out.extend(self.finish(step, true));
            }
        }
        out
    }

    /// Mark every tracked step that has not ended as failed.
    pub fn fail_remaining(&mut self) -> Vec<StepTransition> {
        TRACKED_STEPS
            .iter()
            .filter_map(|&step| self.finish(step, false))
            .collect()
    }

    fn start(&mut self, step: QuestStep) -> Option<StepTransition> {
        if self.done.contains(&step) || self.current == step {
            return None;
        }
        self.current = step;
        self.started.insert(step);
        Some(StepTransition::Start(step))
    }

    fn finish(&mut self, step: QuestStep, ok: bool) -> Option<StepTransition> {
        if !self.done.insert(step) {
            return None;
        }
        if !ok {
            self.failed = true;
        }
        Some(StepTransition::Done { step, ok })
    }
}
