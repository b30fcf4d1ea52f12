//! Simulated workflow for front-end development (`--demo`)
//!
//! Walks the quest track with timed progress and no external processes.

use super::Engine;
use crate::protocol::{ActionSource, EventSink, Severity};
use crate::release::{ReleaseInfo, ReleaseOrigin};
use crate::status::{StatusItem, StatusLevel, SystemStatus};
use crate::steps::{FETCH_RELEASE_STEP, QuestStep, SYSTEM_STATUS_STEP};
use async_trait::async_trait;
use std::time::Duration;
use strum::IntoEnumIterator;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const DEMO_SOURCE: &str = "demo";

/// Delay between two progress ticks at speed 1
const TICK: Duration = Duration::from_millis(120);

#[derive(Debug, Clone)]
pub struct DemoOptions {
    /// Speed multiplier; values below 1 count as 1
    pub speed: u32,
    /// 1-based step number that fails instead of running
    pub fail_step: Option<usize>,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            speed: 1,
            fail_step: None,
        }
    }
}

pub struct DemoEngine {
    options: DemoOptions,
}

impl DemoEngine {
    pub fn new(options: DemoOptions) -> Self {
        Self { options }
    }

    fn tick(&self) -> Duration {
        TICK / self.options.speed.max(1)
    }

    /// Progress increments for `step`: 10 to 21 points, cycling.
    fn increments(step: QuestStep) -> impl Iterator<Item = u64> {
        let seed = step.index() as u64;
        (0u64..).map(move |i| 10 + (seed * 7 + i * 5) % 12)
    }

    async fn sleep(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.tick()) => true,
        }
    }

    async fn startup(&self, sink: &EventSink) {
        sink.step_start(FETCH_RELEASE_STEP, "Detect latest stable version (by semver)", 0, 0)
            .await;
        sink.log(FETCH_RELEASE_STEP, "Fetching releases…").await;
        sink.progress(FETCH_RELEASE_STEP, 100, 100).await;
        let release = ReleaseInfo {
            repo: "evolution-cms/evolution".to_string(),
            highest_version: "3.3.0".to_string(),
            tag: "v3.3.0".to_string(),
            name: String::new(),
            url: String::new(),
            is_prerelease: false,
            fetched_at: Some(chrono::Utc::now()),
            source: Some(ReleaseOrigin::Cache),
        };
        sink.log(FETCH_RELEASE_STEP, format!("Highest stable release: {}", release.display_tag()))
            .await;
        sink.release_done(FETCH_RELEASE_STEP, release).await;

        sink.step_start(SYSTEM_STATUS_STEP, "Check system status", 0, 0)
            .await;
        let items = ["php", "pdo", "pdo_mysql", "pdo_sqlite"]
            .iter()
            .map(|key| StatusItem {
                key: (*key).to_string(),
                label: (*key).to_string(),
                level: StatusLevel::Ok,
                details: String::new(),
            })
            .collect();
        sink.system_status(SYSTEM_STATUS_STEP, SystemStatus::new(items), Severity::Info)
            .await;
        sink.step_done(SYSTEM_STATUS_STEP, true, Severity::Info).await;
    }

    /// Returns false when the run stopped early.
    async fn run_step(&self, sink: &EventSink, step: QuestStep, cancel: &CancellationToken) -> bool {
        if self.options.fail_step == Some(step.index()) {
            sink.error(step.id(), format!("Simulated failure on step {}", step.index()))
                .await;
            return false;
        }

        sink.quest_start(step).await;
        sink.log(step.id(), format!("{}…", step.label())).await;

        let mut current = 0u64;
        for increment in Self::increments(step) {
            if current >= 100 {
                break;
            }
            if !self.sleep(cancel).await {
                return false;
            }
            current = (current + increment).min(100);
            sink.progress(step.id(), current, 100).await;
        }

        sink.step_done(step.id(), true, Severity::Info).await;
        true
    }
}

#[async_trait]
impl Engine for DemoEngine {
    async fn run(self: Box<Self>, sink: EventSink, _actions: ActionSource, cancel: CancellationToken) {
        let sink = sink.with_source(DEMO_SOURCE);
        sink.steps(QuestStep::declared()).await;
        self.startup(&sink).await;

        for step in QuestStep::iter() {
            if !self.run_step(&sink, step, &cancel).await {
                info!(step = %step, "demo run stopped");
                return;
            }
        }
        info!("demo run finished");
    }
}
