//! The installation workflow
//!
//! ```text
//! detect release → system status → self-update offer → preflight
//!     → php → database (+ admin questions) → download/install → extras
//! ```
//!
//! Release detection, the status probe and the self-update check are best
//! effort. Every other phase halts the workflow on failure after emitting an
//! error event.

use super::extras::{self, ExtrasRun};
use super::{Engine, Session, admin, database, preflight, runtime, self_update};
use crate::config::InstallOptions;
use crate::protocol::{ActionSource, EventSink, LogMessage, Severity};
use crate::release::{DetectOptions, ReleaseSource, VersionCache, detect_highest_stable};
use crate::status::SystemStatus;
use crate::steps::{FETCH_RELEASE_STEP, QuestStep, SYSTEM_STATUS_STEP};
use crate::supervisor::{INSTALL_SOURCE, abandon_install, supervise_install};
use crate::toolchain::{DbParams, InstallPlan, Toolchain};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CMS_OWNER: &str = "evolution-cms";
pub const CMS_REPO: &str = "evolution";

/// Message of the workflow-level install failure
pub const INSTALL_FAILED: &str = "Installation failed.";

pub struct InstallEngine {
    opts: InstallOptions,
    toolchain: Arc<dyn Toolchain>,
    releases: Arc<dyn ReleaseSource>,
    cache: Option<VersionCache>,
}

impl InstallEngine {
    pub fn new(
        opts: InstallOptions,
        toolchain: Arc<dyn Toolchain>,
        releases: Arc<dyn ReleaseSource>,
        cache: Option<VersionCache>,
    ) -> Self {
        Self {
            opts,
            toolchain,
            releases,
            cache,
        }
    }

    async fn detect_release(&self, session: &Session) -> Option<()> {
        let sink = session.sink();
        sink.step_start(FETCH_RELEASE_STEP, "Detect latest stable version (by semver)", 0, 0)
            .await;
        sink.log(FETCH_RELEASE_STEP, "Fetching releases…").await;
        sink.progress(FETCH_RELEASE_STEP, 0, 100).await;

        let detected = session
            .or_cancelled(detect_highest_stable(
                self.releases.as_ref(),
                self.cache.as_ref(),
                CMS_OWNER,
                CMS_REPO,
                &DetectOptions::default(),
                |page| {
                    let sink = sink.clone();
                    async move {
                        if page == 1 {
                            sink.progress(FETCH_RELEASE_STEP, 50, 100).await;
                        }
                    }
                },
            ))
            .await?;

        match detected {
            Ok(info) => {
                debug!(tag = %info.display_tag(), source = ?info.source, "release detected");
                sink.log(
                    FETCH_RELEASE_STEP,
                    format!("Highest stable release: {}", info.display_tag()),
                )
                .await;
                sink.progress(FETCH_RELEASE_STEP, 100, 100).await;
                sink.release_done(FETCH_RELEASE_STEP, info).await;
            }
            Err(e) => {
                warn!(error = %e, "release detection failed");
                sink.warn_with(
                    FETCH_RELEASE_STEP,
                    LogMessage::new("Unable to fetch release info; continuing…")
                        .field("error", e.to_string()),
                )
                .await;
                sink.step_done(FETCH_RELEASE_STEP, false, Severity::Warn).await;
            }
        }
        Some(())
    }

    /// `None` only when the run was cancelled during the probe.
    async fn check_system_status(&self, session: &Session) -> Option<SystemStatus> {
        let sink = session.sink();
        sink.step_start(SYSTEM_STATUS_STEP, "Check system status", 0, 0)
            .await;
        sink.log(SYSTEM_STATUS_STEP, "Checking system status…").await;

        let probed = session.or_cancelled(self.toolchain.system_status()).await?;
        let status = match probed {
            Ok(status) => {
                let status = status.normalize();
                sink.system_status(SYSTEM_STATUS_STEP, status.clone(), Severity::Info)
                    .await;
                sink.step_done(SYSTEM_STATUS_STEP, true, Severity::Info).await;
                status
            }
            Err(e) => {
                warn!(error = %e, "system status probe failed");
                sink.warn_with(
                    SYSTEM_STATUS_STEP,
                    LogMessage::new("Unable to check system status; continuing…")
                        .field("error", e.to_string()),
                )
                .await;
                let empty = SystemStatus::default().normalize();
                sink.system_status(SYSTEM_STATUS_STEP, empty.clone(), Severity::Warn)
                    .await;
                sink.step_done(SYSTEM_STATUS_STEP, false, Severity::Warn).await;
                empty
            }
        };
        Some(status)
    }

    /// Start the download step and supervise the install command.
    async fn download(&self, session: &Session, plan: &InstallPlan) -> Option<()> {
        let sink = session.sink();
        sink.quest_start(QuestStep::Download).await;

        let result = match self.toolchain.install_command(plan) {
            Ok(cmd) => supervise_install(cmd, sink, session.cancel_token()).await,
            Err(e) => {
                abandon_install(sink).await;
                Err(e)
            }
        };
        match result {
            Ok(()) => Some(()),
            Err(e) => {
                info!(error = %e, "install command did not complete");
                sink.error_with(
                    QuestStep::Download.id(),
                    LogMessage::new(INSTALL_FAILED).field("error", e.to_string()),
                )
                .await;
                None
            }
        }
    }

    fn plan(&self, workdir: &Path, db: DbParams, admin: admin::AdminAnswers) -> InstallPlan {
        InstallPlan {
            workdir: workdir.to_path_buf(),
            db,
            admin_username: admin.username,
            admin_email: admin.email,
            admin_password: admin.password,
            admin_directory: admin.directory,
            language: admin.language,
            branch: self.opts.branch.trim().to_string(),
            github_token: self.opts.github_token().map(str::to_string),
            force: self.opts.force,
            composer_update: self.opts.composer_update,
            composer_clear_cache: self.opts.composer_clear_cache,
        }
    }

    /// The workflow. `None` means it halted; the terminal events are out.
    async fn drive(&self, session: &mut Session) -> Option<()> {
        session.sink().steps(QuestStep::declared()).await;

        self.detect_release(session).await?;
        let status = self.check_system_status(session).await?;

        let exec_requested = self_update::offer(
            session,
            &self.opts.self_version,
            self.toolchain.as_ref(),
            self.releases.as_ref(),
            self.cache.as_ref(),
        )
        .await;
        if exec_requested || session.is_cancelled() {
            return None;
        }

        let workdir = preflight::prepare(session, &self.opts.dir, self.opts.force).await?;
        runtime::validate(session, self.toolchain.as_ref()).await?;

        let db = database::provision(session, self.toolchain.as_ref(), &self.opts, &status, &workdir)
            .await?;
        let admin = admin::gather(session, &self.opts).await?;
        session
            .sink()
            .step_done(QuestStep::Database.id(), true, Severity::Info)
            .await;

        let plan = self.plan(&workdir, db, admin);
        self.download(session, &plan).await?;

        extras::run(
            session,
            self.toolchain.as_ref(),
            &workdir,
            ExtrasRun {
                preselected: self.opts.extras.clone(),
                github_token: self.opts.github_token().map(str::to_string),
                fail_fast: self.opts.extras_fail_fast,
            },
        )
        .await;
        Some(())
    }
}

#[async_trait]
impl Engine for InstallEngine {
    async fn run(self: Box<Self>, sink: EventSink, actions: ActionSource, cancel: CancellationToken) {
        let mut session = Session::new(sink.with_source(INSTALL_SOURCE), actions, cancel);
        match self.drive(&mut session).await {
            Some(()) => info!("installation workflow finished"),
            None if session.is_cancelled() => info!("installation workflow cancelled"),
            None => info!("installation workflow halted"),
        }
    }
}
