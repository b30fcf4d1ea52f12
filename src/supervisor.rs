//! Install subprocess supervision
//!
//! Spawns the install command, merges its stdout and stderr into one line
//! queue and turns every line into events: step transitions through the
//! [`StepTracker`], progress through a per-step [`ProgressMapper`] and log
//! lines through the [`OutputFormatter`]. The subprocess is terminated as soon
//! as the tracker sees a failed step.

use crate::error::{InstallerError, Result};
use crate::output::{OutputFormatter, Stream, SubprocessLine};
use crate::process_guard::{RegisteredChild, TERMINATE_GRACE, signal_group_or_process};
use crate::progress::ProgressMapper;
use crate::protocol::{Event, EventSink, Payload, Severity};
use crate::step_tracker::{StepTracker, StepTransition};
use crate::steps::QuestStep;
use nix::sys::signal::Signal;
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the merged stdout/stderr line queue
pub const LINE_QUEUE_CAPACITY: usize = 256;

/// Event sources used while supervising
pub const INSTALL_SOURCE: &str = "install";
pub const SUBPROCESS_SOURCE: &str = "php";

/// Run `cmd` to completion, translating its output into events on `sink`.
///
/// Every tracked step ends exactly once, whatever way the run ends.
pub async fn supervise_install(
    mut cmd: Command,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> Result<()> {
    let install = sink.with_source(INSTALL_SOURCE);
    let php = sink.with_source(SUBPROCESS_SOURCE);
    let mut tracker = StepTracker::new();

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            emit_transitions(&install, tracker.fail_remaining()).await;
            return Err(e.into());
        }
    };
    let registered = child.id().map(RegisteredChild::register);
    info!(pid = ?child.id(), "install command started");

    let (tx, mut rx) = mpsc::channel(LINE_QUEUE_CAPACITY);
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_lines(stdout, Stream::Stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_lines(stderr, Stream::Stderr, tx.clone())));
    }
    drop(tx);

    let stop = cancel.child_token();
    let terminator = registered
        .as_ref()
        .map(|child| spawn_terminator(child.pid(), stop.clone()));

    let mut formatter = OutputFormatter::new();
    let mut mappers: HashMap<QuestStep, ProgressMapper> = HashMap::new();

    while let Some(line) = rx.recv().await {
        let transitions = tracker.on_line(&line.text);
        emit_transitions(&install, transitions).await;
        if tracker.has_failed() && !stop.is_cancelled() {
            warn!("step failed, stopping install command");
            stop.cancel();
        }

        let step = tracker.current();
        if let Some(pct) = mappers.entry(step).or_default().observe(&line.text) {
            php.progress(step.id(), u64::from(pct), 100).await;
        }
        if let Some(formatted) = formatter.format(&line, step.id()) {
            php.emit(Event::new(
                formatted.kind,
                step.id(),
                php.source(),
                formatted.severity,
                Payload::Log(formatted.log),
            ))
            .await;
        }
    }

    for reader in readers {
        if let Err(e) = reader.await {
            debug!(error = %e, "output reader ended abnormally");
        }
    }
    let status = child.wait().await;
    if let Some(terminator) = terminator {
        terminator.abort();
    }
    drop(registered);

    if cancel.is_cancelled() {
        emit_transitions(&install, tracker.fail_remaining()).await;
        return Err(InstallerError::Cancelled);
    }
    let status = match status {
        Ok(status) => status,
        Err(e) => {
            emit_transitions(&install, tracker.fail_remaining()).await;
            return Err(e.into());
        }
    };
    if tracker.has_failed() {
        emit_transitions(&install, tracker.fail_remaining()).await;
        return Err(InstallerError::subprocess(
            "installation aborted due to failed step",
        ));
    }
    if !status.success() {
        emit_transitions(&install, tracker.fail_remaining()).await;
        return Err(InstallerError::subprocess(format!(
            "install command failed: {status}"
        )));
    }

    info!("install command finished");
    emit_transitions(&install, tracker.finish_remaining()).await;
    Ok(())
}

/// Fail every tracked step when the install command could not even be built.
pub async fn abandon_install(sink: &EventSink) {
    let install = sink.with_source(INSTALL_SOURCE);
    emit_transitions(&install, StepTracker::new().fail_remaining()).await;
}

async fn emit_transitions(sink: &EventSink, transitions: Vec<StepTransition>) {
    for transition in transitions {
        match transition {
            StepTransition::Start(step) => {
                sink.quest_start(step).await;
            }
            StepTransition::Done { step, ok } => {
                let severity = if ok { Severity::Info } else { Severity::Error };
                sink.step_done(step.id(), ok, severity).await;
            }
        }
    }
}

/// Forward sanitized, non-empty lines of `reader` into `tx`.
async fn read_lines<R>(reader: R, stream: Stream, tx: mpsc::Sender<SubprocessLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let raw = String::from_utf8_lossy(&buf);
                let Some(line) = SubprocessLine::new(&raw, stream) else {
                    continue;
                };
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, ?stream, "reading subprocess output failed");
                break;
            }
        }
    }
}

/// Terminate the process group once `stop` fires: SIGTERM, then SIGKILL.
fn spawn_terminator(pid: u32, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        stop.cancelled().await;
        debug!(pid, "terminating install command");
        signal_group_or_process(pid, Signal::SIGTERM);
        tokio::time::sleep(TERMINATE_GRACE).await;
        signal_group_or_process(pid, Signal::SIGKILL);
    })
}
