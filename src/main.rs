//! Evolution CMS Installer - Main entry point
//!
//! Parses the command line, starts an engine on a background task and hands
//! the event stream to the selected front end. Once the front end returns,
//! the report is finalized and a requested post-exit command is run.

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use evo_installer::cli::{Cli, Commands, InstallArgs};
use evo_installer::config_file::AnswersFile;
use evo_installer::engine::{self, DemoEngine, Engine, InstallEngine};
use evo_installer::error::InstallerError;
use evo_installer::frontend::{Outcome, batch, prompt};
use evo_installer::process_guard::{self, ProcessGuard};
use evo_installer::protocol::{action_channel, event_channel};
use evo_installer::release::{GithubClient, VersionCache};
use evo_installer::report::{EventLogger, ReportConfig};
use evo_installer::supervisor::INSTALL_SOURCE;
use evo_installer::toolchain::PhpToolchain;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit code for invalid command line input
const USAGE_EXIT: u8 = 2;

/// Initialize diagnostics on stderr; `RUST_LOG` overrides the default level.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    debug!(version = VERSION, "evo starting up");

    let cli = Cli::parse_args();
    match cli.command {
        Commands::Version => {
            println!("Evolution CMS Installer {VERSION}");
            ExitCode::SUCCESS
        }
        Commands::Install(args) => run_install(&args).await,
    }
}

fn user_message(err: &InstallerError) -> String {
    match err {
        InstallerError::Config(msg) => msg.clone(),
        other => other.to_string(),
    }
}

async fn run_install(args: &InstallArgs) -> ExitCode {
    let mut opts = match args.to_options(VERSION) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("{}", user_message(&e));
            return ExitCode::from(USAGE_EXIT);
        }
    };

    if let Some(path) = &args.config {
        match AnswersFile::load_from_file(path) {
            Ok(answers) => answers.layer_under(&mut opts),
            Err(e) => {
                eprintln!("✗ {e:#}");
                return ExitCode::from(USAGE_EXIT);
            }
        }
    }

    if args.cli && !args.demo {
        if let Err(e) = opts.apply_batch_defaults() {
            eprintln!("{}", user_message(&e));
            return ExitCode::from(USAGE_EXIT);
        }
    }

    let cancel = CancellationToken::new();
    if let Err(e) = process_guard::init_signal_handlers(cancel.clone()) {
        warn!(error = %e, "failed to initialize signal handlers");
    }
    let _guard = ProcessGuard::new();

    let engine: Box<dyn Engine> = if args.demo {
        info!(speed = args.demo_speed, fail_step = ?args.demo_fail_step, "starting demo engine");
        Box::new(DemoEngine::new(args.demo_options()))
    } else {
        let releases = match GithubClient::new(opts.github_token().map(str::to_string)) {
            Ok(client) => client,
            Err(e) => {
                eprintln!("✗ {e}");
                return ExitCode::FAILURE;
            }
        };
        Box::new(InstallEngine::new(
            opts.clone(),
            Arc::new(PhpToolchain::new()),
            Arc::new(releases),
            VersionCache::user_default(),
        ))
    };

    let mut logger = EventLogger::new(ReportConfig::from_options(&opts, args.mode(), args.log));
    let (sink, events) = event_channel(cancel.clone(), INSTALL_SOURCE);
    let (actions, action_source) = action_channel();
    let handle = engine::spawn(engine, sink, action_source, cancel.clone());

    let outcome = if args.cli {
        batch::run(events, actions, cancel.clone(), &mut logger, args.quiet).await
    } else {
        prompt::run(events, actions, cancel.clone(), &mut logger).await
    };

    // The front end is gone; nothing will answer the engine any more.
    cancel.cancel();
    if let Err(e) = handle.await {
        warn!(error = %e, "engine task ended abnormally");
    }

    finish(outcome, &mut logger).await
}

async fn finish(outcome: Outcome, logger: &mut EventLogger) -> ExitCode {
    let error = outcome.error_message();
    if error.is_some() {
        logger.mark_failure();
    }
    match logger.finalize() {
        Ok(Some(path)) => eprintln!("Installer log saved to {}", path.display()),
        Ok(None) => {}
        Err(e) => eprintln!("{e}"),
    }

    if let Some(message) = error {
        eprintln!("{message}");
        return ExitCode::FAILURE;
    }
    match outcome.exec {
        Some(command) => run_post_exec(&command).await,
        None => ExitCode::SUCCESS,
    }
}

/// Run the command the engine asked for, e.g. the installer's self-update.
///
/// Scripts that cannot be executed directly are retried through `php`.
async fn run_post_exec(argv: &[String]) -> ExitCode {
    let Some((program, rest)) = argv.split_first() else {
        return ExitCode::SUCCESS;
    };
    if program.trim().is_empty() {
        return ExitCode::SUCCESS;
    }
    info!(command = ?argv, "running post-exit command");

    let first = tokio::process::Command::new(program).args(rest).status().await;
    let status = match first {
        Ok(status) => status,
        Err(e) if is_not_executable(&e) => {
            debug!(error = %e, "retrying post-exit command via php");
            match tokio::process::Command::new("php").args(argv).status().await {
                Ok(status) => status,
                Err(e) => {
                    eprintln!("{e}");
                    return ExitCode::FAILURE;
                }
            }
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match status.code() {
        Some(0) => ExitCode::SUCCESS,
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::FAILURE,
    }
}

fn is_not_executable(err: &std::io::Error) -> bool {
    use nix::errno::Errno;
    matches!(
        err.raw_os_error(),
        Some(code) if code == Errno::ENOEXEC as i32 || code == Errno::EACCES as i32
    )
}
