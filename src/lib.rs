//! Evolution CMS Installer Library
//!
//! The headless orchestration engine behind the `evo` binary: it drives the
//! installation workflow, speaks to front ends over an event/action protocol,
//! supervises the PHP install subprocess and writes the installer report.

pub mod cli;
pub mod config;
pub mod config_file;
pub mod engine;
pub mod error;
pub mod extras;
pub mod frontend;
pub mod output;
pub mod process_guard;
pub mod progress;
pub mod protocol;
pub mod release;
pub mod report;
pub mod status;
pub mod step_tracker;
pub mod steps;
pub mod supervisor;
pub mod toolchain;
pub mod view;

// Re-export main types for convenience
pub use config::{DbDriver, InstallOptions};
pub use config_file::AnswersFile;
pub use engine::{DemoEngine, DemoOptions, Engine, InstallEngine};
pub use error::{InstallerError, Result};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use protocol::{Action, ActionSender, ActionSource, Event, EventKind, EventSink};
pub use report::{EventLogger, ReportConfig};
pub use steps::{QuestStep, StepState, StepStatus};
pub use toolchain::{PhpToolchain, Toolchain};
pub use view::InstallView;
