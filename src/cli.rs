use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::InstallOptions;
use crate::engine::DemoOptions;
use crate::error::{InstallerError, Result};
use crate::extras::ExtrasSelection;

/// Evolution CMS Installer
#[derive(Debug, Parser)]
#[command(name = "evo")]
#[command(about = "Installs Evolution CMS into a directory, interactively or in batch mode")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Install Evolution CMS
    Install(Box<InstallArgs>),
    /// Print the installer version
    Version,
}

#[derive(Debug, Clone, Default, Args)]
pub struct InstallArgs {
    /// Directory to install into
    #[arg(default_value = ".")]
    pub dir: PathBuf,

    /// Force installation even if the directory already holds an install
    #[arg(short, long)]
    pub force: bool,

    /// Install from a specific Git branch instead of the latest release
    #[arg(long, default_value = "")]
    pub branch: String,

    /// Database driver (mysql, pgsql, sqlite, sqlsrv)
    #[arg(long, default_value = "")]
    pub db_type: String,

    /// Database host (default: localhost)
    #[arg(long, default_value = "")]
    pub db_host: String,

    /// Database port (default depends on the driver)
    #[arg(long)]
    pub db_port: Option<u16>,

    /// Database name, or the SQLite file path
    #[arg(long, default_value = "")]
    pub db_name: String,

    /// Database username
    #[arg(long, default_value = "")]
    pub db_user: String,

    /// Database password
    #[arg(long, default_value = "")]
    pub db_password: String,

    /// Admin username
    #[arg(long, default_value = "")]
    pub admin_username: String,

    /// Admin email
    #[arg(long, default_value = "")]
    pub admin_email: String,

    /// Admin password (at least 6 characters)
    #[arg(long, default_value = "")]
    pub admin_password: String,

    /// Admin directory (default: manager)
    #[arg(long, default_value = "")]
    pub admin_directory: String,

    /// Installation language, e.g. en or uk
    #[arg(long, default_value = "")]
    pub language: String,

    /// GitHub personal access token for API requests
    #[arg(long, alias = "github_pat")]
    pub github_pat: Option<String>,

    /// Comma-separated extras to install, e.g. sTask@main,sSeo
    #[arg(long, default_value = "")]
    pub extras: String,

    /// Stop installing extras at the first failing package
    #[arg(long)]
    pub extras_fail_fast: bool,

    /// Answers file (JSON) filling flags that were not given
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Always write the installer log to log.md
    #[arg(long)]
    pub log: bool,

    /// Clear the Composer cache before installing
    #[arg(long)]
    pub composer_clear_cache: bool,

    /// Use composer update instead of install during setup
    #[arg(long)]
    pub composer_update: bool,

    /// Run non-interactively; every answer must come from flags
    #[arg(long)]
    pub cli: bool,

    /// Reduce batch output to warnings and errors
    #[arg(long)]
    pub quiet: bool,

    /// Run a simulated installation without touching the system
    #[arg(long)]
    pub demo: bool,

    /// Speed multiplier of the simulation
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub demo_speed: u32,

    /// Simulate a failure on this quest step (1-8)
    #[arg(long)]
    pub demo_fail_step: Option<usize>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Parse the comma-separated `--extras` value.
pub fn parse_extras(raw: &str) -> Result<Vec<ExtrasSelection>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            ExtrasSelection::parse(part)
                .ok_or_else(|| InstallerError::config(format!("invalid --extras value: \"{part}\"")))
        })
        .collect()
}

impl InstallArgs {
    /// Build the install options; `version` is the running installer's.
    pub fn to_options(&self, version: &str) -> Result<InstallOptions> {
        Ok(InstallOptions {
            dir: self.dir.clone(),
            force: self.force,
            self_version: version.to_string(),
            branch: self.branch.trim().to_string(),
            composer_clear_cache: self.composer_clear_cache,
            composer_update: self.composer_update,
            db_type: self.db_type.trim().to_lowercase(),
            db_host: self.db_host.trim().to_string(),
            db_port: self.db_port.filter(|p| *p > 0),
            db_name: self.db_name.trim().to_string(),
            db_user: self.db_user.trim().to_string(),
            db_password: self.db_password.clone(),
            admin_username: self.admin_username.trim().to_string(),
            admin_email: self.admin_email.trim().to_string(),
            admin_password: self.admin_password.clone(),
            admin_directory: self.admin_directory.trim().to_string(),
            language: self.language.trim().to_lowercase(),
            github_token: self
                .github_pat
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            extras: parse_extras(&self.extras)?,
            extras_fail_fast: self.extras_fail_fast,
        })
    }

    pub fn demo_options(&self) -> DemoOptions {
        DemoOptions {
            speed: self.demo_speed,
            fail_step: self.demo_fail_step,
        }
    }

    /// Mode name recorded in the report
    pub fn mode(&self) -> &'static str {
        match (self.demo, self.cli) {
            (true, _) => "demo",
            (false, true) => "cli",
            (false, false) => "install",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install(args: &[&str]) -> InstallArgs {
        let cli = Cli::try_parse_from(std::iter::once("evo").chain(args.iter().copied())).unwrap();
        match cli.command {
            Commands::Install(args) => *args,
            Commands::Version => panic!("expected install"),
        }
    }

    #[test]
    fn test_install_flags() {
        let args = install(&[
            "install",
            "site",
            "-f",
            "--db-type",
            "SQLite",
            "--db-name=db.sqlite",
            "--github_pat",
            " token ",
            "--extras",
            "sTask@main, sSeo",
            "--cli",
        ]);
        assert_eq!(args.mode(), "cli");

        let opts = args.to_options("1.2.0").unwrap();
        assert_eq!(opts.dir, PathBuf::from("site"));
        assert!(opts.force);
        assert_eq!(opts.db_type, "sqlite");
        assert_eq!(opts.db_name, "db.sqlite");
        assert_eq!(opts.github_token(), Some("token"));
        assert_eq!(
            opts.extras,
            vec![ExtrasSelection::new("sTask", "main"), ExtrasSelection::new("sSeo", "")]
        );
        assert_eq!(opts.self_version, "1.2.0");
    }

    #[test]
    fn test_dir_defaults_to_current() {
        let args = install(&["install"]);
        assert_eq!(args.dir, PathBuf::from("."));
        assert_eq!(args.mode(), "install");
        assert_eq!(args.demo_speed, 1);
    }

    #[test]
    fn test_invalid_extras() {
        assert!(parse_extras("sSeo,@1.0").is_err());
        assert!(parse_extras(" , ").unwrap().is_empty());
    }

    #[test]
    fn test_version_command() {
        let cli = Cli::try_parse_from(["evo", "version"]).unwrap();
        assert!(matches!(cli.command, Commands::Version));
    }

    #[test]
    fn test_demo_speed_must_be_positive() {
        assert!(Cli::try_parse_from(["evo", "install", "--demo", "--demo-speed", "0"]).is_err());
    }
}
