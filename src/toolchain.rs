//! PHP toolchain collaborator
//!
//! Everything the engine learns from or asks of the PHP side goes through the
//! [`Toolchain`] trait: system status, runtime version, the database probe,
//! the install command, the updater and the artisan-based extras commands.
//! [`PhpToolchain`] is the real implementation; tests inject fakes.

use crate::config::DbDriver;
use crate::error::{InstallerError, Result};
use crate::extras::{ExtrasPackage, parse_catalog};
use crate::process_guard::CommandProcessGroup;
use crate::status::{SystemStatus, parse_status_document};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const STATUS_TIMEOUT: Duration = Duration::from_secs(25);
const RUNTIME_TIMEOUT: Duration = Duration::from_secs(15);
const ARTISAN_VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const PHP_VERSION_TIMEOUT: Duration = Duration::from_secs(5);
const EXTRAS_LIST_TIMEOUT: Duration = Duration::from_secs(120);
const DB_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
/// Package installs run Composer and may download a lot
const ARTISAN_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// PHP script run with `php -r` to test database connectivity
const DB_PROBE_SCRIPT: &str = include_str!("../resources/db_probe.php");

/// Connection parameters for the selected driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbParams {
    pub driver: DbDriver,
    pub host: String,
    pub port: u16,
    /// Database name, or the file path for SQLite
    pub name: String,
    pub user: String,
    pub password: String,
}

impl DbParams {
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            driver: DbDriver::Sqlite,
            host: String::new(),
            port: 0,
            name: path.into(),
            user: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Serialize)]
struct ProbeConfig<'a> {
    #[serde(rename = "type")]
    driver: String,
    #[serde(skip_serializing_if = "str::is_empty")]
    host: &'a str,
    #[serde(skip_serializing_if = "is_zero")]
    port: u16,
    #[serde(skip_serializing_if = "str::is_empty")]
    name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    user: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    password: &'a str,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

/// Base64-encoded JSON argument for the probe script
pub fn encode_probe_config(params: &DbParams) -> Result<String> {
    let config = ProbeConfig {
        driver: params.driver.to_string(),
        host: &params.host,
        port: params.port,
        name: &params.name,
        user: &params.user,
        password: &params.password,
    };
    Ok(BASE64.encode(serde_json::to_vec(&config)?))
}

/// Answer of the database probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DbProbeResult {
    pub ok: bool,
    #[serde(default)]
    pub error: String,
}

/// Inputs for the supervised install command
#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub workdir: PathBuf,
    pub db: DbParams,
    pub admin_username: String,
    pub admin_email: String,
    pub admin_password: String,
    pub admin_directory: String,
    pub language: String,
    pub branch: String,
    pub github_token: Option<String>,
    pub force: bool,
    pub composer_update: bool,
    pub composer_clear_cache: bool,
}

impl InstallPlan {
    /// Arguments following the entry script
    pub fn arguments(&self) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            ".".to_string(),
            "--no-ansi".to_string(),
            "--no-interaction".to_string(),
            format!("--db-type={}", self.db.driver),
            format!("--db-host={}", self.db.host),
            format!("--db-port={}", self.db.port),
            format!("--db-name={}", self.db.name),
            format!("--db-user={}", self.db.user),
            format!("--db-password={}", self.db.password),
            format!("--admin-username={}", self.admin_username),
            format!("--admin-email={}", self.admin_email),
            format!("--admin-password={}", self.admin_password),
            format!("--admin-directory={}", self.admin_directory),
            format!("--language={}", self.language),
        ];
        let branch = self.branch.trim();
        if !branch.is_empty() {
            args.push(format!("--branch={branch}"));
        }
        if let Some(token) = self.github_token.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            args.push(format!("--github-pat={token}"));
        }
        if self.force {
            args.push("--force".to_string());
        }
        if self.composer_update {
            args.push("--composer-update".to_string());
        }
        if self.composer_clear_cache {
            args.push("--composer-clear-cache".to_string());
        }
        args
    }

    /// Extra environment for the install command
    pub fn environment(&self) -> Vec<(&'static str, &'static str)> {
        let mut env = vec![("CI", "1")];
        // older installers connect without a dbname first
        if self.db.driver == DbDriver::Pgsql {
            env.push(("PGDATABASE", "template1"));
        }
        env
    }
}

/// Where artisan-based extras commands run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtrasEnv {
    pub core_dir: PathBuf,
    /// Non-fatal prerequisite warning
    pub warning: Option<String>,
}

impl ExtrasEnv {
    pub fn artisan(&self) -> PathBuf {
        self.core_dir.join("artisan")
    }
}

/// Combined output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    /// Set when the command could not run or exited unsuccessfully
    pub error: Option<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// The PHP side of the installer.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Run the system status probe.
    async fn system_status(&self) -> Result<SystemStatus>;

    /// Raw runtime version string, e.g. `8.3.4`.
    async fn runtime_version(&self) -> Result<String>;

    /// Try to connect with `params`. `Err` means the probe itself failed.
    async fn test_database(&self, workdir: &Path, params: &DbParams) -> Result<DbProbeResult>;

    /// Build the install command. The caller spawns and supervises it.
    fn install_command(&self, plan: &InstallPlan) -> Result<Command>;

    /// Command that replaces the installer with its updater.
    fn updater_command(&self) -> Result<Vec<String>>;

    async fn extras_prerequisites(&self, workdir: &Path) -> Result<ExtrasEnv>;

    async fn list_extras(&self, env: &ExtrasEnv, token: Option<&str>) -> Result<Vec<ExtrasPackage>>;

    async fn run_artisan(&self, env: &ExtrasEnv, token: Option<&str>, args: &[String]) -> CommandOutput;
}

/// [`Toolchain`] backed by the local `php` binary and the installer's PHP entry points
#[derive(Debug, Clone)]
pub struct PhpToolchain {
    php: String,
    exe_dir: Option<PathBuf>,
    db_probe_timeout: Duration,
    artisan_timeout: Duration,
}

impl Default for PhpToolchain {
    fn default() -> Self {
        Self::new()
    }
}

impl PhpToolchain {
    pub fn new() -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        Self {
            php: "php".to_string(),
            exe_dir,
            db_probe_timeout: DB_PROBE_TIMEOUT,
            artisan_timeout: ARTISAN_TIMEOUT,
        }
    }

    fn php(&self) -> Command {
        let mut cmd = Command::new(&self.php);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// The internal console runner, `installer/bin/evo`
    pub fn symfony_entry(&self) -> Result<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(exe_dir) = &self.exe_dir {
            if let Some(base) = exe_dir.parent() {
                candidates.push(base.join("installer/bin/evo"));
            }
            candidates.push(exe_dir.join("installer/bin/evo"));
            if let Some(root) = exe_dir.parent().and_then(Path::parent) {
                candidates.push(root.join("installer/bin/evo"));
            }
        }
        candidates.push(PathBuf::from("installer/bin/evo"));

        candidates
            .iter()
            .find(|p| p.is_file() && looks_like_php_script(p) && looks_like_symfony_entry(p))
            .map(|p| absolute(p))
            .ok_or_else(|| {
                InstallerError::engine(
                    "unable to find Symfony PHP CLI entry (expected installer/bin/evo). \
                     Ensure the PHP installer package files are present next to the binary",
                )
            })
    }

    /// The end-user bootstrapper script, `evo`
    pub fn bootstrapper_entry(&self) -> Result<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(exe_dir) = self.exe_dir.as_ref().filter(|d| !d.as_os_str().is_empty()) {
            candidates.push(exe_dir.join("evo"));
        }
        if let Some(found) = find_in_path("evo") {
            candidates.push(found);
        }
        candidates.push(PathBuf::from("bin/evo"));

        candidates
            .iter()
            .find(|p| p.is_file() && looks_like_php_script(p))
            .map(|p| absolute(p))
            .ok_or_else(|| {
                let tried: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
                InstallerError::engine(format!(
                    "unable to find PHP bootstrapper entry (tried: {})",
                    tried.join(", ")
                ))
            })
    }

    fn status_entry(&self) -> Result<PathBuf> {
        self.symfony_entry().or_else(|_| self.bootstrapper_entry())
    }
}

#[async_trait]
impl Toolchain for PhpToolchain {
    async fn system_status(&self) -> Result<SystemStatus> {
        let entry = self.status_entry()?;
        let mut cmd = self.php();
        cmd.arg(&entry)
            .args(["system-status", "--format=json", "--no-ansi", "--no-interaction"]);
        let output = run_with_timeout(&mut cmd, STATUS_TIMEOUT).await?;

        match parse_status_document(&output.stdout) {
            Ok(status) => {
                debug!(items = status.items.len(), overall = %status.overall, "system status parsed");
                Ok(status)
            }
            Err(parse_err) if output.status.success() => Err(parse_err.into()),
            Err(_) => Err(InstallerError::probe(failure_message(&output))),
        }
    }

    async fn runtime_version(&self) -> Result<String> {
        let mut cmd = self.php();
        cmd.args(["-r", "echo PHP_VERSION;"]);
        let output = run_with_timeout(&mut cmd, RUNTIME_TIMEOUT).await?;
        if !output.status.success() {
            return Err(InstallerError::probe(failure_message(&output)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn test_database(&self, workdir: &Path, params: &DbParams) -> Result<DbProbeResult> {
        let encoded = encode_probe_config(params)?;
        let mut cmd = self.php();
        cmd.args(["-r", DB_PROBE_SCRIPT]).arg(encoded);
        if workdir.is_dir() {
            cmd.current_dir(workdir);
        }
        debug!(driver = %params.driver, host = %params.host, "testing database connection");
        let output = run_with_timeout(&mut cmd, self.db_probe_timeout).await?;
        if !output.status.success() {
            return Err(InstallerError::probe(failure_message(&output)));
        }
        Ok(serde_json::from_slice(output.stdout.trim_ascii())?)
    }

    fn install_command(&self, plan: &InstallPlan) -> Result<Command> {
        let entry = self.symfony_entry()?;
        let mut cmd = Command::new(&self.php);
        cmd.arg(entry)
            .args(plan.arguments())
            .envs(plan.environment())
            .current_dir(&plan.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .in_new_process_group();
        Ok(cmd)
    }

    fn updater_command(&self) -> Result<Vec<String>> {
        let entry = self.bootstrapper_entry()?.display().to_string();
        if cfg!(windows) {
            Ok(vec![self.php.clone(), entry, "self-update".to_string()])
        } else {
            Ok(vec![entry, "self-update".to_string()])
        }
    }

    async fn extras_prerequisites(&self, workdir: &Path) -> Result<ExtrasEnv> {
        let core_dir = absolute(&workdir.join("core"));
        let artisan = core_dir.join("artisan");
        if !artisan.is_file() {
            return Err(InstallerError::probe("missing core/artisan"));
        }
        if find_in_path(&self.php).is_none() && !Path::new(&self.php).is_file() {
            return Err(InstallerError::probe("php executable not found"));
        }

        let mut version = self.php();
        version.arg(&artisan).arg("--version").current_dir(&core_dir);
        let artisan_ok = matches!(
            run_with_timeout(&mut version, ARTISAN_VERSION_TIMEOUT).await,
            Ok(out) if out.status.success()
        );
        if artisan_ok {
            return Ok(ExtrasEnv {
                core_dir,
                warning: None,
            });
        }

        let mut fallback = self.php();
        fallback.arg("-v");
        match run_with_timeout(&mut fallback, PHP_VERSION_TIMEOUT).await {
            Ok(out) if out.status.success() => Ok(ExtrasEnv {
                core_dir,
                warning: Some("Unable to run artisan --version; continuing with php -v.".to_string()),
            }),
            Ok(out) => Err(InstallerError::probe(format!(
                "unable to run php: {}",
                failure_message(&out)
            ))),
            Err(e) => Err(InstallerError::probe(format!("unable to run php: {e}"))),
        }
    }

    async fn list_extras(&self, env: &ExtrasEnv, token: Option<&str>) -> Result<Vec<ExtrasPackage>> {
        let mut cmd = self.artisan(env, token);
        cmd.args(["extras", "--list", "--json", "--no-ansi", "--no-interaction"]);
        let output = run_with_timeout(&mut cmd, EXTRAS_LIST_TIMEOUT).await?;
        let combined = combined_output(&output);

        match parse_catalog(combined.as_bytes()) {
            Ok(packages) => Ok(packages),
            Err(_) if !output.status.success() => Err(InstallerError::probe(format!(
                "extras list command failed: {} ({})",
                output.status,
                combined.trim()
            ))),
            Err(e) => Err(e),
        }
    }

    async fn run_artisan(&self, env: &ExtrasEnv, token: Option<&str>, args: &[String]) -> CommandOutput {
        let mut cmd = self.artisan(env, token);
        cmd.args(args);
        debug!(?args, "running artisan");
        match run_with_timeout(&mut cmd, self.artisan_timeout).await {
            Ok(output) => CommandOutput {
                output: combined_output(&output),
                error: (!output.status.success()).then(|| output.status.to_string()),
            },
            Err(e) => {
                warn!(error = %e, "unable to run artisan");
                CommandOutput {
                    output: String::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

impl PhpToolchain {
    fn artisan(&self, env: &ExtrasEnv, token: Option<&str>) -> Command {
        let mut cmd = self.php();
        cmd.arg(env.artisan()).current_dir(&env.core_dir).env("CI", "1");
        if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
            cmd.env("GITHUB_PAT", token);
        }
        cmd
    }
}

async fn run_with_timeout(cmd: &mut Command, limit: Duration) -> Result<Output> {
    match tokio::time::timeout(limit, cmd.output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(InstallerError::probe(format!(
            "command timed out after {}s",
            limit.as_secs()
        ))),
    }
}

/// Exit status plus trimmed stderr, for error messages
fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        output.status.to_string()
    } else {
        format!("{}: {stderr}", output.status)
    }
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Look `name` up on `PATH`
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn read_head(path: &Path, limit: usize) -> Option<String> {
    let mut file = fs::File::open(path).ok()?;
    let mut buf = vec![0u8; limit];
    let n = file.read(&mut buf).ok()?;
    if n == 0 {
        return None;
    }
    buf.truncate(n);
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// A file with a `<?php` tag or a php shebang
pub fn looks_like_php_script(path: &Path) -> bool {
    let Some(head) = read_head(path, 256) else {
        return false;
    };
    let head = head.to_lowercase();
    head.contains("<?php") || (head.starts_with("#!") && head.contains("php"))
}

/// The internal console runner rather than the end-user bootstrapper
pub fn looks_like_symfony_entry(path: &Path) -> bool {
    if path.to_string_lossy().replace('\\', "/").ends_with("/installer/bin/evo") {
        return true;
    }
    read_head(path, 2048).is_some_and(|head| {
        head.contains("EvolutionCMS\\\\Installer\\\\Application")
            || head.contains("Internal PHP CLI entrypoint")
            || head.contains("Symfony Console")
    })
}
