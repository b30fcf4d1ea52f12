//! Configuration management module
//!
//! Holds the immutable [`InstallOptions`] handed to the engine, the database
//! driver table, the language table and the validation rules shared by the
//! batch front end and the interactive admin questions.

use crate::error::{InstallerError, Result};
use crate::extras::ExtrasSelection;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;
use strum::{Display, EnumIter, EnumString};

/// Minimum admin password length, in characters
pub const MIN_ADMIN_PASSWORD_LEN: usize = 6;
pub const DEFAULT_ADMIN_DIRECTORY: &str = "manager";
pub const DEFAULT_LANGUAGE: &str = "en";

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)*$",
    )
    .expect("email pattern is valid")
});

static ADMIN_DIR_INVALID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_-]+").expect("admin dir pattern is valid"));

/// Supported PDO database drivers
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DbDriver {
    Mysql,
    Pgsql,
    Sqlite,
    Sqlsrv,
}

impl DbDriver {
    /// Name used in log lines
    pub const fn label(self) -> &'static str {
        match self {
            Self::Mysql => "MySQL/MariaDB",
            Self::Pgsql => "PostgreSQL",
            Self::Sqlite => "SQLite",
            Self::Sqlsrv => "SQL Server",
        }
    }

    /// Name used in the driver question
    pub const fn option_label(self) -> &'static str {
        match self {
            Self::Mysql => "MySQL or MariaDB",
            Self::Pgsql => "PostgreSQL",
            Self::Sqlite => "SQLite",
            Self::Sqlsrv => "SQL Server",
        }
    }

    /// System status key of the PDO driver extension
    pub const fn pdo_extension(self) -> &'static str {
        match self {
            Self::Mysql => "pdo_mysql",
            Self::Pgsql => "pdo_pgsql",
            Self::Sqlite => "pdo_sqlite",
            Self::Sqlsrv => "pdo_sqlsrv",
        }
    }

    pub const fn default_port(self) -> u16 {
        match self {
            Self::Pgsql => 5432,
            Self::Sqlsrv => 1433,
            Self::Mysql | Self::Sqlite => 3306,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse().ok()
    }
}

/// Installation languages offered to the operator
pub const LANGUAGES: &[(&str, &str)] = &[
    ("en", "English"),
    ("uk", "Ukrainian"),
    ("az", "Azerbaijani"),
    ("be", "Belarusian"),
    ("bg", "Bulgarian"),
    ("cs", "Czech"),
    ("da", "Danish"),
    ("de", "German"),
    ("es", "Spanish"),
    ("fa", "Persian"),
    ("fi", "Finnish"),
    ("fr", "French"),
    ("he", "Hebrew"),
    ("it", "Italian"),
    ("ja", "Japanese"),
    ("nl", "Dutch"),
    ("nn", "Norwegian"),
    ("pl", "Polish"),
    ("pt", "Portuguese"),
    ("sv", "Swedish"),
    ("zh", "Chinese"),
    ("ru", "Russian"),
];

/// Display name of a language code, or the code itself if unknown
pub fn language_label(id: &str) -> String {
    let id = id.trim().to_lowercase();
    LANGUAGES
        .iter()
        .find(|(code, _)| *code == id)
        .map_or(id.clone(), |(_, label)| (*label).to_string())
}

pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    !email.is_empty() && EMAIL.is_match(email)
}

pub fn is_valid_admin_password(password: &str) -> bool {
    password.chars().count() >= MIN_ADMIN_PASSWORD_LEN
}

/// Reduce an admin directory to `[A-Za-z0-9_-]`, falling back to `manager`.
pub fn sanitize_admin_dir(raw: &str) -> String {
    let cleaned = ADMIN_DIR_INVALID.replace_all(raw.trim(), "");
    if cleaned.is_empty() {
        DEFAULT_ADMIN_DIRECTORY.to_string()
    } else {
        cleaned.into_owned()
    }
}

/// Everything the engine needs to know before it starts.
///
/// Empty strings mean "not supplied"; the engine asks for those.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstallOptions {
    pub dir: PathBuf,
    pub force: bool,
    /// Version of the running installer, used for the self-update check
    pub self_version: String,
    pub branch: String,
    pub composer_clear_cache: bool,
    pub composer_update: bool,

    pub db_type: String,
    pub db_host: String,
    pub db_port: Option<u16>,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,

    pub admin_username: String,
    pub admin_email: String,
    pub admin_password: String,
    pub admin_directory: String,
    pub language: String,

    pub github_token: Option<String>,
    pub extras: Vec<ExtrasSelection>,
    /// Abort the extras batch on the first failing package
    pub extras_fail_fast: bool,
}

impl InstallOptions {
    /// Validate and fill defaults for a run that can never ask questions.
    pub fn apply_batch_defaults(&mut self) -> Result<()> {
        let db_type = self.db_type.trim().to_lowercase();
        if db_type.is_empty() {
            return Err(InstallerError::config("CLI mode requires --db-type"));
        }
        let Some(driver) = DbDriver::parse(&db_type) else {
            return Err(InstallerError::config(format!(
                "CLI mode requires --db-type to be one of: mysql, pgsql, sqlite, sqlsrv (got \"{db_type}\")"
            )));
        };
        self.db_type = driver.to_string();

        if self.db_name.trim().is_empty() {
            return Err(InstallerError::config("CLI mode requires --db-name"));
        }

        if driver != DbDriver::Sqlite {
            fill_default(&mut self.db_host, "localhost");
            fill_default(&mut self.db_user, "root");
        }
        fill_default(&mut self.admin_username, "admin");
        fill_default(&mut self.admin_directory, DEFAULT_ADMIN_DIRECTORY);
        fill_default(&mut self.language, DEFAULT_LANGUAGE);

        let email = self.admin_email.trim().to_string();
        if email.is_empty() {
            return Err(InstallerError::config("CLI mode requires --admin-email"));
        }
        if !is_valid_email(&email) {
            return Err(InstallerError::config(format!(
                "CLI mode requires a valid --admin-email (got \"{email}\")"
            )));
        }
        self.admin_email = email;

        let password = self.admin_password.trim().to_string();
        if password.is_empty() {
            return Err(InstallerError::config("CLI mode requires --admin-password"));
        }
        if !is_valid_admin_password(&password) {
            return Err(InstallerError::config(format!(
                "--admin-password must be at least {MIN_ADMIN_PASSWORD_LEN} characters long"
            )));
        }
        self.admin_password = password;

        Ok(())
    }

    pub fn github_token(&self) -> Option<&str> {
        self.github_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

fn fill_default(field: &mut String, default: &str) {
    if field.trim().is_empty() {
        *field = default.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn batch_options() -> InstallOptions {
        InstallOptions {
            db_type: "MySQL".to_string(),
            db_name: "evo".to_string(),
            admin_email: " admin@example.com ".to_string(),
            admin_password: "secret1".to_string(),
            ..InstallOptions::default()
        }
    }

    #[test]
    fn test_driver_parse_and_ports() {
        assert_eq!(DbDriver::parse(" PGSQL "), Some(DbDriver::Pgsql));
        assert_eq!(DbDriver::parse("oracle"), None);
        assert_eq!(DbDriver::Pgsql.default_port(), 5432);
        assert_eq!(DbDriver::Sqlsrv.default_port(), 1433);
        assert_eq!(DbDriver::Mysql.default_port(), 3306);
        for driver in DbDriver::iter() {
            assert_eq!(DbDriver::parse(&driver.to_string()), Some(driver));
            assert!(driver.pdo_extension().starts_with("pdo_"));
        }
    }

    #[test]
    fn test_language_table() {
        assert_eq!(LANGUAGES.len(), 22);
        assert_eq!(LANGUAGES[0], ("en", "English"));
        assert_eq!(language_label("UK"), "Ukrainian");
        assert_eq!(language_label("xx"), "xx");
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("admin@example.com"));
        assert!(is_valid_email("first.last+tag@sub.example.org"));
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("admin"));
        assert!(!is_valid_email("admin@"));
        assert!(!is_valid_email("a b@example.com"));
    }

    #[test]
    fn test_password_length_counts_characters() {
        assert!(is_valid_admin_password("пароль"));
        assert!(!is_valid_admin_password("12345"));
    }

    #[test]
    fn test_sanitize_admin_dir() {
        let cases = [
            ("", "manager"),
            ("   ", "manager"),
            (" admin ", "admin"),
            ("my-admin_dir", "my-admin_dir"),
            ("../admin", "admin"),
            ("менеджер", "manager"),
            ("my admin dir", "myadmindir"),
        ];
        for (input, expected) in cases {
            assert_eq!(sanitize_admin_dir(input), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_batch_defaults_fill_missing_values() {
        let mut opts = batch_options();
        opts.apply_batch_defaults().unwrap();
        assert_eq!(opts.db_type, "mysql");
        assert_eq!(opts.db_host, "localhost");
        assert_eq!(opts.db_user, "root");
        assert_eq!(opts.admin_username, "admin");
        assert_eq!(opts.admin_directory, "manager");
        assert_eq!(opts.language, "en");
        assert_eq!(opts.admin_email, "admin@example.com");
    }

    #[test]
    fn test_batch_defaults_sqlite_skips_host() {
        let mut opts = batch_options();
        opts.db_type = "sqlite".to_string();
        opts.apply_batch_defaults().unwrap();
        assert_eq!(opts.db_host, "");
        assert_eq!(opts.db_user, "");
    }

    #[test]
    fn test_batch_defaults_reject_missing_inputs() {
        let mut opts = batch_options();
        opts.db_type.clear();
        let err = opts.apply_batch_defaults().unwrap_err();
        assert!(err.to_string().contains("--db-type"));

        let mut opts = batch_options();
        opts.db_type = "oracle".to_string();
        assert!(opts.apply_batch_defaults().is_err());

        let mut opts = batch_options();
        opts.db_name = "  ".to_string();
        assert!(opts.apply_batch_defaults().unwrap_err().to_string().contains("--db-name"));

        let mut opts = batch_options();
        opts.admin_email = "nope".to_string();
        assert!(opts.apply_batch_defaults().unwrap_err().to_string().contains("--admin-email"));

        let mut opts = batch_options();
        opts.admin_password = "12345".to_string();
        assert!(opts.apply_batch_defaults().unwrap_err().to_string().contains("at least 6"));
    }

    #[test]
    fn test_github_token_trimmed() {
        let mut opts = InstallOptions::default();
        assert_eq!(opts.github_token(), None);
        opts.github_token = Some("  ".to_string());
        assert_eq!(opts.github_token(), None);
        opts.github_token = Some(" ghp_x ".to_string());
        assert_eq!(opts.github_token(), Some("ghp_x"));
    }
}
