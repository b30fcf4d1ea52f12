//! Answers file handling
//!
//! An answers file is a JSON document with the same fields as the command
//! line flags. Values from the command line always win; the file only fills
//! what was left empty.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::InstallOptions;
use crate::extras::ExtrasSelection;

/// Pre-supplied answers loaded from `--config <file>`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AnswersFile {
    pub force: Option<bool>,
    pub branch: Option<String>,
    pub composer_clear_cache: Option<bool>,
    pub composer_update: Option<bool>,

    pub db_type: Option<String>,
    pub db_host: Option<String>,
    pub db_port: Option<u16>,
    pub db_name: Option<String>,
    pub db_user: Option<String>,
    pub db_password: Option<String>,

    pub admin_username: Option<String>,
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
    pub admin_directory: Option<String>,
    pub language: Option<String>,

    pub github_pat: Option<String>,
    /// `name` or `name@version` entries
    pub extras: Vec<String>,
    pub extras_fail_fast: Option<bool>,
}

impl AnswersFile {
    /// Load answers from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read answers from {:?}", path.as_ref()))?;

        let answers: Self =
            serde_json::from_str(&content).context("Failed to parse answers JSON")?;

        Ok(answers)
    }

    /// Fill every empty field of `opts` from this file.
    pub fn layer_under(&self, opts: &mut InstallOptions) {
        opts.force |= self.force.unwrap_or(false);
        opts.composer_clear_cache |= self.composer_clear_cache.unwrap_or(false);
        opts.composer_update |= self.composer_update.unwrap_or(false);
        opts.extras_fail_fast |= self.extras_fail_fast.unwrap_or(false);

        fill(&mut opts.branch, &self.branch);
        fill(&mut opts.db_type, &self.db_type);
        fill(&mut opts.db_host, &self.db_host);
        fill(&mut opts.db_name, &self.db_name);
        fill(&mut opts.db_user, &self.db_user);
        fill(&mut opts.db_password, &self.db_password);
        fill(&mut opts.admin_username, &self.admin_username);
        fill(&mut opts.admin_email, &self.admin_email);
        fill(&mut opts.admin_password, &self.admin_password);
        fill(&mut opts.admin_directory, &self.admin_directory);
        fill(&mut opts.language, &self.language);

        if opts.db_port.is_none() {
            opts.db_port = self.db_port.filter(|p| *p > 0);
        }
        if opts.github_token().is_none() {
            opts.github_token = self.github_pat.clone();
        }
        if opts.extras.is_empty() {
            opts.extras = ExtrasSelection::parse_list(&self.extras);
        }
    }
}

fn fill(field: &mut String, value: &Option<String>) {
    if !field.trim().is_empty() {
        return;
    }
    if let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        *field = value.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_answers_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"db-type":"pgsql","db-port":6432,"admin-email":"a@example.com","extras":["sSeo@1.2.3","sUsers"]}}"#
        )
        .unwrap();

        let answers = AnswersFile::load_from_file(file.path()).unwrap();
        assert_eq!(answers.db_type.as_deref(), Some("pgsql"));
        assert_eq!(answers.db_port, Some(6432));
        assert_eq!(answers.extras.len(), 2);
    }

    #[test]
    fn test_load_rejects_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not json").unwrap();
        let err = AnswersFile::load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse answers JSON"));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(AnswersFile::load_from_file("/nonexistent/answers.json").is_err());
    }

    #[test]
    fn test_command_line_wins() {
        let answers = AnswersFile {
            db_type: Some("pgsql".to_string()),
            db_name: Some("from_file".to_string()),
            db_port: Some(6432),
            language: Some("  ".to_string()),
            extras: vec!["sSeo@1.2.3".to_string()],
            force: Some(true),
            ..AnswersFile::default()
        };
        let mut opts = InstallOptions {
            db_name: "from_cli".to_string(),
            ..InstallOptions::default()
        };
        answers.layer_under(&mut opts);

        assert_eq!(opts.db_type, "pgsql");
        assert_eq!(opts.db_name, "from_cli");
        assert_eq!(opts.db_port, Some(6432));
        assert_eq!(opts.language, "");
        assert!(opts.force);
        assert_eq!(opts.extras, vec![ExtrasSelection::new("sSeo", "1.2.3")]);
    }
}
