//! System status snapshot
//!
//! The status probe reports a list of checks (PHP extensions, PDO drivers,
//! writable paths). The overall level is always recomputed from the items so
//! an upstream `overall` value can never hide an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StatusLevel {
    #[default]
    Ok,
    Warn,
    Error,
}

impl StatusLevel {
    /// Lenient parse used for probe output; unknown values count as ok.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "warn" | "warning" => Self::Warn,
            "error" | "err" => Self::Error,
            _ => Self::Ok,
        }
    }

    pub const fn overall_label(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warn => "Warnings",
            Self::Error => "Errors",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusItem {
    pub key: String,
    pub label: String,
    pub level: StatusLevel,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemStatus {
    pub items: Vec<StatusItem>,
    pub overall: StatusLevel,
    pub overall_label: String,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for SystemStatus {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            overall: StatusLevel::Ok,
            overall_label: StatusLevel::Ok.overall_label().to_string(),
            updated_at: None,
        }
    }
}

impl SystemStatus {
    pub fn new(items: Vec<StatusItem>) -> Self {
        Self {
            items,
            updated_at: Some(Utc::now()),
            ..Self::default()
        }
        .normalize()
    }

    /// Recompute `overall` from the items and fill in missing metadata.
    pub fn normalize(mut self) -> Self {
        self.overall = overall_level(&self.items);
        self.overall_label = self.overall.overall_label().to_string();
        if self.updated_at.is_none() {
            self.updated_at = Some(Utc::now());
        }
        self
    }

    pub fn level_for(&self, key: &str) -> Option<StatusLevel> {
        self.items
            .iter()
            .find(|item| item.key == key)
            .map(|item| item.level)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// error > warn > ok
pub fn overall_level(items: &[StatusItem]) -> StatusLevel {
    items
        .iter()
        .map(|item| item.level)
        .max()
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct StatusDocument {
    #[serde(default)]
    items: Vec<StatusDocumentItem>,
}

#[derive(Debug, Deserialize)]
struct StatusDocumentItem {
    #[serde(default)]
    key: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    level: String,
    #[serde(default)]
    details: String,
}

/// Parse the JSON document printed by `system-status --format=json`.
pub fn parse_status_document(raw: &[u8]) -> serde_json::Result<SystemStatus> {
    let doc: StatusDocument = serde_json::from_slice(raw)?;
    let items = doc
        .items
        .into_iter()
        .map(|item| StatusItem {
            key: item.key,
            label: item.label,
            level: StatusLevel::parse_lenient(&item.level),
            details: item.details,
        })
        .collect();
    Ok(SystemStatus::new(items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn item(key: &str, level: StatusLevel) -> StatusItem {
        StatusItem {
            key: key.to_string(),
            label: key.to_string(),
            level,
            details: String::new(),
        }
    }

    #[test]
    fn test_overall_prefers_error() {
        let status = SystemStatus::new(vec![
            item("php", StatusLevel::Ok),
            item("pdo_mysql", StatusLevel::Warn),
            item("pdo_pgsql", StatusLevel::Error),
        ]);
        assert_eq!(status.overall, StatusLevel::Error);
        assert_eq!(status.overall_label, "Errors");
    }

    #[test]
    fn test_upstream_overall_is_ignored() {
        let raw = br#"{"overall":"ok","items":[{"key":"pdo","label":"PDO","level":"WARNING"}]}"#;
        let status = parse_status_document(raw).unwrap();
        assert_eq!(status.overall, StatusLevel::Warn);
        assert_eq!(status.level_for("pdo"), Some(StatusLevel::Warn));
    }

    #[test]
    fn test_unknown_level_defaults_to_ok() {
        let raw = br#"{"overall":"error","items":[{"key":"json","label":"JSON","level":"maybe"}]}"#;
        let status = parse_status_document(raw).unwrap();
        assert_eq!(status.overall, StatusLevel::Ok);
    }

    #[test]
    fn test_level_parse_is_case_insensitive() {
        assert_eq!(StatusLevel::parse_lenient(" Err "), StatusLevel::Error);
        assert_eq!(StatusLevel::parse_lenient("WARN"), StatusLevel::Warn);
        assert_eq!(StatusLevel::parse_lenient(""), StatusLevel::Ok);
    }

    fn level_strategy() -> impl Strategy<Value = StatusLevel> {
        prop_oneof![
            Just(StatusLevel::Ok),
            Just(StatusLevel::Warn),
            Just(StatusLevel::Error),
        ]
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(levels in prop::collection::vec(level_strategy(), 0..12)) {
            let items = levels
                .iter()
                .enumerate()
                .map(|(i, level)| item(&format!("k{i}"), *level))
                .collect();
            let once = SystemStatus { items, ..SystemStatus::default() }.normalize();
            let twice = once.clone().normalize();
            prop_assert_eq!(once.overall, twice.overall);
            prop_assert_eq!(once, twice);
        }
    }
}
