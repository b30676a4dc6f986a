use std::path::PathBuf;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::storage::repository;
use crate::storage::Database;

pub const KEY_MULTISITE: &str = "multisite";
pub const KEY_DEFAULT_SITE: &str = "default_site";
pub const KEY_SOURCE_DB: &str = "source_db";

pub const DEFAULT_SITE: &str = "default";

/// Settings passed into every pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineConfig {
    /// When false there is a single site, `default_site`, and it owns every course.
    pub multisite: bool,
    pub default_site: String,
    /// Path of the learner snapshot database.
    pub source_db: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            multisite: false,
            default_site: DEFAULT_SITE.to_string(),
            source_db: None,
        }
    }
}

impl PipelineConfig {
    /// Build from stored `app_config` entries. Unknown keys are ignored.
    pub fn from_entries(entries: &[(String, String)]) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in entries {
            match key.as_str() {
                KEY_MULTISITE => config.multisite = parse_bool(key, value)?,
                KEY_DEFAULT_SITE => {
                    let site = value.trim();
                    if site.is_empty() {
                        return Err(Error::Config(format!("{key} must not be empty")));
                    }
                    config.default_site = site.to_string();
                }
                KEY_SOURCE_DB => config.source_db = Some(PathBuf::from(value)),
                _ => {}
            }
        }
        Ok(config)
    }

    /// Load the configuration stored in the warehouse.
    pub async fn load(db: &Database) -> Result<Self> {
        let entries = db.reader().call(|conn| repository::list_config(conn)).await?;
        Self::from_entries(&entries)
    }

    /// Validate a value before it is stored under `key`.
    pub fn check_value(key: &str, value: &str) -> Result<()> {
        Self::from_entries(&[(key.to_string(), value.to_string())]).map(|_| ())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{key}: expected a boolean, got '{other}'"))),
    }
}
