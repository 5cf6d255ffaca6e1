//! Core settings loaded from a JSON file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DbmxError, DbmxResult};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "DBMX_DATA_DIR";

/// Largest row limit a table tab may request.
pub const MAX_TABLE_ROW_LIMIT: u32 = 100;

/// Tunables of the session core. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreSettings {
    /// Where local storage and logs live
    pub data_dir: PathBuf,
    /// Events buffered per slow subscriber
    pub event_capacity: usize,
    /// Selection label shown when the active tab has no database
    pub placeholder_label: String,
    /// Name given to new query tabs
    pub default_tab_name: String,
    /// Row limit of table tabs when none is set
    pub table_row_limit: u32,
    /// Explicit tracing filter
    pub log_filter: Option<String>,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            data_dir: crate::services::storage::default_data_dir(),
            event_capacity: 256,
            placeholder_label: "Connect to a database".to_string(),
            default_tab_name: "Editor".to_string(),
            table_row_limit: MAX_TABLE_ROW_LIMIT,
            log_filter: None,
        }
    }
}

impl CoreSettings {
    /// Load settings from `path`.
    ///
    /// A missing file yields defaults. `DBMX_DATA_DIR` overrides the data
    /// directory either way.
    pub fn load(path: &Path) -> DbmxResult<Self> {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json(&text)
                .map_err(|e| DbmxError::config(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No settings file, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(DbmxError::config(format!("Failed to read {}: {e}", path.display())));
            }
        };

        if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|dir| !dir.is_empty()) {
            settings.data_dir = PathBuf::from(dir);
        }
        Ok(settings)
    }

    /// Parse and validate settings from JSON text.
    pub fn from_json(text: &str) -> DbmxResult<Self> {
        let settings: Self =
            serde_json::from_str(text).map_err(|e| DbmxError::config(format!("Invalid settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check field ranges.
    pub fn validate(&self) -> DbmxResult<()> {
        if self.table_row_limit == 0 || self.table_row_limit > MAX_TABLE_ROW_LIMIT {
            return Err(DbmxError::config(format!(
                "table_row_limit must be between 1 and {MAX_TABLE_ROW_LIMIT}"
            )));
        }
        if self.default_tab_name.trim().is_empty() {
            return Err(DbmxError::config("default_tab_name cannot be empty"));
        }
        Ok(())
    }

    /// Default location of the settings file.
    pub fn default_path() -> PathBuf {
        crate::services::storage::default_data_dir().join("settings.json")
    }
}
