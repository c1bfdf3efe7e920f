//! Engine configuration.
//!
//! Stored as TOML at `$XDG_CONFIG_HOME/smart/engine.toml` (or the platform
//! config directory). A missing file means defaults.
//!
//! # Example Configuration
//!
//! ```toml
//! database = "/srv/smart/visits.db"
//! dialect = "sqlite"
//! fact_table = "SMI_Final"
//! funnel_table = "cmec"
//! preview_row_cap = 60
//! max_row_cap = 60
//! facet_ttl_secs = 900
//! data_ttl_secs = 300
//! read_uncommitted = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analytics::{Dialect, EngineOptions, TableName};

/// Environment override for [`EngineConfig::database`].
pub const DATABASE_ENV: &str = "SMART_DATABASE";

/// Errors that can occur when loading engine configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database file holding the fact and funnel tables.
    pub database: Option<PathBuf>,

    pub dialect: Dialect,

    /// `[schema.]table`; defaults per dialect.
    pub fact_table: Option<String>,

    pub funnel_table: Option<String>,

    pub preview_row_cap: usize,

    pub max_row_cap: usize,

    pub facet_ttl_secs: u64,

    pub data_ttl_secs: u64,

    /// Default for the `--dirty-read` flag.
    pub read_uncommitted: bool,

    /// Idle read-only connections kept open.
    pub pool_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: None,
            dialect: Dialect::Sqlite,
            fact_table: None,
            funnel_table: None,
            preview_row_cap: 60,
            max_row_cap: 60,
            facet_ttl_secs: 900,
            data_ttl_secs: 300,
            read_uncommitted: false,
            pool_size: 4,
        }
    }
}

fn default_tables(dialect: Dialect) -> (&'static str, &'static str) {
    match dialect {
        Dialect::SqlServer => ("dbo.SMI_Final", "dbo.cmec"),
        Dialect::Sqlite => ("SMI_Final", "cmec"),
    }
}

impl EngineConfig {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    ///
    /// - Primary: `$XDG_CONFIG_HOME/smart/engine.toml`
    /// - Fallback: platform-specific config dir
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            return Ok(PathBuf::from(xdg_config).join("smart").join("engine.toml"));
        }

        dirs::config_dir()
            .map(|p| p.join("smart").join("engine.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    fn apply_env(&mut self) {
        if let Ok(db) = dotenvy::var(DATABASE_ENV)
            && !db.trim().is_empty()
        {
            self.database = Some(PathBuf::from(db));
        }
    }

    pub fn fact_table(&self) -> Result<TableName, ConfigError> {
        let raw = self
            .fact_table
            .as_deref()
            .unwrap_or(default_tables(self.dialect).0);
        parse_table("fact_table", raw)
    }

    pub fn funnel_table(&self) -> Result<TableName, ConfigError> {
        let raw = self
            .funnel_table
            .as_deref()
            .unwrap_or(default_tables(self.dialect).1);
        parse_table("funnel_table", raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fact_table()?;
        self.funnel_table()?;

        if self.preview_row_cap == 0 || self.max_row_cap == 0 {
            return Err(ConfigError::Validation(
                "Row caps must be at least 1".into(),
            ));
        }
        if self.preview_row_cap > self.max_row_cap {
            return Err(ConfigError::Validation(format!(
                "preview_row_cap ({}) exceeds max_row_cap ({})",
                self.preview_row_cap, self.max_row_cap
            )));
        }
        if self.facet_ttl_secs == 0 || self.data_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "Cache ttls must be greater than zero".into(),
            ));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::Validation(
                "pool_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn engine_options(&self) -> Result<EngineOptions, ConfigError> {
        Ok(EngineOptions {
            fact_table: self.fact_table()?,
            funnel_table: self.funnel_table()?,
            preview_row_cap: self.preview_row_cap,
            max_row_cap: self.max_row_cap,
            facet_ttl: Duration::from_secs(self.facet_ttl_secs),
            data_ttl: Duration::from_secs(self.data_ttl_secs),
        })
    }
}

fn parse_table(field: &str, raw: &str) -> Result<TableName, ConfigError> {
    TableName::parse(raw).ok_or_else(|| {
        ConfigError::Validation(format!(
            "{field} '{raw}' must be an identifier or schema.identifier"
        ))
    })
}
