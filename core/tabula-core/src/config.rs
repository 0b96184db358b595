//! Runtime configuration.
//!
//! Defaults are usable as-is; values can be overridden in code, from
//! `TABULA_*` environment variables, or from a JSON file.

use crate::error::{TabulaError, TabulaResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// Tunables shared by every transaction opened from one [`crate::Database`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TabulaConfig {
    /// Maximum number of entities kept in a transaction chain's identity cache
    pub identity_cache_capacity: usize,
    /// Savepoint names are `<prefix>_<sequence>`
    pub savepoint_prefix: String,
    /// Rows requested per cursor round trip by lazy streams
    pub stream_fetch_size: usize,
    /// Log parameter values next to statements (errors always carry them)
    pub log_parameters: bool,
}

impl Default for TabulaConfig {
    fn default() -> Self {
        Self {
            identity_cache_capacity: 1024,
            savepoint_prefix: "tabula_sp".to_string(),
            stream_fetch_size: 256,
            log_parameters: false,
        }
    }
}

impl TabulaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity_cache_capacity(mut self, capacity: usize) -> Self {
        self.identity_cache_capacity = capacity;
        self
    }

    pub fn with_savepoint_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.savepoint_prefix = prefix.into();
        self
    }

    pub fn with_stream_fetch_size(mut self, size: usize) -> Self {
        self.stream_fetch_size = size;
        self
    }

    pub fn with_log_parameters(mut self, enabled: bool) -> Self {
        self.log_parameters = enabled;
        self
    }

    /// Overrides fields from `TABULA_*` environment variables.
    ///
    /// Recognized: `TABULA_IDENTITY_CACHE_CAPACITY`, `TABULA_SAVEPOINT_PREFIX`,
    /// `TABULA_STREAM_FETCH_SIZE`, `TABULA_LOG_PARAMETERS`.
    pub fn load_from_env(mut self) -> TabulaResult<Self> {
        if let Ok(value) = env::var("TABULA_IDENTITY_CACHE_CAPACITY") {
            self.identity_cache_capacity = parse_usize("TABULA_IDENTITY_CACHE_CAPACITY", &value)?;
        }
        if let Ok(value) = env::var("TABULA_SAVEPOINT_PREFIX") {
            self.savepoint_prefix = value;
        }
        if let Ok(value) = env::var("TABULA_STREAM_FETCH_SIZE") {
            self.stream_fetch_size = parse_usize("TABULA_STREAM_FETCH_SIZE", &value)?;
        }
        if let Ok(value) = env::var("TABULA_LOG_PARAMETERS") {
            self.log_parameters = value.to_lowercase() == "true" || value == "1";
        }
        self.validate()?;
        Ok(self)
    }

    /// Reads a JSON document; missing fields keep their defaults.
    pub fn load_from_file(path: &Path) -> TabulaResult<Self> {
        let json = fs::read_to_string(path)?;
        let config: TabulaConfig = serde_json::from_str(&json)
            .map_err(|e| TabulaError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> TabulaResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> TabulaResult<()> {
        if self.identity_cache_capacity == 0 {
            return Err(TabulaError::Config(
                "identity_cache_capacity must be > 0".to_string(),
            ));
        }
        if self.stream_fetch_size == 0 {
            return Err(TabulaError::Config(
                "stream_fetch_size must be > 0".to_string(),
            ));
        }
        let valid_prefix = !self.savepoint_prefix.is_empty()
            && self
                .savepoint_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_prefix {
            return Err(TabulaError::Config(format!(
                "savepoint_prefix '{}' must be a non-empty SQL identifier",
                self.savepoint_prefix
            )));
        }
        Ok(())
    }
}

fn parse_usize(var: &str, value: &str) -> TabulaResult<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| TabulaError::Config(format!("{var}: '{value}' is not a positive integer")))
}
