//! Configuration Loader
//!
//! Layers defaults, an optional TOML file and `TASKER__` environment overrides
//! with the `config` crate, then validates the result.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{Config, Environment, File, FileFormat};
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::TaskerQueueConfig;
use crate::constants::defaults;

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: TaskerQueueConfig,
    source_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load from `TASKER_CONFIG_PATH`, or the default path when that file exists
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        match std::env::var("TASKER_CONFIG_PATH") {
            Ok(path) => Self::load_from_file(Some(PathBuf::from(path))),
            Err(_) => {
                let default_path = PathBuf::from(defaults::CONFIG_PATH);
                if default_path.is_file() {
                    Self::load_from_file(Some(default_path))
                } else {
                    Self::load_from_file(None)
                }
            }
        }
    }

    /// Load from an explicit file (which must exist), or from defaults and
    /// environment alone when `path` is `None`
    pub fn load_from_file(path: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        if let Some(path) = &path {
            if !path.is_file() {
                return Err(ConfigurationError::config_file_not_found(path.clone()));
            }
        }

        let config = Self::build(path.as_deref())?;
        config.validate()?;

        debug!(
            "Configuration loaded: {}",
            serde_json::to_string(&Self::sanitize_for_logging(&config))
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );
        info!(
            backend = %config.transport.backend,
            workers = config.dispatcher.max_concurrent_workers,
            routes = config.routes.len(),
            source = path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "defaults".to_string()),
            "⚙️ CONFIG: Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            source_path: path,
        }))
    }

    /// Wrap an already-built configuration after validating it
    pub fn from_config(config: TaskerQueueConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            source_path: None,
        }))
    }

    pub fn config(&self) -> &TaskerQueueConfig {
        &self.config
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Configuration as JSON with credentials masked
    pub fn sanitized(&self) -> serde_json::Value {
        Self::sanitize_for_logging(&self.config)
    }

    fn build(path: Option<&Path>) -> ConfigResult<TaskerQueueConfig> {
        let defaults = Config::try_from(&TaskerQueueConfig::default())
            .map_err(|e| ConfigurationError::load_error("defaults", e))?;

        let mut builder = Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("TASKER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let source_name = path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "environment".to_string());
        builder
            .build()
            .and_then(|c| c.try_deserialize::<TaskerQueueConfig>())
            .map_err(|e| ConfigurationError::load_error(source_name, e))
    }

    /// Mask credentials embedded in the database URL
    fn sanitize_for_logging(config: &TaskerQueueConfig) -> serde_json::Value {
        let mut value = serde_json::json!(config);
        if let Some(url) = value
            .get_mut("transport")
            .and_then(|t| t.get_mut("database_url"))
        {
            if url.is_string() {
                *url = serde_json::Value::String("[MASKED]".to_string());
            }
        }
        value
    }
}
