//! Application boot configuration.
//!
//! # Responsibility
//! - Parse the JSON application config (platform camelCase keys).
//! - Validate it before any registry is touched.
//!
//! # Invariants
//! - Every field has a default, so `{}` is a valid config.
//! - Unknown keys are ignored.

use crate::extension::loader::VersionPolicy;
use crate::logging::{default_log_level, normalize_level};
use crate::runtime::data_sources::{
    parse_namespace, validate_source_name, DataSourceConfig, DataSourceError,
};
use crate::runtime::hotkeys::{HotkeyBinding, HotkeyError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

const DEFAULT_MAX_CONCURRENT_WORKERS: usize = 3;

/// Root application config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub router_basename: String,
    pub data_sources: Vec<DataSourceConfig>,
    pub default_data_source_name: Option<String>,
    /// Global hotkeys bound at boot in their declared contexts.
    pub hotkeys: Vec<HotkeyBinding>,
    /// Global-scope customizations keyed by customization id.
    pub customization_service: Value,
    #[serde(alias = "maxNumberOfWebWorkers")]
    pub max_concurrent_workers: usize,
    pub version_policy: VersionPolicy,
    pub show_study_list: bool,
    pub group_enabled_modes_first: bool,
    /// Per-extension configuration exposed to factories.
    pub extension_config: BTreeMap<String, Value>,
    pub max_num_requests: MaxNumRequests,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            router_basename: "/".to_string(),
            data_sources: Vec::new(),
            default_data_source_name: None,
            hotkeys: Vec::new(),
            customization_service: Value::Null,
            max_concurrent_workers: DEFAULT_MAX_CONCURRENT_WORKERS,
            version_policy: VersionPolicy::default(),
            show_study_list: true,
            group_enabled_modes_first: false,
            extension_config: BTreeMap::new(),
            max_num_requests: MaxNumRequests::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Request concurrency limits handed to retrieval collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxNumRequests {
    pub interaction: u32,
    pub thumbnail: u32,
    pub prefetch: u32,
}

impl Default for MaxNumRequests {
    fn default() -> Self {
        Self {
            interaction: 100,
            thumbnail: 75,
            prefetch: 25,
        }
    }
}

/// File logging settings; `dir` unset means no file logger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level().to_string(),
            dir: None,
        }
    }
}

impl AppConfig {
    /// Parses a JSON config. Does not validate.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(ConfigError::Parse)
    }

    /// Reads and parses a JSON config file. Does not validate.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|cause| ConfigError::Io {
            path: path.to_path_buf(),
            cause,
        })?;
        Self::from_json_str(&raw)
    }

    /// Checks cross-field rules; returns the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.router_basename.starts_with('/') {
            return Err(ConfigError::InvalidRouterBasename(
                self.router_basename.clone(),
            ));
        }
        if self.max_concurrent_workers == 0 {
            return Err(ConfigError::InvalidWorkerCount);
        }
        for (kind, limit) in [
            ("interaction", self.max_num_requests.interaction),
            ("thumbnail", self.max_num_requests.thumbnail),
            ("prefetch", self.max_num_requests.prefetch),
        ] {
            if limit == 0 {
                return Err(ConfigError::InvalidRequestLimit(kind));
            }
        }

        let mut source_names = BTreeSet::new();
        for source in &self.data_sources {
            parse_namespace(&source.namespace)
                .and_then(|_| validate_source_name(&source.source_name))
                .map_err(|cause| ConfigError::InvalidDataSource {
                    source_name: source.source_name.clone(),
                    cause,
                })?;
            if !source_names.insert(source.source_name.trim()) {
                return Err(ConfigError::DuplicateDataSource(source.source_name.clone()));
            }
        }
        if let Some(default_name) = self.default_data_source_name.as_deref() {
            if !self.data_sources.is_empty() && !source_names.contains(default_name.trim()) {
                return Err(ConfigError::UnknownDefaultDataSource(
                    default_name.to_string(),
                ));
            }
        }

        for binding in &self.hotkeys {
            binding
                .normalized()
                .map_err(|cause| ConfigError::InvalidHotkey {
                    command: binding.command_name.clone(),
                    cause,
                })?;
        }
        if !(self.customization_service.is_null() || self.customization_service.is_object()) {
            return Err(ConfigError::InvalidCustomizations);
        }
        normalize_level(&self.logging.level)
            .map_err(|err| ConfigError::InvalidLogging(err.to_string()))?;
        Ok(())
    }
}

/// Config load and validation errors.
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        cause: std::io::Error,
    },
    Parse(serde_json::Error),
    InvalidRouterBasename(String),
    InvalidWorkerCount,
    InvalidRequestLimit(&'static str),
    InvalidDataSource {
        source_name: String,
        cause: DataSourceError,
    },
    DuplicateDataSource(String),
    UnknownDefaultDataSource(String),
    InvalidHotkey {
        command: String,
        cause: HotkeyError,
    },
    InvalidCustomizations,
    InvalidLogging(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, cause } => {
                write!(f, "failed to read config `{}`: {cause}", path.display())
            }
            Self::Parse(cause) => write!(f, "config is not valid JSON: {cause}"),
            Self::InvalidRouterBasename(value) => {
                write!(f, "routerBasename must start with `/`: {value}")
            }
            Self::InvalidWorkerCount => write!(f, "maxConcurrentWorkers must be at least 1"),
            Self::InvalidRequestLimit(kind) => {
                write!(f, "maxNumRequests.{kind} must be at least 1")
            }
            Self::InvalidDataSource { source_name, cause } => {
                write!(f, "data source `{source_name}` is invalid: {cause}")
            }
            Self::DuplicateDataSource(name) => write!(f, "duplicate data source: {name}"),
            Self::UnknownDefaultDataSource(name) => {
                write!(f, "defaultDataSourceName names no configured data source: {name}")
            }
            Self::InvalidHotkey { command, cause } => {
                write!(f, "hotkey for `{command}` is invalid: {cause}")
            }
            Self::InvalidCustomizations => {
                write!(f, "customizationService must be an object")
            }
            Self::InvalidLogging(message) => write!(f, "logging config is invalid: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { cause, .. } => Some(cause),
            Self::Parse(cause) => Some(cause),
            Self::InvalidDataSource { cause, .. } => Some(cause),
            Self::InvalidHotkey { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}
