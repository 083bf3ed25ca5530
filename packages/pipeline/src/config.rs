//! TOML run configuration.
//!
//! A single file describes the feature service, the two filesystem roots
//! (manual and scheduled runs), the working store and the control files.
//! Relative paths resolve against the root of the selected [`Mode`].
//! Credentials never live in the file; they come from
//! [`USERNAME_ENV`] and [`PASSWORD_ENV`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use damage_assessment_feature_service::{
    arcgis::ArcGisConfig, extract::ExtractOptions, retry::RetryPolicy, token::Credentials,
};
use damage_assessment_reconcile::DEFAULT_HEADER_ROWS;
use damage_assessment_report_models::is_sql_identifier;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

pub const USERNAME_ENV: &str = "DA_ARCGIS_USERNAME";
pub const PASSWORD_ENV: &str = "DA_ARCGIS_PASSWORD";

/// Errors raised while loading or checking configuration. All of them occur
/// before anything is downloaded or written.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Toml(#[from] toml::de::Error),

    /// A required environment variable is unset or empty.
    #[error("Environment variable {0} is not set")]
    MissingEnv(&'static str),

    /// A value parsed but cannot be used.
    #[error("Invalid config value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Who started the run. Selects the filesystem root.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Mode {
    /// Started by a person at a terminal.
    #[default]
    Manual,
    /// Started by the task scheduler.
    Scheduled,
}

// ── Sections ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub feature_service: FeatureServiceSection,
    pub paths: PathsSection,
    pub store: StoreSection,
    #[serde(default)]
    pub control_files: ControlFilesSection,
    #[serde(default)]
    pub qa: QaSection,
    #[serde(default)]
    pub field_sync: FieldSyncSection,
}

/// Where the damage reports live and how hard to hit the service.
#[derive(Debug, Clone, Deserialize)]
pub struct FeatureServiceSection {
    /// `FeatureServer` URL.
    pub service_url: String,
    #[serde(default)]
    pub layer: u32,
    #[serde(default = "default_object_id_field")]
    pub object_id_field: String,
    /// Portal `generateToken` endpoint. When unset the service is queried
    /// anonymously and no credentials are needed.
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default = "default_referer")]
    pub referer: String,
    /// Overrides the layer's `maxRecordCount`.
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_token_expiration_minutes")]
    pub token_expiration_minutes: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub manual_root: PathBuf,
    pub scheduled_root: PathBuf,
    /// Folder holding the `SUCCESS_`/`ERROR_` marker files. Recreated on
    /// every run.
    #[serde(default = "default_marker_folder")]
    pub marker_folder: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// Working `DuckDB` file holding the snapshot tables.
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Production table name. The backup is `<name>_BAK`.
    pub snapshot_name: String,
    /// `DuckDB` file holding the reference parcels.
    pub parcel_database: PathBuf,
    #[serde(default = "default_parcel_table")]
    pub parcel_table: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlFilesSection {
    /// Report number to APN override list.
    #[serde(default)]
    pub override_csv: Option<PathBuf>,
    #[serde(default = "default_override_header_rows")]
    pub override_header_rows: usize,
    #[serde(default)]
    pub fields_to_add: Option<PathBuf>,
    #[serde(default)]
    pub fields_to_calculate: Option<PathBuf>,
}

impl Default for ControlFilesSection {
    fn default() -> Self {
        Self {
            override_csv: None,
            override_header_rows: DEFAULT_HEADER_ROWS,
            fields_to_add: None,
            fields_to_calculate: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QaSection {
    #[serde(default = "default_report_folder")]
    pub report_folder: PathBuf,
}

impl Default for QaSection {
    fn default() -> Self {
        Self {
            report_folder: default_report_folder(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldSyncSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for FieldSyncSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_object_id_field() -> String {
    "OBJECTID".to_string()
}

fn default_referer() -> String {
    "https://www.arcgis.com".to_string()
}

const fn default_workers() -> usize {
    4
}

const fn default_timeout_secs() -> u64 {
    60
}

const fn default_max_retries() -> u32 {
    5
}

const fn default_token_expiration_minutes() -> u32 {
    60
}

fn default_marker_folder() -> PathBuf {
    PathBuf::from("Control_Files/Success_Error")
}

fn default_database() -> PathBuf {
    PathBuf::from("damage_assessment.duckdb")
}

fn default_parcel_table() -> String {
    "parcels".to_string()
}

const fn default_override_header_rows() -> usize {
    DEFAULT_HEADER_ROWS
}

fn default_report_folder() -> PathBuf {
    PathBuf::from("QA_QC")
}

const fn default_true() -> bool {
    true
}

// ── Resolved paths ───────────────────────────────────────────────────────

/// Every path a run touches, made absolute against the mode's root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub root: PathBuf,
    pub database: PathBuf,
    pub parcel_database: PathBuf,
    pub override_csv: Option<PathBuf>,
    pub fields_to_add: Option<PathBuf>,
    pub fields_to_calculate: Option<PathBuf>,
    pub qa_folder: PathBuf,
    pub marker_folder: PathBuf,
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

impl PipelineConfig {
    /// Reads and checks a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, does not parse,
    /// or holds an unusable value.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parses and checks a config document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the TOML is malformed, misses required
    /// keys, or holds an unusable value.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::de::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.feature_service.service_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "feature_service.service_url",
                message: "must not be empty".to_string(),
            });
        }
        if self.feature_service.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "feature_service.workers",
                message: "must be at least 1".to_string(),
            });
        }
        if self.feature_service.page_size == Some(0) {
            return Err(ConfigError::Invalid {
                key: "feature_service.page_size",
                message: "must be at least 1".to_string(),
            });
        }
        if !is_sql_identifier(&self.store.snapshot_name) {
            return Err(ConfigError::Invalid {
                key: "store.snapshot_name",
                message: format!("'{}' is not a plain identifier", self.store.snapshot_name),
            });
        }
        if !is_sql_identifier(&self.store.parcel_table) {
            return Err(ConfigError::Invalid {
                key: "store.parcel_table",
                message: format!("'{}' is not a plain identifier", self.store.parcel_table),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn root(&self, mode: Mode) -> &Path {
        match mode {
            Mode::Manual => &self.paths.manual_root,
            Mode::Scheduled => &self.paths.scheduled_root,
        }
    }

    #[must_use]
    pub fn paths(&self, mode: Mode) -> RunPaths {
        let root = self.root(mode);
        let control = &self.control_files;
        RunPaths {
            root: root.to_path_buf(),
            database: resolve(root, &self.store.database),
            parcel_database: resolve(root, &self.store.parcel_database),
            override_csv: control.override_csv.as_deref().map(|p| resolve(root, p)),
            fields_to_add: control.fields_to_add.as_deref().map(|p| resolve(root, p)),
            fields_to_calculate: control
                .fields_to_calculate
                .as_deref()
                .map(|p| resolve(root, p)),
            qa_folder: resolve(root, &self.qa.report_folder),
            marker_folder: resolve(root, &self.paths.marker_folder),
        }
    }

    #[must_use]
    pub fn arcgis_config(&self) -> ArcGisConfig {
        let fs = &self.feature_service;
        ArcGisConfig {
            service_url: fs.service_url.clone(),
            layer: fs.layer,
            object_id_field: fs.object_id_field.clone(),
            token_url: fs.token_url.clone().unwrap_or_default(),
            referer: fs.referer.clone(),
            token_expiration_minutes: fs.token_expiration_minutes,
            timeout: Duration::from_secs(fs.timeout_secs),
            retry: RetryPolicy {
                max_retries: fs.max_retries,
                ..RetryPolicy::default()
            },
        }
    }

    #[must_use]
    pub const fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            workers: self.feature_service.workers,
            page_size_override: self.feature_service.page_size,
        }
    }

    /// Reads credentials from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnv`] if a token endpoint is configured
    /// but a credential variable is unset.
    pub fn credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        self.credentials_from(|key| std::env::var(key).ok())
    }

    /// Like [`Self::credentials`], with a custom variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnv`] if a token endpoint is configured
    /// but a credential variable is unset or empty.
    pub fn credentials_from(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Credentials>, ConfigError> {
        if self.feature_service.token_url.is_none() {
            return Ok(None);
        }
        let get = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingEnv(key))
        };
        Ok(Some(Credentials {
            username: get(USERNAME_ENV)?,
            password: get(PASSWORD_ENV)?,
        }))
    }
}
