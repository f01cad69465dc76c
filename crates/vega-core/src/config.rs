//! Configuration management.
//!
//! Two layers:
//! - [`VegaConfig`]: process settings (server bind address, data directory) and
//!   pipeline tuning ([`PipelineConfig`]), loaded from TOML with `VEGA__*`
//!   environment overrides.
//! - [`DeviceConfig`]: one configured detector. Device configs live in a
//!   [`crate::storage::DeviceStore`], not in the config file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::backoff::ReconnectBackoff;
use crate::poll::PollPolicy;

/// Environment variable prefix for overrides (`VEGA__PIPELINE__POLL_INTERVAL_MS`).
pub const ENV_PREFIX: &str = "VEGA";

/// Colour assigned to devices created without one.
pub const DEFAULT_DEVICE_COLOR: &str = "#4CAF50";

/// Longest accepted device name.
pub const MAX_NAME_LENGTH: usize = 64;

static MAC_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("valid regex"));

static HEX_COLOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#[0-9A-Fa-f]{6}$").expect("valid regex"));

/// Returns `true` for a colon-separated 48-bit address (`AA:BB:CC:DD:EE:FF`).
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS.is_match(address)
}

/// Returns `true` for a `#RRGGBB` colour.
#[must_use]
pub fn is_valid_color(color: &str) -> bool {
    HEX_COLOR.is_match(color)
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested config file does not exist.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Reading the file failed.
    #[error("Failed to read {path}: {source}")]
    ReadError {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Writing the file failed.
    #[error("Failed to write {path}: {source}")]
    WriteError {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Layered sources could not be merged or deserialized.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// The configuration could not be rendered as TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// One field holds an unusable value.
    #[error("Invalid {field}: {message}")]
    ValidationError {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields are invalid.
    #[error("{}", join_errors(.0))]
    MultipleValidationErrors(Vec<ConfigError>),
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field,
        message: message.into(),
    }
}

fn collect(errors: Vec<ConfigError>) -> ConfigResult<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.into_iter().next().unwrap_or_else(|| invalid("config", "unknown"))),
        _ => Err(ConfigError::MultipleValidationErrors(errors)),
    }
}

// ============================================================================
// Process configuration
// ============================================================================

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VegaConfig {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Connection and polling tuning.
    pub pipeline: PipelineConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind_address: String,
    /// JSON logs to rolling files instead of pretty stdout.
    pub production: bool,
    /// Where the device list is stored. Platform default when unset.
    pub data_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            production: false,
            data_dir: None,
        }
    }
}

/// Connection and polling tuning shared by every device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Delay between poll round trips. Clamped to 250 ms ..= 60 s.
    pub poll_interval_ms: u64,
    /// Consecutive failed polls before reconnecting.
    pub failure_threshold: u32,
    /// Seconds without a reading before reconnecting.
    pub staleness_timeout_secs: u64,
    /// Backoff unit.
    pub backoff_base_ms: u64,
    /// Backoff cap.
    pub backoff_max_ms: u64,
    /// Bound on transport connect plus link setup.
    pub connect_timeout_ms: u64,
    /// Bound on the initialization handshake.
    pub init_timeout_ms: u64,
    /// Bound on one telemetry round trip.
    pub read_timeout_ms: u64,
    /// Pause between tearing down a session and opening the next.
    pub settle_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            failure_threshold: 3,
            staleness_timeout_secs: 30,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            connect_timeout_ms: 15_000,
            init_timeout_ms: 10_000,
            read_timeout_ms: 5_000,
            settle_delay_ms: 500,
        }
    }
}

impl PipelineConfig {
    /// Poll policy derived from these settings.
    #[must_use]
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.poll_interval_ms),
            self.failure_threshold,
            Duration::from_secs(self.staleness_timeout_secs),
        )
    }

    /// Fresh backoff state derived from these settings.
    #[must_use]
    pub fn backoff(&self) -> ReconnectBackoff {
        ReconnectBackoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    /// Connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Initialization timeout.
    #[must_use]
    pub const fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    /// Read timeout.
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Settle delay.
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Checks value ranges. The poll interval is clamped rather than rejected.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ValidationError`] or
    /// [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        if self.failure_threshold == 0 {
            errors.push(invalid("pipeline.failure_threshold", "must be at least 1"));
        }
        if self.staleness_timeout_secs == 0 {
            errors.push(invalid("pipeline.staleness_timeout_secs", "must be positive"));
        } else {
            // otherwise a single missed poll trips the staleness check first
            let streak = self.poll_policy().interval() * self.failure_threshold;
            if Duration::from_secs(self.staleness_timeout_secs) <= streak {
                errors.push(invalid(
                    "pipeline.staleness_timeout_secs",
                    format!(
                        "must exceed failure_threshold polls ({}ms)",
                        streak.as_millis()
                    ),
                ));
            }
        }
        if self.backoff_base_ms == 0 {
            errors.push(invalid("pipeline.backoff_base_ms", "must be positive"));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            errors.push(invalid(
                "pipeline.backoff_max_ms",
                format!("must be at least backoff_base_ms ({})", self.backoff_base_ms),
            ));
        }
        for (field, value) in [
            ("pipeline.connect_timeout_ms", self.connect_timeout_ms),
            ("pipeline.init_timeout_ms", self.init_timeout_ms),
            ("pipeline.read_timeout_ms", self.read_timeout_ms),
        ] {
            if value == 0 {
                errors.push(invalid(field, "must be positive"));
            }
        }
        collect(errors)
    }
}

impl VegaConfig {
    /// Loads defaults, then `path` (or the default config file), then
    /// `VEGA__*` environment variables, and validates the result.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NotFound`] if an explicit `path` is missing, a parse
    /// error from the layered sources, or a validation error.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let (file, required) = match path {
            Some(p) if !p.exists() => return Err(ConfigError::NotFound(p.display().to_string())),
            Some(p) => (p.to_path_buf(), true),
            None => (config_path()?, false),
        };

        let config: Self = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(file).required(required))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration to `path` as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.display().to_string(),
            source,
        })
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// All problems found, combined.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(invalid(
                "server.bind_address",
                format!("'{}' is not a socket address", self.server.bind_address),
            ));
        }
        match self.pipeline.validate() {
            Ok(()) => {}
            Err(ConfigError::MultipleValidationErrors(inner)) => errors.extend(inner),
            Err(e) => errors.push(e),
        }
        collect(errors)
    }

    /// Data directory, falling back to the platform default.
    ///
    /// # Errors
    ///
    /// Returns an error if no default can be determined.
    pub fn data_dir(&self) -> ConfigResult<PathBuf> {
        match &self.server.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => crate::storage::default_data_dir()
                .map_err(|e| invalid("server.data_dir", e.to_string())),
        }
    }
}

/// Default configuration file path.
///
/// On Linux: `/etc/vega/config.toml`.
/// Elsewhere: the platform config directory.
///
/// # Errors
///
/// Returns an error if the platform config directory cannot be determined.
pub fn config_path() -> ConfigResult<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/vega/config.toml"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let dirs = directories::ProjectDirs::from("", "", "vega")
            .ok_or_else(|| invalid("config_path", "cannot determine config directory"))?;
        Ok(dirs.config_dir().join("config.toml"))
    }
}

// ============================================================================
// Device configuration
// ============================================================================

/// Stable identifier of a configured device.
pub type DeviceId = Uuid;

/// One configured detector. Replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "id": "01936b2e-8f4a-7c3e-9d2f-1a2b3c4d5e6f",
    "address": "52:43:06:60:12:34",
    "name": "RC-103 kitchen",
    "enabled": true,
    "color": "#4CAF50",
    "created_at": "2025-01-15T10:30:00Z"
}))]
pub struct DeviceConfig {
    /// Stable id.
    #[schema(value_type = Uuid)]
    pub id: DeviceId,
    /// Link-layer address.
    #[schema(example = "52:43:06:60:12:34")]
    pub address: String,
    /// Display name.
    pub name: String,
    /// Whether the device should be kept connected.
    pub enabled: bool,
    /// Display colour, `#RRGGBB`.
    pub color: String,
    /// When the device was added.
    pub created_at: DateTime<Utc>,
}

impl DeviceConfig {
    /// Creates an enabled device with a fresh time-ordered id.
    #[must_use]
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            address: normalize_address(&address.into()),
            name: name.into(),
            enabled: true,
            color: DEFAULT_DEVICE_COLOR.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Copy with a different `enabled` flag.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Copy with a different name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Copy with a different colour.
    #[must_use]
    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    /// Copy with a different address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = normalize_address(&address.into());
        self
    }

    /// Whether the address is usable for connecting.
    #[must_use]
    pub fn has_valid_address(&self) -> bool {
        is_valid_mac_address(&self.address)
    }

    /// Checks the user-facing fields. The address is not checked here: a
    /// device with a malformed address is accepted and parked in the error
    /// state by its state machine.
    ///
    /// # Errors
    ///
    /// All problems found, combined.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let name = self.name.trim();
        if name.is_empty() {
            errors.push(invalid("name", "must not be empty"));
        } else if name.chars().count() > MAX_NAME_LENGTH {
            errors.push(invalid(
                "name",
                format!("must be at most {MAX_NAME_LENGTH} characters"),
            ));
        }
        if !is_valid_color(&self.color) {
            errors.push(invalid("color", format!("'{}' is not #RRGGBB", self.color)));
        }
        collect(errors)
    }

    /// Whether changing from `self` to `next` requires a new session.
    #[must_use]
    pub fn needs_reconnect(&self, next: &Self) -> bool {
        self.address != next.address
    }
}

fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}
