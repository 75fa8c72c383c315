//! Application configuration management.
//!
//! Settings are layered, later layers winning:
//!
//! 1. built-in defaults
//! 2. a TOML file (`/etc/oxibridge/config.toml` on Linux)
//! 3. the environment variables of earlier deployments
//!    (`BLE_ADDRESS`, `INFLUXDB_URL`, `INFLUXDB_TOKEN`, ...)
//! 4. `OXIBRIDGE_<SECTION>__<KEY>` environment variables
//!
//! Command-line flags are applied on top by the daemon.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::influx::InfluxSettings;
use crate::link::AddressKind;
use crate::sink::RetryPolicy;

/// Prefix of the structured environment overrides.
pub const ENV_PREFIX: &str = "OXIBRIDGE";

/// Environment variables understood for compatibility, mapped to the
/// structured key they set.
const LEGACY_ENV: [(&str, &str); 6] = [
    ("BLE_ADDRESS", "DEVICE__ADDRESS"),
    ("INFLUXDB_URL", "SINK__URL"),
    ("INFLUXDB_TOKEN", "SINK__TOKEN"),
    ("INFLUXDB_TOKEN_FILE", "SINK__TOKEN_FILE"),
    ("INFLUXDB_ORG", "SINK__ORG"),
    ("INFLUXDB_BUCKET", "SINK__BUCKET"),
];

/// Longest allowed notification wait, keeping shutdown latency bounded.
const MAX_POLL_TIMEOUT_MS: u64 = 2_000;

static MAC_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").expect("MAC address regex is valid")
});

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration source could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// The token file could not be read.
    #[error("failed to read token file {}: {source}", .path.display())]
    TokenFile {
        /// Path of the token file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// No sink token was configured.
    #[error("no sink token configured: set INFLUXDB_TOKEN, INFLUXDB_TOKEN_FILE or sink.token")]
    MissingCredential,

    /// A single field failed validation.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted path of the field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields failed validation.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// When to repeat the handshake writes on a live link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RearmPolicy {
    /// Only right after connecting.
    Once,
    /// After every read period. The streaming command requests one round of
    /// readings, so most devices need it repeated.
    #[default]
    EveryCycle,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The oximeter to connect to.
    pub device: DeviceConfig,
    /// Session timing and recovery policy.
    pub session: SessionConfig,
    /// Time-series sink.
    pub sink: SinkConfig,
    /// Status HTTP surface.
    pub status: StatusConfig,
}

/// Oximeter identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Bluetooth address, `XX:XX:XX:XX:XX:XX`.
    pub address: String,
    /// Addressing mode of the device.
    pub address_type: AddressKind,
    /// Local adapter to use, e.g. `hci0`. Uses the default adapter if unset.
    pub adapter: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: "DE:C7:8C:52:03:93".to_string(),
            address_type: AddressKind::Random,
            adapter: None,
        }
    }
}

/// Timing and recovery knobs of the session state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds between reads.
    pub read_period_secs: u64,
    /// Milliseconds to wait for each notification.
    pub poll_timeout_ms: u64,
    /// Seconds allowed for establishing the link.
    pub connect_timeout_secs: u64,
    /// Seconds to wait after the peer dropped the link.
    pub reconnect_delay_secs: u64,
    /// First delay after a connect failure, in seconds.
    pub backoff_floor_secs: u64,
    /// Largest delay after repeated connect failures, in seconds.
    pub backoff_ceiling_secs: u64,
    /// Seconds of unproductive notifications before disconnecting.
    pub inactivity_timeout_secs: u64,
    /// Seconds to stay away after an inactivity disconnect.
    pub inactivity_resume_delay_secs: u64,
    /// Identical streaming errors tolerated before reconnecting.
    pub max_repeated_errors: u32,
    /// Handshake repetition policy.
    pub rearm: RearmPolicy,
    /// Samples buffered between the session and the sink writer.
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_period_secs: 2,
            poll_timeout_ms: 1_000,
            connect_timeout_secs: 10,
            reconnect_delay_secs: 1,
            backoff_floor_secs: 1,
            backoff_ceiling_secs: 60,
            inactivity_timeout_secs: 300,
            inactivity_resume_delay_secs: 130,
            max_repeated_errors: 5,
            rearm: RearmPolicy::EveryCycle,
            queue_capacity: 32,
        }
    }
}

impl SessionConfig {
    /// Interval between reads.
    #[must_use]
    pub const fn read_period(&self) -> Duration {
        Duration::from_secs(self.read_period_secs)
    }

    /// Notification wait per cycle.
    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Bound on a single connect attempt.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Fixed delay after a transport loss.
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Smallest connect-failure delay.
    #[must_use]
    pub const fn backoff_floor(&self) -> Duration {
        Duration::from_secs(self.backoff_floor_secs)
    }

    /// Largest connect-failure delay.
    #[must_use]
    pub const fn backoff_ceiling(&self) -> Duration {
        Duration::from_secs(self.backoff_ceiling_secs)
    }

    /// Unproductive time before an inactivity disconnect.
    #[must_use]
    pub const fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    /// Delay after an inactivity disconnect.
    #[must_use]
    pub const fn inactivity_resume_delay(&self) -> Duration {
        Duration::from_secs(self.inactivity_resume_delay_secs)
    }
}

/// InfluxDB v2 connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Server URL.
    pub url: String,
    /// API token. Takes precedence over `token_file`.
    pub token: Option<String>,
    /// File holding the API token.
    pub token_file: Option<PathBuf>,
    /// Organization.
    pub org: String,
    /// Bucket.
    pub bucket: String,
    /// Measurement name.
    pub measurement: String,
    /// Value of the `host` tag.
    pub host_tag: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Retries after a retryable write failure.
    pub max_retries: u32,
    /// Pause between retries, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            token: None,
            token_file: None,
            org: "chromebook".to_string(),
            bucket: "health_data".to_string(),
            measurement: "Health".to_string(),
            host_tag: "user".to_string(),
            timeout_secs: 5,
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

impl SinkConfig {
    /// Retry budget for writes.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    /// The API token, read from `token` or `token_file`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::TokenFile`] if the file cannot be read and
    /// [`ConfigError::MissingCredential`] if neither source yields a token.
    pub fn resolve_token(&self) -> ConfigResult<String> {
        if let Some(token) = self.token.as_deref().map(str::trim) {
            if !token.is_empty() {
                return Ok(token.to_string());
            }
        }
        if let Some(path) = &self.token_file {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::TokenFile {
                path: path.clone(),
                source,
            })?;
            let token = content.trim();
            if !token.is_empty() {
                return Ok(token.to_string());
            }
        }
        Err(ConfigError::MissingCredential)
    }

    /// Connection settings for [`crate::influx::InfluxSink`].
    #[must_use]
    pub fn influx_settings(&self, token: String) -> InfluxSettings {
        InfluxSettings {
            url: self.url.clone(),
            token,
            org: self.org.clone(),
            bucket: self.bucket.clone(),
            measurement: self.measurement.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Status HTTP surface settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Whether to serve the status endpoints.
    pub enabled: bool,
    /// Listen address.
    pub bind: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:3030".to_string(),
        }
    }
}

impl StatusConfig {
    /// Parsed listen address.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `bind` is not a socket address.
    pub fn socket_addr(&self) -> ConfigResult<SocketAddr> {
        self.bind.parse().map_err(|_| ConfigError::ValidationError {
            field: "status.bind".to_string(),
            message: format!("'{}' is not a socket address", self.bind),
        })
    }
}

impl Config {
    /// Load configuration from `path` (or the default location) and the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly given file is missing or any source
    /// fails to parse.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::load_from(path, &env)
    }

    /// Load configuration using `env` in place of the process environment.
    ///
    /// # Errors
    ///
    /// See [`Config::load`].
    pub fn load_from(path: Option<&Path>, env: &HashMap<String, String>) -> ConfigResult<Self> {
        let file = path.map_or_else(default_config_path, Path::to_path_buf);

        let legacy: config::Map<String, String> = LEGACY_ENV
            .iter()
            .filter_map(|(name, key)| {
                env.get(*name)
                    .map(|value| (format!("{ENV_PREFIX}_{key}"), value.clone()))
            })
            .collect();
        let structured: config::Map<String, String> = env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(
                config::File::from(file)
                    .format(config::FileFormat::Toml)
                    .required(path.is_some()),
            )
            .add_source(environment(legacy))
            .add_source(environment(structured))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Check every field, reporting all problems at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a single problem and
    /// [`ConfigError::MultipleValidationErrors`] for several.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, field: &str, message: String| {
            if !ok {
                errors.push(ConfigError::ValidationError {
                    field: field.to_string(),
                    message,
                });
            }
        };

        check(
            is_valid_mac_address(&self.device.address),
            "device.address",
            format!("'{}' is not a XX:XX:XX:XX:XX:XX address", self.device.address),
        );

        let s = &self.session;
        check(s.read_period_secs > 0, "session.read_period_secs", "must be positive".into());
        check(
            (1..=MAX_POLL_TIMEOUT_MS).contains(&s.poll_timeout_ms),
            "session.poll_timeout_ms",
            format!("must be between 1 and {MAX_POLL_TIMEOUT_MS}"),
        );
        check(
            s.connect_timeout_secs > 0,
            "session.connect_timeout_secs",
            "must be positive".into(),
        );
        check(
            s.backoff_floor_secs > 0,
            "session.backoff_floor_secs",
            "must be positive".into(),
        );
        check(
            s.backoff_floor_secs <= s.backoff_ceiling_secs,
            "session.backoff_ceiling_secs",
            "must not be below backoff_floor_secs".into(),
        );
        check(
            s.inactivity_timeout_secs > 0,
            "session.inactivity_timeout_secs",
            "must be positive".into(),
        );
        check(
            s.max_repeated_errors > 0,
            "session.max_repeated_errors",
            "must be positive".into(),
        );
        check(s.queue_capacity > 0, "session.queue_capacity", "must be positive".into());

        let k = &self.sink;
        check(
            url::Url::parse(&k.url).is_ok(),
            "sink.url",
            format!("'{}' is not a valid URL", k.url),
        );
        for (field, value) in [
            ("sink.org", &k.org),
            ("sink.bucket", &k.bucket),
            ("sink.measurement", &k.measurement),
            ("sink.host_tag", &k.host_tag),
        ] {
            check(!value.trim().is_empty(), field, "must not be empty".into());
        }
        check(k.timeout_secs > 0, "sink.timeout_secs", "must be positive".into());

        if self.status.enabled {
            if let Err(e) = self.status.socket_addr() {
                errors.push(e);
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Render as TOML, e.g. to seed a config file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> std::result::Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn environment(source: config::Map<String, String>) -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .source(Some(source))
}

/// Whether `address` looks like `XX:XX:XX:XX:XX:XX`.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS_RE.is_match(address)
}

/// Default location of the configuration file.
#[must_use]
pub fn default_config_path() -> PathBuf {
    // On the Pi: /etc/oxibridge/config.toml
    // For development: ~/.config/oxibridge/config.toml
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/oxibridge/config.toml")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "oxibridge").map_or_else(
            || PathBuf::from("oxibridge.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }
}
