//! Broker connection and application settings.
//!
//! Settings are layered with the `config` crate, later sources overriding
//! earlier ones:
//!
//! 1. serde defaults on every field
//! 2. a YAML file (`rabbit.yml` unless another path is given)
//! 3. environment variables prefixed `WQ__`, e.g. `WQ__RABBITMQ__HOST=broker`
//!
//! The YAML layout keeps the connection record under a `rabbitmq:` key so
//! files produced by [`render_config_file`] load unchanged.

use crate::error::ConfigError;
use crate::message::{QueueDescriptor, QueueName};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// File loaded when no explicit path is supplied
pub const DEFAULT_CONFIG_FILE: &str = "rabbit.yml";

/// Prefix of environment variables overriding file settings
pub const ENV_PREFIX: &str = "WQ";

/// Variables read when generating a configuration file
pub const DEV_USERNAME: &str = "DEV_USERNAME";
pub const DEV_PASSWORD: &str = "DEV_PASSWORD";
pub const DEV_HOST: &str = "DEV_HOST";
pub const DEV_PORT: &str = "DEV_PORT";
pub const DEV_VHOST: &str = "DEV_VHOST";

/// Virtual host used when none is configured
pub const DEFAULT_VHOST: &str = "/";

// ============================================================================
// Connection Configuration
// ============================================================================

/// Credentials and address of the broker.
///
/// Immutable once loaded. `Debug` never prints the password.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    /// Virtual host, empty for the broker default `/`
    pub vhost: String,
}

impl ConnectionConfig {
    /// AMQP URI with percent-encoded credentials and virtual host
    pub fn amqp_uri(&self) -> String {
        self.render_uri(&urlencoding::encode(&self.password))
    }

    /// AMQP URI safe for logging
    pub fn redacted_uri(&self) -> String {
        self.render_uri("****")
    }

    fn render_uri(&self, password: &str) -> String {
        // An empty path segment names the vhost "", so spell out the default
        let vhost = if self.vhost.is_empty() {
            DEFAULT_VHOST
        } else {
            self.vhost.as_str()
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.username),
            password,
            self.host,
            self.port,
            urlencoding::encode(vhost)
        )
    }

    /// Build a connection record from `DEV_*` variables.
    ///
    /// `lookup` resolves a variable name to its value. `DEV_VHOST` may be
    /// unset; every other variable is required.
    pub fn from_env_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &str| {
            lookup(key).ok_or_else(|| ConfigError::Missing {
                key: key.to_string(),
            })
        };

        let port_text = require(DEV_PORT)?;
        let port = port_text
            .trim()
            .parse::<u16>()
            .map_err(|e| ConfigError::Invalid {
                message: format!("{} '{}' is not a valid port: {}", DEV_PORT, port_text, e),
            })?;

        Ok(Self {
            username: require(DEV_USERNAME)?,
            password: require(DEV_PASSWORD)?,
            host: require(DEV_HOST)?,
            port,
            // An unset vhost means the broker default
            vhost: lookup(DEV_VHOST).unwrap_or_default(),
        })
    }

    /// Build a connection record from the process environment
    pub fn from_process_env() -> Result<Self, ConfigError> {
        Self::from_env_vars(|key| std::env::var(key).ok())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "rabbitmq.host must not be empty".to_string(),
            });
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid {
                message: "rabbitmq.port must be greater than 0".to_string(),
            });
        }
        if self.username.is_empty() {
            return Err(ConfigError::Missing {
                key: "rabbitmq.username".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            username: "guest".to_string(),
            password: "guest".to_string(),
            host: "localhost".to_string(),
            port: 5672,
            vhost: String::new(),
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("username", &self.username)
            .field("password", &"<REDACTED>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .finish()
    }
}

// ============================================================================
// Application Settings
// ============================================================================

/// Complete settings for producers and workers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkQueueSettings {
    pub rabbitmq: ConnectionConfig,
    pub queue: QueueSettings,
    pub producer: ProducerSettings,
    pub worker: WorkerSettings,
}

impl WorkQueueSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rabbitmq.validate()?;
        self.queue.descriptor()?;
        self.producer.validate()?;
        self.worker.marker_byte()?;
        Ok(())
    }

    /// Copy of the settings with the password masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.rabbitmq.password = "<REDACTED>".to_string();
        copy
    }
}

/// Queue declaration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl QueueSettings {
    pub fn descriptor(&self) -> Result<QueueDescriptor, ConfigError> {
        let name = QueueName::new(self.name.clone()).map_err(|e| ConfigError::Invalid {
            message: format!("queue.name: {}", e),
        })?;

        Ok(QueueDescriptor {
            name,
            durable: self.durable,
            auto_delete: self.auto_delete,
            exclusive: self.exclusive,
        })
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "walter".to_string(),
            durable: true,
            auto_delete: false,
            exclusive: false,
        }
    }
}

/// Producer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    /// Deadline for a publish to be confirmed
    pub publish_timeout_secs: u64,
}

impl ProducerSettings {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.publish_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "producer.publish_timeout_secs must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            publish_timeout_secs: 5,
        }
    }
}

/// Worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub prefetch_count: u16,
    /// Character whose occurrences in a body set the simulated cost
    pub marker: String,
    /// Simulated work per marker, in milliseconds
    pub unit_millis: u64,
}

impl WorkerSettings {
    pub fn marker_byte(&self) -> Result<u8, ConfigError> {
        match self.marker.as_bytes() {
            [byte] => Ok(*byte),
            _ => Err(ConfigError::Invalid {
                message: format!(
                    "worker.marker must be a single ASCII character, got '{}'",
                    self.marker
                ),
            }),
        }
    }

    pub fn unit(&self) -> Duration {
        Duration::from_millis(self.unit_millis)
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            prefetch_count: 1,
            marker: ".".to_string(),
            unit_millis: 1000,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Builder for layered settings loading
#[derive(Debug, Clone)]
pub struct SettingsLoader {
    file: PathBuf,
    file_required: bool,
    environment: Option<HashMap<String, String>>,
}

impl SettingsLoader {
    /// Load `rabbit.yml` from the working directory if present
    pub fn new() -> Self {
        Self {
            file: PathBuf::from(DEFAULT_CONFIG_FILE),
            file_required: false,
            environment: None,
        }
    }

    /// Load an explicit file, which must exist
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = path.into();
        self.file_required = true;
        self
    }

    /// Load a file if it exists
    pub fn with_optional_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = path.into();
        self.file_required = false;
        self
    }

    /// Replace the process environment with a fixed set of variables
    pub fn with_environment(mut self, vars: HashMap<String, String>) -> Self {
        self.environment = Some(vars);
        self
    }

    pub fn load(&self) -> Result<WorkQueueSettings, ConfigError> {
        if self.file_required && !self.file.is_file() {
            return Err(ConfigError::FileNotFound {
                path: self.file.display().to_string(),
            });
        }

        debug!(path = %self.file.display(), required = self.file_required, "Loading settings");

        let settings = config::Config::builder()
            .add_source(
                config::File::from(self.file.as_path())
                    .format(config::FileFormat::Yaml)
                    .required(self.file_required),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .source(self.environment.clone()),
            )
            .build()
            .map_err(|e| ConfigError::Parsing {
                message: e.to_string(),
            })?;

        let settings: WorkQueueSettings =
            settings
                .try_deserialize()
                .map_err(|e| ConfigError::Parsing {
                    message: e.to_string(),
                })?;

        settings.validate()?;
        Ok(settings)
    }
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Generation
// ============================================================================

#[derive(Serialize)]
struct ConfigFile<'a> {
    rabbitmq: &'a ConnectionConfig,
}

/// Render a connection record in the `rabbitmq:` file layout
pub fn render_config_file(connection: &ConnectionConfig) -> Result<String, ConfigError> {
    let body = serde_yaml::to_string(&ConfigFile {
        rabbitmq: connection,
    })
    .map_err(|e| ConfigError::Parsing {
        message: e.to_string(),
    })?;

    Ok(format!("# File for the connection to RabbitMQ\n{}", body))
}

/// Write a connection record to `path`.
///
/// Refuses to replace an existing file unless `overwrite` is set.
pub fn write_config_file(
    path: &Path,
    connection: &ConnectionConfig,
    overwrite: bool,
) -> Result<(), ConfigError> {
    if path.exists() && !overwrite {
        return Err(ConfigError::Write {
            path: path.display().to_string(),
            message: "file already exists".to_string(),
        });
    }

    let contents = render_config_file(connection)?;
    std::fs::write(path, contents).map_err(|e| ConfigError::Write {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    info!(path = %path.display(), "Wrote broker configuration");
    Ok(())
}
