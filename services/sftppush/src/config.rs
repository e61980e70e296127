use crate::paths::{DestinationRoot, PathError};
use crate::uploader::MIN_PART_SIZE;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

/// Main configuration for the push service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Destination root and object store settings
    pub defaults: DefaultsConfig,
    /// Upload behaviour
    pub upload: UploadConfig,
    /// Watched sources
    #[serde(default)]
    pub watch: WatchConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log line format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Prometheus exporter port, disabled when unset
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Destination root and object store client settings
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
    /// Glob pattern for the root that object keys are relative to
    #[serde(default = "default_userpath")]
    pub userpath: String,
    /// Destination bucket
    #[serde(default)]
    pub s3target: String,
    /// Named AWS profile
    pub awsprofile: Option<String>,
    /// AWS region
    #[serde(default = "default_region")]
    pub awsregion: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Upload configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Time budget for a single upload in seconds
    pub timeout_secs: u64,
    /// Simultaneous uploads per watch session
    #[serde(default = "default_upload_concurrency")]
    pub concurrency: usize,
    /// Part size for multipart uploads in bytes (64MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Watched directories grouped into named sources
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub source: Vec<SourceConfig>,
}

/// One watch session: a name and the directories it covers
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

impl FromStr for SourceConfig {
    type Err = ConfigError;

    /// Parses `name=user1,paths=/device1/data /device2/data`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut name = None;
        let mut paths = None;

        for field in s.split(',') {
            let (key, value) = field.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
                key: "source".to_string(),
                message: format!("expected key=value, got {field:?}"),
            })?;

            match key.trim() {
                "name" => name = Some(value.trim().to_string()),
                "paths" => {
                    paths = Some(
                        value
                            .split_whitespace()
                            .map(PathBuf::from)
                            .collect::<Vec<_>>(),
                    )
                }
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "source".to_string(),
                        message: format!("unknown field {other:?}"),
                    })
                }
            }
        }

        let name = name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ConfigError::MissingRequired("source name".to_string()))?;
        let paths = paths
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ConfigError::MissingRequired(format!("paths for source {name}")))?;

        Ok(Self { name, paths })
    }
}

// Default value functions
fn default_service_name() -> String {
    "sftppush".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_userpath() -> String {
    "/home/".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_part_size() -> usize {
    64 * 1024 * 1024 // 64MB
}

impl Config {
    /// Load configuration from config files and environment.
    ///
    /// An explicit `path` must exist; the well-known locations are optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with default values
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            .set_default("defaults.userpath", default_userpath())?
            // Add config file if present
            .add_source(config::File::with_name("config/sftppush").required(false))
            .add_source(config::File::with_name("/etc/sftppush/sftppush").required(false));

        if let Some(home) = std::env::var_os("HOME") {
            let dotfile = Path::new(&home).join(".sftppush");
            builder = builder.add_source(
                config::File::with_name(&dotfile.to_string_lossy()).required(false),
            );
        }

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        // Override with environment variables
        // SFTPPUSH__DEFAULTS__USERPATH -> defaults.userpath
        let config = builder
            .add_source(
                config::Environment::with_prefix("SFTPPUSH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.defaults.s3target.is_empty() {
            return Err(ConfigError::MissingRequired("defaults.s3target".to_string()));
        }

        self.destination_root()?;

        if self.upload.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "upload.timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.upload.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "upload.concurrency".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.upload.part_size_bytes < MIN_PART_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "upload.part_size_bytes".to_string(),
                message: format!("must be at least {MIN_PART_SIZE}"),
            });
        }

        if self.watch.source.is_empty() {
            return Err(ConfigError::MissingRequired("watch.source".to_string()));
        }

        for source in &self.watch.source {
            if source.paths.is_empty() {
                return Err(ConfigError::MissingRequired(format!(
                    "watch.source[{}].paths",
                    source.name
                )));
            }
        }

        Ok(())
    }

    /// Compile the destination root pattern
    pub fn destination_root(&self) -> Result<DestinationRoot, ConfigError> {
        DestinationRoot::parse(&self.defaults.userpath).map_err(|e| match e {
            PathError::InvalidRootPattern { message, .. } => ConfigError::InvalidValue {
                key: "defaults.userpath".to_string(),
                message,
            },
            other => ConfigError::InvalidValue {
                key: "defaults.userpath".to_string(),
                message: other.to_string(),
            },
        })
    }

    /// Get the upload time budget as Duration
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload.timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_port: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            defaults: DefaultsConfig {
                userpath: "/home/".to_string(),
                s3target: "test-bucket".to_string(),
                awsprofile: None,
                awsregion: default_region(),
                endpoint_url: None,
                force_path_style: false,
            },
            upload: UploadConfig {
                timeout_secs: 30,
                concurrency: default_upload_concurrency(),
                part_size_bytes: default_part_size(),
            },
            watch: WatchConfig {
                source: vec![SourceConfig {
                    name: "user1".to_string(),
                    paths: vec![PathBuf::from("/home/user1")],
                }],
            },
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_userpath(), "/home/");
        assert_eq!(default_part_size(), 64 * 1024 * 1024);
        assert_eq!(default_upload_concurrency(), 4);
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.upload_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_missing_bucket_is_rejected() {
        let mut config = valid_config();
        config.defaults.s3target.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let mut config = valid_config();
        config.upload.timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "upload.timeout_secs"
        ));
    }

    #[test]
    fn test_small_part_size_is_rejected() {
        let mut config = valid_config();
        config.upload.part_size_bytes = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_root_pattern_is_rejected() {
        let mut config = valid_config();
        config.defaults.userpath = "/home/[x/".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "defaults.userpath"
        ));
    }

    #[test]
    fn test_source_without_paths_is_rejected() {
        let mut config = valid_config();
        config.watch.source[0].paths.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_source_flag() {
        let source: SourceConfig = "name=user1,paths=/device1/data /device2/data"
            .parse()
            .unwrap();
        assert_eq!(source.name, "user1");
        assert_eq!(
            source.paths,
            vec![PathBuf::from("/device1/data"), PathBuf::from("/device2/data")]
        );
    }

    #[test]
    fn test_parse_source_flag_errors() {
        assert!("paths=/a".parse::<SourceConfig>().is_err());
        assert!("name=user1".parse::<SourceConfig>().is_err());
        assert!("name=user1,colour=red".parse::<SourceConfig>().is_err());
        assert!("garbage".parse::<SourceConfig>().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[defaults]
userpath = "/srv/sftp/"
s3target = "archive"

[upload]
timeout_secs = 120

[[watch.source]]
name = "user1"
paths = ["/srv/sftp/user1/in", "/srv/sftp/user1/out"]
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.defaults.userpath, "/srv/sftp/");
        assert_eq!(config.defaults.s3target, "archive");
        assert_eq!(config.upload.timeout_secs, 120);
        assert_eq!(config.upload.concurrency, 4);
        assert_eq!(config.watch.source.len(), 1);
        assert_eq!(config.watch.source[0].paths.len(), 2);
        assert_eq!(config.service.log_format, LogFormat::Text);
        assert!(config.validate().is_ok());
    }
}
