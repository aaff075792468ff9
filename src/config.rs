//! Configuration for xfer connections and the recursive uploader
//!
//! The configuration follows a priority chain:
//! 1. Built-in defaults (`Config::default()`)
//! 2. Config file (TOML, `~/.config/xfer/config.toml` or `--config FILE`)
//! 3. CLI flags (highest priority)

use crate::error::ConfigError;
use crate::types::OverwritePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	/// Log level used when RUST_LOG is not set
	pub log_level: String,

	pub connection: ConnectionConfig,

	pub transfer: TransferConfig,

	pub uploader: UploaderConfig,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			log_level: "info".to_string(),
			connection: ConnectionConfig::default(),
			transfer: TransferConfig::default(),
			uploader: UploaderConfig::default(),
		}
	}
}

/// Connection state machine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionConfig {
	/// Seconds to wait for an adapter to open the connection
	pub connect_timeout_secs: u64,

	/// Authentication challenges answered before giving up
	pub auth_retry_limit: u32,

	/// Capacity of the owner-context message channel
	pub channel_capacity: usize,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		ConnectionConfig {
			connect_timeout_secs: 30,
			auth_retry_limit: crate::auth::AUTH_RETRY_LIMIT,
			channel_capacity: 256,
		}
	}
}

impl ConnectionConfig {
	pub fn connect_timeout(&self) -> Duration {
		Duration::from_secs(self.connect_timeout_secs)
	}
}

/// Transfer record progress settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransferConfig {
	/// Minimum interval between speed samples
	pub speed_update_interval_ms: u64,

	/// Weight of the newest sample in the smoothed speed (0, 1]
	pub speed_smoothing: f64,
}

impl Default for TransferConfig {
	fn default() -> Self {
		TransferConfig { speed_update_interval_ms: 250, speed_smoothing: 0.3 }
	}
}

impl TransferConfig {
	pub fn speed_update_interval(&self) -> Duration {
		Duration::from_millis(self.speed_update_interval_ms)
	}
}

/// Recursive uploader settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UploaderConfig {
	/// Uploads kept in the connection queue at once
	pub max_concurrent: usize,

	pub overwrite: OverwritePolicy,

	/// Build the transfer tree without uploading anything
	pub dry_run: bool,

	/// Glob patterns of local paths to leave out (e.g. "*.tmp", "**/.git/**")
	pub exclude_patterns: Vec<String>,

	/// Permissions applied to uploaded files
	pub file_permissions: Option<u32>,
}

impl Default for UploaderConfig {
	fn default() -> Self {
		UploaderConfig {
			max_concurrent: 4,
			overwrite: OverwritePolicy::Overwrite,
			dry_run: false,
			exclude_patterns: vec![],
			file_permissions: None,
		}
	}
}

impl Config {
	/// Default config file location
	pub fn default_path() -> Option<PathBuf> {
		std::env::var("HOME")
			.ok()
			.map(|h| PathBuf::from(h).join(".config").join("xfer").join("config.toml"))
	}

	/// Parse and validate a TOML document
	pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
		let config: Config = toml::from_str(text)?;
		config.validate()?;
		Ok(config)
	}

	/// Load and validate a config file
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let text = std::fs::read_to_string(path)
			.map_err(|e| ConfigError::Read { path: path.display().to_string(), source: e })?;
		Self::from_toml_str(&text)
	}

	/// Load `path` if given, else the default file if it exists, else defaults
	pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
		match path {
			Some(p) => Self::load(p),
			None => match Self::default_path() {
				Some(p) if p.exists() => Self::load(&p),
				_ => Ok(Config::default()),
			},
		}
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.connection.connect_timeout_secs == 0 {
			return Err(ConfigError::Invalid {
				field: "connection.connectTimeoutSecs",
				message: "must be greater than 0".to_string(),
			});
		}
		if self.connection.channel_capacity == 0 {
			return Err(ConfigError::Invalid {
				field: "connection.channelCapacity",
				message: "must be greater than 0".to_string(),
			});
		}
		let s = self.transfer.speed_smoothing;
		if !(s > 0.0 && s <= 1.0) {
			return Err(ConfigError::Invalid {
				field: "transfer.speedSmoothing",
				message: format!("must be in (0, 1], got {}", s),
			});
		}
		if self.uploader.max_concurrent == 0 {
			return Err(ConfigError::Invalid {
				field: "uploader.maxConcurrent",
				message: "must be at least 1".to_string(),
			});
		}
		for pattern in &self.uploader.exclude_patterns {
			globset::Glob::new(pattern).map_err(|e| ConfigError::Invalid {
				field: "uploader.excludePatterns",
				message: format!("{}: {}", pattern, e),
			})?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_config_default() {
		let config = Config::default();
		assert_eq!(config.connection.connect_timeout_secs, 30);
		assert_eq!(config.connection.auth_retry_limit, 3);
		assert_eq!(config.uploader.max_concurrent, 4);
		assert!(!config.uploader.dry_run);
		assert!(config.validate().is_ok());
	}

	#[test]
	fn test_config_from_toml() {
		let config = Config::from_toml_str(
			r#"
			logLevel = "debug"

			[connection]
			connectTimeoutSecs = 5

			[uploader]
			maxConcurrent = 2
			overwrite = "skip"
			excludePatterns = ["*.tmp"]
			"#,
		)
		.expect("valid config");
		assert_eq!(config.log_level, "debug");
		assert_eq!(config.connection.connect_timeout_secs, 5);
		assert_eq!(config.connection.auth_retry_limit, 3);
		assert_eq!(config.uploader.overwrite, OverwritePolicy::Skip);
		assert_eq!(config.uploader.exclude_patterns, vec!["*.tmp".to_string()]);
	}

	#[test]
	fn test_config_rejects_bad_values() {
		let err = Config::from_toml_str("[transfer]\nspeedSmoothing = 1.5\n").unwrap_err();
		assert!(err.to_string().contains("speedSmoothing"));

		let err = Config::from_toml_str("[uploader]\nmaxConcurrent = 0\n").unwrap_err();
		assert!(err.to_string().contains("maxConcurrent"));

		let err = Config::from_toml_str("[uploader]\nexcludePatterns = [\"a[\"]\n").unwrap_err();
		assert!(matches!(err, ConfigError::Invalid { .. }));

		assert!(matches!(Config::from_toml_str("logLevel = ["), Err(ConfigError::Parse { .. })));
	}

	#[test]
	fn test_config_serialization() {
		let config = Config::default();
		let json = serde_json::to_string(&config).expect("Failed to serialize");
		let deserialized: Config = serde_json::from_str(&json).expect("Failed to deserialize");
		assert_eq!(config.log_level, deserialized.log_level);
		assert_eq!(config.uploader.max_concurrent, deserialized.uploader.max_concurrent);
	}
}

// vim: ts=4
