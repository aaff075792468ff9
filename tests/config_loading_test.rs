/// Integration tests for configuration files
/// Tests that TOML files load, validate and drive a connection
use std::fs;
use tempfile::TempDir;
use url::Url;

use xfer::config::Config;
use xfer::uploader::Uploader;
use xfer::{ConfigError, ConnectionBuilder, OverwritePolicy};

#[test]
fn test_load_config_file() {
	let temp_dir = TempDir::new().expect("Failed to create temp dir");
	let config_path = temp_dir.path().join("config.toml");
	fs::write(
		&config_path,
		r#"
		logLevel = "warn"

		[connection]
		connectTimeoutSecs = 10
		channelCapacity = 16

		[transfer]
		speedUpdateIntervalMs = 100

		[uploader]
		maxConcurrent = 8
		overwrite = "ask"
		dryRun = true
		filePermissions = 420
		"#,
	)
	.unwrap();

	let config = Config::load(&config_path).expect("Config should load");
	assert_eq!(config.log_level, "warn");
	assert_eq!(config.connection.connect_timeout_secs, 10);
	assert_eq!(config.connection.channel_capacity, 16);
	assert_eq!(config.transfer.speed_update_interval_ms, 100);
	assert_eq!(config.transfer.speed_smoothing, 0.3);
	assert_eq!(config.uploader.max_concurrent, 8);
	assert_eq!(config.uploader.overwrite, OverwritePolicy::Ask);
	assert!(config.uploader.dry_run);
	assert_eq!(config.uploader.file_permissions, Some(0o644));
}

#[test]
fn test_explicit_path_must_exist() {
	let temp_dir = TempDir::new().unwrap();
	let missing = temp_dir.path().join("absent.toml");
	let err = Config::load_or_default(Some(&missing)).unwrap_err();
	assert!(matches!(err, ConfigError::Read { .. }));
}

#[test]
fn test_invalid_file_is_rejected() {
	let temp_dir = TempDir::new().unwrap();
	let config_path = temp_dir.path().join("bad.toml");
	fs::write(&config_path, "[connection]\nconnectTimeoutSecs = 0\n").unwrap();
	let err = Config::load(&config_path).unwrap_err();
	assert!(err.to_string().contains("connectTimeoutSecs"), "{}", err);
}

#[tokio::test]
async fn test_loaded_config_drives_connection_and_uploader() {
	let temp_dir = TempDir::new().unwrap();
	let source = temp_dir.path().join("src");
	let remote = temp_dir.path().join("remote");
	fs::create_dir_all(source.join("a")).unwrap();
	fs::create_dir_all(&remote).unwrap();
	fs::write(source.join("a/one.txt"), b"1").unwrap();

	let config = Config::from_toml_str("[uploader]\ndryRun = true\nmaxConcurrent = 1\n").unwrap();
	let url = Url::from_directory_path(&remote).unwrap();
	let connection = ConnectionBuilder::new(url.as_str()).config(config.clone()).build().unwrap();
	connection.connect().await.unwrap();
	connection.wait_until_open().await.unwrap();

	let report = Uploader::new(config.uploader).upload(&connection, &source, "/dst").await.unwrap();
	assert!(report.dry_run);
	assert_eq!(report.files.len(), 1);
	assert!(!remote.join("dst").exists());

	connection.disconnect().await.unwrap();
	connection.wait_until_disconnected().await;
}

// vim: ts=4
