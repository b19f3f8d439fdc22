//! Server configuration loaded from TOML.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// The configuration file could not be read.
	#[error("failed to read config {path}: {error}")]
	Io {
		path: PathBuf,
		#[source]
		error: std::io::Error,
	},

	/// TOML parse error.
	#[error("TOML parse error: {0}")]
	Parse(#[from] toml::de::Error),

	/// A value is out of range.
	#[error("invalid config: {0}")]
	Invalid(String),
}

/// Tunables for one dispatcher and its listening endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
	/// Address the TCP endpoint listens on.
	pub listen: SocketAddr,
	/// Dispatcher worker threads draining the completion queue.
	pub workers: usize,
	/// Responses a stream may have outstanding before sends stall.
	pub write_window: usize,
	/// Calls held per method while no accept is registered.
	pub accept_backlog: usize,
	/// How long a graceful shutdown waits for in-flight calls.
	pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			listen: SocketAddr::from(([127, 0, 0, 1], 50055)),
			workers: 2,
			write_window: 4,
			accept_backlog: 64,
			shutdown_grace_ms: 2000,
		}
	}
}

impl ServerConfig {
	/// Parses and validates a TOML document. Missing keys take defaults.
	pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(input)?;
		config.validate()?;
		Ok(config)
	}

	/// Reads, parses, and validates a TOML file.
	pub fn load(path: &Path) -> Result<Self, ConfigError> {
		let input = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		Self::from_toml_str(&input)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		let nonzero = [("workers", self.workers), ("write_window", self.write_window), ("accept_backlog", self.accept_backlog)];
		for (name, value) in nonzero {
			if value == 0 {
				return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
			}
		}
		Ok(())
	}

	pub fn shutdown_grace(&self) -> Duration {
		Duration::from_millis(self.shutdown_grace_ms)
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	#[test]
	fn empty_document_yields_defaults() {
		let config = ServerConfig::from_toml_str("").unwrap();
		assert_eq!(config, ServerConfig::default());
		assert_eq!(config.shutdown_grace(), Duration::from_secs(2));
	}

	#[test]
	fn partial_document_overrides_keys() {
		let config = ServerConfig::from_toml_str(
			r#"
listen = "0.0.0.0:6000"
workers = 8
"#,
		)
		.unwrap();
		assert_eq!(config.listen.port(), 6000);
		assert_eq!(config.workers, 8);
		assert_eq!(config.write_window, 4);
	}

	#[test]
	fn unknown_key_is_rejected() {
		let err = ServerConfig::from_toml_str("threads = 3").unwrap_err();
		assert!(matches!(err, ConfigError::Parse(_)), "{err}");
	}

	#[test]
	fn zero_workers_is_invalid() {
		let err = ServerConfig::from_toml_str("workers = 0").unwrap_err();
		assert!(matches!(&err, ConfigError::Invalid(msg) if msg.contains("workers")), "{err}");
	}

	#[test]
	fn load_reads_file_and_reports_missing_path() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "write_window = 16").unwrap();
		let config = ServerConfig::load(file.path()).unwrap();
		assert_eq!(config.write_window, 16);

		let dir = tempfile::tempdir().unwrap();
		let missing = dir.path().join("absent.toml");
		let err = ServerConfig::load(&missing).unwrap_err();
		assert!(matches!(&err, ConfigError::Io { path, .. } if path == &missing));
	}
}
