//! Server configuration.
//!
//! Values come from command line flags, then environment variables, then an
//! optional JSON file (`-c/--config`), then built-in defaults.

use core::error::Error;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use storage::StorageConfig;
use utils::version;

pub const DEFAULT_ADDRESS: &str = "localhost:8080";

#[derive(Debug, Display)]
pub enum ConfigError {
    #[display("cannot read config file {}", path.display())]
    Read { path: PathBuf },
    #[display("cannot parse config file {}", path.display())]
    Parse { path: PathBuf },
    #[display("invalid configuration: {message}")]
    Invalid { message: String },
}

impl Error for ConfigError {}

#[derive(Parser, Debug, Clone, Default)]
#[command(about = "Receives and aggregates agent metrics", long_about = None, version = &**version::VERSION)]
pub struct ServerArgs {
    #[arg(
        short = 'a',
        long,
        env = "ADDRESS",
        help = "Listen address host:port (default localhost:8080)"
    )]
    pub address: Option<String>,

    #[arg(
        short = 'i',
        long,
        env = "STORE_INTERVAL",
        help = "Seconds between snapshot flushes; 0 flushes on every write (default 300)"
    )]
    pub store_interval: Option<u64>,

    #[arg(
        short = 'f',
        long = "file-storage-path",
        env = "FILE_STORAGE_PATH",
        value_hint = clap::ValueHint::FilePath,
        help = "Snapshot file; enables the file backend when no database is configured"
    )]
    pub file_storage_path: Option<PathBuf>,

    #[arg(
        short = 'r',
        long,
        env = "RESTORE",
        action = clap::ArgAction::Set,
        help = "Load the snapshot file on startup (default true)"
    )]
    pub restore: Option<bool>,

    #[arg(
        short = 'd',
        long,
        env = "DATABASE_DSN",
        help = "PostgreSQL connection string; selects the database backend"
    )]
    pub database_dsn: Option<String>,

    #[arg(
        short = 'k',
        long,
        env = "KEY",
        help = "Shared secret for request signature checks and response signing"
    )]
    pub key: Option<String>,

    #[arg(
        long,
        env = "BATCH_LIMIT",
        help = "Rows per database round trip in batch updates (default 100)"
    )]
    pub batch_limit: Option<usize>,

    #[arg(
        long,
        env = "LOG_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory for daily rolling log files"
    )]
    pub log_dir: Option<PathBuf>,

    #[arg(
        short = 'c',
        long,
        env = "CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to a JSON config file"
    )]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    address: Option<String>,
    store_interval: Option<u64>,
    store_file: Option<PathBuf>,
    restore: Option<bool>,
    database_dsn: Option<String>,
    key: Option<String>,
    batch_limit: Option<usize>,
    log_dir: Option<PathBuf>,
}

/// Resolved server settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub address: String,
    pub store_interval: Duration,
    pub file_storage_path: Option<PathBuf>,
    pub restore: bool,
    pub database_dsn: Option<String>,
    pub key: Option<String>,
    pub batch_limit: usize,
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            store_interval: Duration::from_secs(300),
            file_storage_path: None,
            restore: true,
            database_dsn: None,
            key: None,
            batch_limit: storage::postgres::DEFAULT_BATCH_LIMIT,
            log_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn from_args(args: ServerArgs) -> Result<Self, Report<ConfigError>> {
        let file = match &args.config {
            Some(path) => load_file(path)?,
            None => FileConfig::default(),
        };
        let defaults = Self::default();

        let config = Self {
            address: args.address.or(file.address).unwrap_or(defaults.address),
            store_interval: args
                .store_interval
                .or(file.store_interval)
                .map_or(defaults.store_interval, Duration::from_secs),
            file_storage_path: args
                .file_storage_path
                .or(file.store_file)
                .filter(|path| !path.as_os_str().is_empty()),
            restore: args.restore.or(file.restore).unwrap_or(defaults.restore),
            database_dsn: args
                .database_dsn
                .or(file.database_dsn)
                .filter(|dsn| !dsn.is_empty()),
            key: args.key.or(file.key).filter(|key| !key.is_empty()),
            batch_limit: args
                .batch_limit
                .or(file.batch_limit)
                .unwrap_or(defaults.batch_limit),
            log_dir: args.log_dir.or(file.log_dir),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Report<ConfigError>> {
        if self.address.trim().is_empty() {
            return Err(Report::new(ConfigError::Invalid {
                message: "address must not be empty".to_string(),
            }));
        }
        if self.batch_limit == 0 {
            return Err(Report::new(ConfigError::Invalid {
                message: "batch limit must be at least 1".to_string(),
            }));
        }
        Ok(())
    }

    pub fn storage(&self) -> StorageConfig {
        StorageConfig {
            database_dsn: self.database_dsn.clone(),
            file_path: self.file_storage_path.clone(),
            restore: self.restore,
            store_interval: self.store_interval,
            batch_limit: self.batch_limit,
        }
    }
}

fn load_file(path: &Path) -> Result<FileConfig, Report<ConfigError>> {
    let raw = std::fs::read_to_string(path).change_context_lazy(|| ConfigError::Read {
        path: path.to_path_buf(),
    })?;
    serde_json::from_str(&raw).change_context_lazy(|| ConfigError::Parse {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn defaults_apply_without_flags() {
        let config = ServerConfig::from_args(ServerArgs::default()).expect("should resolve");
        assert_eq!(config, ServerConfig::default());
        assert!(config.storage().database_dsn.is_none());
    }

    #[test]
    fn flags_are_parsed() {
        let args = ServerArgs::try_parse_from([
            "server",
            "-a",
            "0.0.0.0:9090",
            "-i",
            "0",
            "-f",
            "/tmp/metrics.gz",
            "-r",
            "false",
            "--batch-limit",
            "25",
        ])
        .expect("should parse args");
        let config = ServerConfig::from_args(args).expect("should resolve");

        assert_eq!(config.address, "0.0.0.0:9090");
        assert_eq!(config.store_interval, Duration::ZERO);
        assert_eq!(config.file_storage_path, Some(PathBuf::from("/tmp/metrics.gz")));
        assert!(!config.restore);
        assert_eq!(config.batch_limit, 25);
    }

    #[test]
    fn file_values_fill_missing_flags() {
        let mut file = tempfile::NamedTempFile::new().expect("should create temp file");
        write!(
            file,
            r#"{{"store_file": "/var/lib/metrics.gz", "store_interval": 60, "key": "k"}}"#
        )
        .expect("should write config");
        let args = ServerArgs {
            config: Some(file.path().to_path_buf()),
            store_interval: Some(5),
            ..ServerArgs::default()
        };

        let config = ServerConfig::from_args(args).expect("should resolve");

        assert_eq!(config.file_storage_path, Some(PathBuf::from("/var/lib/metrics.gz")));
        assert_eq!(config.store_interval, Duration::from_secs(5));
        assert_eq!(config.key.as_deref(), Some("k"));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("should create temp file");
        write!(file, r#"{{"adress": "typo"}}"#).expect("should write config");
        let args = ServerArgs {
            config: Some(file.path().to_path_buf()),
            ..ServerArgs::default()
        };

        let err = ServerConfig::from_args(args).expect_err("should fail");
        assert!(matches!(err.current_context(), ConfigError::Parse { .. }));
    }
}
