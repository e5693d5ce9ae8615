//! Agent configuration.
//!
//! Values come from command line flags, then environment variables, then an
//! optional JSON file (`-c/--config`), then built-in defaults.

use core::error::Error;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::ValueEnum;
use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
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

/// Wire format used to ship reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentFormat {
    /// One `POST /update/{type}/{name}/{value}` per metric
    Plain,
    /// Gzip-compressed JSON records
    #[default]
    Json,
    /// JSON messages over the RPC endpoints
    Rpc,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(about = "Collects host metrics and reports them to the server", long_about = None, version = &**version::VERSION)]
pub struct AgentArgs {
    #[arg(
        short = 'a',
        long,
        env = "ADDRESS",
        help = "Server address, host:port or a full URL (default localhost:8080)"
    )]
    pub address: Option<String>,

    #[arg(
        short = 'r',
        long,
        env = "REPORT_INTERVAL",
        help = "Seconds between reports (default 10)"
    )]
    pub report_interval: Option<u64>,

    #[arg(
        short = 'p',
        long,
        env = "POLL_INTERVAL",
        help = "Seconds between metric polls (default 2)"
    )]
    pub poll_interval: Option<u64>,

    #[arg(
        long = "format",
        env = "CONTENT_FORMAT",
        value_enum,
        help = "Report format (default json)"
    )]
    pub content_format: Option<ContentFormat>,

    #[arg(
        short = 'b',
        long,
        env = "BATCH_SIZE",
        help = "Metrics per request; 0 or 1 sends them one by one (default 0)"
    )]
    pub batch_size: Option<usize>,

    #[arg(
        short = 'k',
        long,
        env = "KEY",
        help = "Shared secret used to sign request bodies"
    )]
    pub key: Option<String>,

    #[arg(
        short = 'l',
        long,
        env = "RATE_LIMIT",
        help = "Maximum number of concurrent outgoing requests (default 1)"
    )]
    pub rate_limit: Option<usize>,

    #[arg(
        long,
        env = "COLLECT_CPU",
        action = clap::ArgAction::Set,
        help = "Collect per-core CPU utilization (default true)"
    )]
    pub collect_cpu: Option<bool>,

    #[arg(
        short = 'c',
        long,
        env = "CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to a JSON config file"
    )]
    pub config: Option<PathBuf>,
}

/// Shape of the JSON config file; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    address: Option<String>,
    report_interval: Option<u64>,
    poll_interval: Option<u64>,
    content_format: Option<ContentFormat>,
    batch_size: Option<usize>,
    key: Option<String>,
    rate_limit: Option<usize>,
    collect_cpu: Option<bool>,
}

/// Resolved agent settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub address: String,
    pub report_interval: Duration,
    pub poll_interval: Duration,
    pub content_format: ContentFormat,
    pub batch_size: usize,
    pub key: Option<String>,
    pub rate_limit: usize,
    pub collect_cpu: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            report_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            content_format: ContentFormat::Json,
            batch_size: 0,
            key: None,
            rate_limit: 1,
            collect_cpu: true,
        }
    }
}

impl AgentConfig {
    pub fn from_args(args: AgentArgs) -> Result<Self, Report<ConfigError>> {
        let file = match &args.config {
            Some(path) => load_file(path)?,
            None => FileConfig::default(),
        };
        let defaults = Self::default();

        let config = Self {
            address: args.address.or(file.address).unwrap_or(defaults.address),
            report_interval: args
                .report_interval
                .or(file.report_interval)
                .map_or(defaults.report_interval, Duration::from_secs),
            poll_interval: args
                .poll_interval
                .or(file.poll_interval)
                .map_or(defaults.poll_interval, Duration::from_secs),
            content_format: args
                .content_format
                .or(file.content_format)
                .unwrap_or(defaults.content_format),
            batch_size: args.batch_size.or(file.batch_size).unwrap_or(defaults.batch_size),
            key: args.key.or(file.key).filter(|key| !key.is_empty()),
            rate_limit: args.rate_limit.or(file.rate_limit).unwrap_or(defaults.rate_limit),
            collect_cpu: args
                .collect_cpu
                .or(file.collect_cpu)
                .unwrap_or(defaults.collect_cpu),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Report<ConfigError>> {
        let invalid = |message: &str| {
            Err(Report::new(ConfigError::Invalid {
                message: message.to_string(),
            }))
        };
        if self.address.trim().is_empty() {
            return invalid("address must not be empty");
        }
        if self.report_interval.is_zero() {
            return invalid("report interval must be at least one second");
        }
        if self.poll_interval.is_zero() {
            return invalid("poll interval must be at least one second");
        }
        if self.rate_limit == 0 {
            return invalid("rate limit must be at least 1");
        }
        Ok(())
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
