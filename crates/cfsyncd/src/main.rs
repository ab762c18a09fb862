//! cfsyncd: cfsync placeholder sync daemon
//!
//! Usage:
//!   cfsyncd [--config /etc/cfsync/config.toml] [--log info] [--log-format text|json]
//!
//! Registers every `[[roots]]` entry with the placeholder layer, runs one
//! sync worker per root, and serves /metrics, /healthz and /readyz.

mod daemon;
mod metrics;

use anyhow::{Context, Result};
use cfsync_core::CfsyncConfig;
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cfsyncd", version, about = "cfsync placeholder sync daemon")]
struct Cli {
    /// Path to cfsync.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "CFSYNC_CONFIG",
        default_value = "/etc/cfsync/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CFSYNC_LOG", default_value = "info")]
    log: String,

    /// Log format (json, text)
    #[arg(long, env = "CFSYNC_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log, &cli.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "cfsyncd starting"
    );

    let config = load_config(&cli.config).await?;
    daemon::run(config).await
}

async fn load_config(path: &Path) -> Result<CfsyncConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        CfsyncConfig::from_toml(&content)
            .with_context(|| format!("parsing config {}", path.display()))
    } else {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            path.display()
        );
        Ok(CfsyncConfig::default())
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_config_falls_back_to_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("absent.toml")).await.unwrap();
        assert!(config.roots.is_empty());
        assert_eq!(config.daemon.log_level, "info");
    }

    #[tokio::test]
    async fn invalid_roots_are_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("cfsync.toml");
        std::fs::write(
            &path,
            r#"
[[roots]]
account = "alice"
local_path = "relative/dir"
"#,
        )
        .unwrap();
        let err = load_config(&path).await.unwrap_err();
        assert!(format!("{err:#}").contains("must be absolute"), "{err:#}");
    }

    #[test]
    fn cli_parses_log_format() {
        let cli = Cli::parse_from(["cfsyncd", "--config", "/tmp/x.toml", "--log-format", "json"]);
        assert!(matches!(cli.log_format, LogFormat::Json));
        assert_eq!(cli.config, PathBuf::from("/tmp/x.toml"));
    }
}
