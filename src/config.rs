use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// Application configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Local IPv4 address the capture socket binds to. Auto-detected from
    /// the hostname when not set.
    #[serde(default)]
    pub bind_address: Option<Ipv4Addr>,

    /// Process names whose live instances gate the capture.
    #[serde(default)]
    pub watch: Vec<String>,

    /// Process table poll interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    /// API server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Enable reverse DNS resolution for recorded addresses.
    #[serde(default)]
    pub resolve_dns: bool,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// Data retention in seconds (None = keep forever).
    #[serde(default)]
    pub data_retention_seconds: Option<u64>,

    /// Peer timeout in seconds (for stale peer-stats cleanup).
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout: u64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "capture.db".to_string()
}

fn default_peer_timeout() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: None,
            watch: Vec::new(),
            poll_interval_seconds: default_poll_interval(),
            port: default_port(),
            db_path: default_db_path(),
            resolve_dns: false,
            quiet: false,
            data_retention_seconds: None,
            peer_timeout: default_peer_timeout(),
        }
    }
}

impl Config {
    /// Load config from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if cli.bind_address.is_some() {
            self.bind_address = cli.bind_address;
        }
        if !cli.watch.is_empty() {
            self.watch = cli.watch.clone();
        }
        if cli.poll_interval != 5 {
            self.poll_interval_seconds = cli.poll_interval;
        }
        if cli.port != 3000 {
            self.port = cli.port;
        }
        if cli.db_path != "capture.db" {
            self.db_path = cli.db_path.clone();
        }
        if cli.resolve_dns {
            self.resolve_dns = true;
        }
        if cli.quiet {
            self.quiet = true;
        }
        if cli.data_retention.is_some() {
            self.data_retention_seconds = cli.data_retention;
        }
        if cli.peer_timeout != 60 {
            self.peer_timeout = cli.peer_timeout;
        }
    }
}

use clap::Parser;

/// ipwatch: process-gated passive IPv4 traffic monitor
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Local IPv4 address to bind the capture socket to. Auto-detects if not provided.
    #[arg(short, long)]
    pub bind_address: Option<Ipv4Addr>,

    /// Process name to watch (repeatable). Capture runs while any instance is alive.
    #[arg(short, long = "watch")]
    pub watch: Vec<String>,

    /// Process table poll interval in seconds
    #[arg(long, default_value_t = 5)]
    pub poll_interval: u64,

    /// Port to serve the API on
    #[arg(short, long, default_value_t = 3000)]
    pub port: u16,

    /// Database path
    #[arg(long, default_value = "capture.db")]
    pub db_path: String,

    /// Path to YAML config file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Enable reverse DNS resolution for recorded addresses
    #[arg(long)]
    pub resolve_dns: bool,

    /// Quiet mode (suppress non-error logs)
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Data retention in seconds (delete records older than this, disabled if not set)
    #[arg(long)]
    pub data_retention: Option<u64>,

    /// Peer timeout in seconds for stale stats cleanup
    #[arg(long, default_value_t = 60)]
    pub peer_timeout: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_config_parses() {
        let yaml = r#"
bind_address: 192.168.1.10
watch:
  - chrome
  - firefox
poll_interval_seconds: 2
resolve_dns: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bind_address, Some(Ipv4Addr::new(192, 168, 1, 10)));
        assert_eq!(config.watch, vec!["chrome", "firefox"]);
        assert_eq!(config.poll_interval_seconds, 2);
        assert!(config.resolve_dns);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.port, 3000);
        assert_eq!(config.db_path, "capture.db");
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let mut config = Config {
            watch: vec!["chrome".to_string()],
            port: 8080,
            ..Config::default()
        };

        let cli = CliArgs {
            bind_address: Some(Ipv4Addr::new(10, 0, 0, 5)),
            watch: vec!["firefox".to_string()],
            poll_interval: 5,
            port: 3000,
            db_path: "capture.db".to_string(),
            config: None,
            resolve_dns: false,
            quiet: true,
            data_retention: Some(3600),
            peer_timeout: 60,
        };
        config.merge_cli(&cli);

        assert_eq!(config.bind_address, Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(config.watch, vec!["firefox"]);
        // Defaults on the CLI do not clobber file values.
        assert_eq!(config.port, 8080);
        assert!(config.quiet);
        assert_eq!(config.data_retention_seconds, Some(3600));
    }
}
