use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "xsw",
    about = "Switch the local Xray daemon between subscription upstreams",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List candidate servers from the subscription (default).
    List,

    /// Probe every candidate and print them fastest first.
    Ping(PingArgs),

    /// Point the daemon at the server with the given ID and restart it.
    Switch(SwitchArgs),

    /// Detect which candidate the daemon currently uses.
    Current,

    /// Print candidate count, current server and last load time.
    Status,

    /// Drop the in-memory cache and fetch the subscription again.
    Refresh,

    /// Restore the daemon config from the newest backup and restart the daemon.
    Restore,

    /// Print the daemon config as it is on disk.
    ShowConfig,
}

impl Command {
    /// Whether the command needs the subscription; `restore` and `show-config` only touch the
    /// daemon config.
    pub fn loads_subscription(&self) -> bool {
        !matches!(self, Self::Restore | Self::ShowConfig)
    }
}

#[derive(Args, Debug, Clone)]
pub struct PingArgs {
    /// Only print the N fastest reachable servers (0 = all results).
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub top: usize,
}

#[derive(Args, Debug, Clone)]
pub struct SwitchArgs {
    #[arg(value_name = "ID")]
    pub id: String,
}

/// Runtime configuration. Every component takes what it needs from this one record.
#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Administrator identifier; only the chat front-end consults it.
    #[arg(long, global = true, env = "XSW_ADMIN_ID", value_name = "ID")]
    pub admin_id: Option<i64>,

    /// Chat front-end credential.
    #[arg(
        long,
        global = true,
        env = "XSW_BOT_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true
    )]
    pub bot_token: Option<String>,

    #[arg(
        long,
        global = true,
        env = "XSW_SUBSCRIPTION_URL",
        value_name = "URL",
        default_value = ""
    )]
    pub subscription_url: String,

    #[arg(
        long,
        global = true,
        env = "XSW_CONFIG_PATH",
        value_name = "PATH",
        default_value = "/usr/local/etc/xray/config.json"
    )]
    pub config_path: PathBuf,

    #[arg(
        long = "xray-restart-command",
        global = true,
        env = "XSW_XRAY_RESTART_COMMAND",
        value_name = "CMD",
        default_value = "systemctl restart xray"
    )]
    pub xray_restart_command: String,

    #[arg(
        long = "xray-restart-timeout-secs",
        global = true,
        env = "XSW_XRAY_RESTART_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..=600)
    )]
    pub xray_restart_timeout_secs: u64,

    /// In-memory candidate TTL in seconds.
    #[arg(
        long = "cache-duration",
        global = true,
        env = "XSW_CACHE_DURATION",
        value_name = "SECS",
        default_value_t = 300,
        value_parser = clap::value_parser!(u64).range(0..=86400)
    )]
    pub cache_duration: u64,

    /// Dial timeout for probes and overall timeout for subscription requests, in seconds.
    #[arg(
        long = "ping-timeout",
        global = true,
        env = "XSW_PING_TIMEOUT",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=60)
    )]
    pub ping_timeout: u64,

    #[arg(
        long = "probe-concurrency",
        global = true,
        env = "XSW_PROBE_CONCURRENCY",
        value_name = "N",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..=256)
    )]
    pub probe_concurrency: u64,

    /// Directory holding `servers.json`, the last good subscription snapshot.
    #[arg(
        long,
        global = true,
        env = "XSW_CACHE_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub cache_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingSubscriptionUrl,
    InvalidSubscriptionUrl { url: String, reason: String },
    RelativeConfigPath { path: PathBuf },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingSubscriptionUrl => {
                write!(f, "subscription_url is required (--subscription-url)")
            }
            Self::InvalidSubscriptionUrl { url, reason } => {
                write!(f, "invalid subscription_url {url:?}: {reason}")
            }
            Self::RelativeConfigPath { path } => {
                write!(f, "config_path must be absolute: {}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Full check for commands that fetch the subscription.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_subscription_url()?;
        self.validate_config_path()
    }

    pub fn validate_config_path(&self) -> Result<(), ConfigError> {
        if !self.config_path.is_absolute() {
            return Err(ConfigError::RelativeConfigPath {
                path: self.config_path.clone(),
            });
        }
        Ok(())
    }

    fn validate_subscription_url(&self) -> Result<(), ConfigError> {
        let url = self.subscription_url.trim();
        if url.is_empty() {
            return Err(ConfigError::MissingSubscriptionUrl);
        }
        let parsed = url::Url::parse(url).map_err(|e| ConfigError::InvalidSubscriptionUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidSubscriptionUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_duration)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.xray_restart_timeout_secs)
    }
}
