//! Fork configuration: defaults, optional TOML file, `FORKLINE__*` environment.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::pump::QUEUE_MAX_ITEMS;
use crate::watchdog::WatchdogConfig;

pub const APP_NAME: &str = "forkline";
pub const ENV_PREFIX: &str = "FORKLINE";

/// How the controller talks to a fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Commands on stdin, events on stdout.
    #[default]
    Pipe,
    /// The worker connects back to a loopback TCP port.
    Tcp,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pipe" => Ok(Transport::Pipe),
            "tcp" => Ok(Transport::Tcp),
            other => Err(format!("unknown transport '{other}' (expected pipe or tcp)")),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Pipe => f.write_str("pipe"),
            Transport::Tcp => f.write_str("tcp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkConfig {
    pub transport: Transport,
    /// Seconds a fork may run its tests before it is killed; 0 disables the limit.
    pub fork_timeout_secs: u64,
    /// Grace period for a fork to exit after goodbye or kill.
    pub exit_timeout_secs: u64,
    pub watchdog_tick_ms: u64,
    /// Seconds between keep-alive pings; 0 disables pings.
    pub ping_interval_secs: u64,
    pub queue_capacity: usize,
    pub dump_dir: PathBuf,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Pipe,
            fork_timeout_secs: 0,
            exit_timeout_secs: 30,
            watchdog_tick_ms: 1_000,
            ping_interval_secs: 30,
            queue_capacity: QUEUE_MAX_ITEMS,
            dump_dir: PathBuf::from("target/forkline-reports"),
        }
    }
}

impl ForkConfig {
    pub fn exit_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_timeout_secs)
    }

    pub fn watchdog(&self) -> WatchdogConfig {
        WatchdogConfig {
            fork_timeout_secs: self.fork_timeout_secs,
            tick: Duration::from_millis(self.watchdog_tick_ms),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_NAME).join("config.toml"))
}

/// Load the configuration. A missing file is not an error.
pub fn load_config(path: Option<&Path>) -> Result<ForkConfig> {
    let defaults = ForkConfig::default();
    let mut builder = Config::builder()
        .set_default("transport", defaults.transport.to_string())?
        .set_default("fork_timeout_secs", defaults.fork_timeout_secs as i64)?
        .set_default("exit_timeout_secs", defaults.exit_timeout_secs as i64)?
        .set_default("watchdog_tick_ms", defaults.watchdog_tick_ms as i64)?
        .set_default("ping_interval_secs", defaults.ping_interval_secs as i64)?
        .set_default("queue_capacity", defaults.queue_capacity as i64)?
        .set_default("dump_dir", defaults.dump_dir.display().to_string())?;

    if let Some(path) = path.map(Path::to_path_buf).or_else(default_config_path) {
        builder = builder.add_source(
            File::from(path.as_path())
                .format(FileFormat::Toml)
                .required(false),
        );
    }

    let built = builder
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()
        .context("building configuration")?;

    let mut config: ForkConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;
    config.dump_dir = expand_path(&config.dump_dir)?;
    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }
    let toml = toml::to_string_pretty(&ForkConfig::default())
        .context("serializing default config to TOML")?;
    let body = format!("# Configuration for {APP_NAME}\n# File: {}\n\n{toml}", path.display());
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => {
            let expanded = shellexpand::full(text).context("expanding path")?;
            Ok(PathBuf::from(expanded.to_string()))
        }
        None => Ok(path.to_path_buf()),
    }
}
