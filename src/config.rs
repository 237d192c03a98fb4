// Configuration parsing for FabricMon.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::{access, AccessFlags};
use serde::Deserialize;

use crate::error::Error;

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_influxdb_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_log_level() -> log::LevelFilter {
    log::LevelFilter::Info
}

/// The main configuration struct for FabricMon.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FabricmonConf {
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Percentage of a counter's limit above which the counter is reset.
    pub counter_reset_threshold: u32,

    /// Management key passed along with discovery SMPs.
    #[serde(default)]
    pub m_key: u64,

    #[serde(default)]
    pub influxdb: Vec<InfluxDbConf>,

    #[serde(default)]
    pub logging: LoggingConf,

    #[serde(default)]
    pub topology: TopologyConf,
}

/// Configuration values for a single InfluxDB backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InfluxDbConf {
    pub url: String,
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub retention_policy: Option<String>,
    #[serde(with = "humantime_serde", default = "default_influxdb_timeout")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConf {
    #[serde(default = "default_log_level")]
    pub log_level: log::LevelFilter,
}

impl Default for LoggingConf {
    fn default() -> Self {
        LoggingConf {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyConf {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub output_dir: PathBuf,
}

impl TopologyConf {
    fn validate(&self) -> Result<(), Error> {
        if self.enabled {
            access(&self.output_dir, AccessFlags::W_OK).map_err(|e| {
                Error::ConfigInvalid(format!(
                    "topology output directory {:?}: {}",
                    self.output_dir, e
                ))
            })?;
        }

        Ok(())
    }
}

pub fn read_config<P: AsRef<Path>>(config_file: P) -> Result<FabricmonConf, Error> {
    let content = fs::read_to_string(&config_file).map_err(Error::ConfigRead)?;

    let conf: FabricmonConf = serde_yaml::from_str(&content)?;

    if !(25..=100).contains(&conf.counter_reset_threshold) {
        return Err(Error::ConfigInvalid(format!(
            "counter_reset_threshold must be within [25, 100], got {}",
            conf.counter_reset_threshold
        )));
    }

    conf.topology.validate()?;

    Ok(conf)
}
