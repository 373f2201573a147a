use crate::config::{config_folder_path, Config, ConfigError};

use std::{fs, path::PathBuf, time::Duration};

/// Our global state
pub struct MonitorD {
    /// We store all our data in one place, that's here.
    pub data_dir: PathBuf,
    /// How long to wait between two reconciliation cycles
    pub poll_interval: Duration,
    /// Whether to daemonize the process
    pub daemon: bool,
    /// What messages to log
    pub log_level: log::LevelFilter,
}

impl MonitorD {
    /// Creates our global state by consuming the static configuration
    pub fn from_config(config: Config) -> Result<MonitorD, ConfigError> {
        let data_dir = config
            .data_dir
            .or_else(config_folder_path)
            .ok_or(ConfigError::DatadirNotFound)?;
        if !data_dir.as_path().exists() {
            fs::create_dir_all(&data_dir).map_err(|e| {
                ConfigError::Unexpected(format!(
                    "Could not create data dir '{:?}': {}.",
                    data_dir, e
                ))
            })?;
        }

        Ok(MonitorD {
            data_dir,
            poll_interval: config.poll_interval_secs,
            daemon: config.daemon.unwrap_or(false),
            log_level: config.log_level,
        })
    }

    fn file_from_datadir(&self, file_name: &str) -> PathBuf {
        let data_dir_str = self
            .data_dir
            .to_str()
            .expect("Impossible: the datadir path is valid unicode");

        [data_dir_str, file_name].iter().collect()
    }

    pub fn log_file(&self) -> PathBuf {
        self.file_from_datadir("log")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.file_from_datadir("trustdble-monitord.pid")
    }
}
