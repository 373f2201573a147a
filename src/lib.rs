pub mod chain;
pub mod config;
mod database;
pub mod decoder;
mod monitord;
mod poller;
mod utils;

pub const VERSION: &str = "0.1.0";

pub use crate::monitord::MonitorD;
use crate::{
    config::{Config, ConfigError},
    database::{
        actions::{setup_db, SqliteSink},
        DatabaseError,
    },
    poller::monitor_main_loop,
};

use std::{error, fmt, io, panic, process};

// A panic in any thread should stop the main thread, and print the panic.
fn setup_panic_hook() {
    panic::set_hook(Box::new(move |panic_info| {
        let file = panic_info
            .location()
            .map(|l| l.file())
            .unwrap_or_else(|| "'unknown'");
        let line = panic_info
            .location()
            .map(|l| l.line().to_string())
            .unwrap_or_else(|| "'unknown'".to_string());

        let bt = backtrace::Backtrace::new();
        let info = panic_info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic_info.payload().downcast_ref::<String>().cloned());
        log::error!(
            "panic occurred at line {} of file {}: {:?}\n{:?}",
            line,
            file,
            info,
            bt
        );

        process::exit(1);
    }));
}

#[derive(Debug)]
pub enum StartupError {
    Config(ConfigError),
    Io(io::Error),
    Db(DatabaseError),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{}", e),
            Self::Io(e) => write!(f, "{}", e),
            Self::Db(e) => write!(f, "Database error when starting the monitor: '{}'", e),
        }
    }
}

impl error::Error for StartupError {}

impl From<ConfigError> for StartupError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<DatabaseError> for StartupError {
    fn from(e: DatabaseError) -> Self {
        Self::Db(e)
    }
}

impl From<io::Error> for StartupError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Set up the global state and the catalog database from the configuration.
///
/// **Note**: this sets a panic hook. A downstream application must not
/// overwrite it.
pub fn setup(config: Config) -> Result<MonitorD, StartupError> {
    setup_panic_hook();

    let monitord = MonitorD::from_config(config)?;

    log::info!("Setting up the catalog database");
    setup_db(&SqliteSink::new(monitord.data_dir.clone()))?;

    Ok(monitord)
}

/// Run the reconciliation loop. Never returns.
pub fn run(monitord: MonitorD) {
    let sink = SqliteSink::new(monitord.data_dir.clone());
    log::info!(
        "Monitor started, polling every {} seconds",
        monitord.poll_interval.as_secs()
    );
    monitor_main_loop(&monitord, &sink);
}
