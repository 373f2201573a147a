use std::{
    env,
    io::{self, Write},
    path::PathBuf,
    process, time,
};

use daemonize_simple::Daemonize;
use trustdble_monitord::{config::Config, run, setup};

fn parse_args(args: Vec<String>) -> Option<PathBuf> {
    if args.len() == 1 {
        return None;
    }

    if args.len() != 3 {
        eprintln!("Unknown arguments '{:?}'.", args);
        eprintln!("Only '--conf <configuration file path>' is supported.");
        process::exit(1);
    }

    Some(PathBuf::from(args[2].to_owned()))
}

fn setup_logger(log_level: log::LevelFilter) -> Result<(), fern::InitError> {
    let dispatcher = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                time::SystemTime::now()
                    .duration_since(time::UNIX_EPOCH)
                    .unwrap_or_else(|e| {
                        println!("Can't get time since epoch: '{}'. Using a dummy value.", e);
                        time::Duration::from_secs(0)
                    })
                    .as_secs(),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log_level);

    dispatcher.chain(std::io::stdout()).apply()?;

    Ok(())
}

fn main() {
    let args = env::args().collect();
    let conf_file = parse_args(args);

    let config = Config::from_file(conf_file).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        process::exit(1);
    });
    setup_logger(config.log_level).unwrap_or_else(|e| {
        eprintln!("Error setting up logger: {}", e);
        process::exit(1);
    });

    let monitord = setup(config).unwrap_or_else(|e| {
        log::error!("Error starting the monitor: {}", e);
        process::exit(1);
    });

    // NOTE: it's safe to daemonize now, as we don't carry any open DB connection
    // https://www.sqlite.org/howtocorrupt.html#_carrying_an_open_database_connection_across_a_fork_
    if monitord.daemon {
        let log_file = monitord.log_file();
        let daemon = Daemonize {
            pid_file: Some(monitord.pid_file()),
            stdout_file: Some(log_file.clone()),
            stderr_file: Some(log_file),
            chdir: Some(monitord.data_dir.clone()),
            append: true,
            ..Daemonize::default()
        };
        daemon.doit().unwrap_or_else(|e| {
            // The panic hook will log::error
            panic!("Error daemonizing: {}", e);
        });
        println!("Started trustdble-monitord daemon");
    }

    run(monitord);

    // We are always logging to stdout, should it be then piped to the log file (if self) or
    // not. So just make sure that all messages were actually written.
    io::stdout().flush().expect("Flushing stdout");
}
