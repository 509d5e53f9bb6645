use std::path::PathBuf;
use std::process::exit;

use clap::{App, Arg};
use monet::{Daemon, DaemonConfig, MonetError};

// Exit codes per the daemon CLI contract.
const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 64;
const EXIT_SHM: i32 = 71;
const EXIT_IPC: i32 = 74;
const EXIT_SOFTWARE: i32 = 70;

fn exit_code_for(error: &MonetError) -> i32 {
    match error {
        MonetError::Config { .. } | MonetError::CompatibilityError { .. } => EXIT_CONFIG,
        MonetError::ShmCreateFailed { .. } | MonetError::PermissionDenied { .. } => EXIT_SHM,
        MonetError::IpcChannelError { .. } => EXIT_IPC,
        _ => EXIT_SOFTWARE,
    }
}

fn main() {
    let matches = App::new("monetd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Monet shared-memory pub/sub broker daemon")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("PATH")
                .help("Path to the TOML configuration file")
                .takes_value(true),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => match DaemonConfig::load(&PathBuf::from(path)) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("monetd: {}", e);
                exit(EXIT_CONFIG);
            }
        },
        None => DaemonConfig::default(),
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.clone()),
    )
    .init();

    let daemon = match Daemon::start(config) {
        Ok(daemon) => daemon,
        Err(e) => {
            eprintln!("monetd: {}", e);
            exit(exit_code_for(&e));
        }
    };

    match daemon.run_until_signal() {
        Ok(()) => exit(EXIT_OK),
        Err(e) => {
            eprintln!("monetd: {}", e);
            exit(exit_code_for(&e));
        }
    }
}
