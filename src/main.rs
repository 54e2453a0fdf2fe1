// src/main.rs

use std::path::PathBuf;
use std::process::exit;

use nyx::cli;
use nyx::config::SupervisorConfig;
use nyx::log;
use nyx::logger::{self, LogLevel, LogSettings, DEFAULT_LOG_FILE};
use nyx::nyx::{daemonize, Nyx};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let options = match cli::parse_args(&args) {
        Ok(Some(options)) => options,
        Ok(None) => {
            println!("{}", cli::USAGE);
            exit(0);
        }
        Err(err) => {
            eprintln!("nyx: {}", err.message);
            eprintln!("{}", cli::USAGE);
            exit(1);
        }
    };

    // surface configuration problems before detaching from the terminal
    let settings = match SupervisorConfig::load(&options.config) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("nyx: {}", err);
            exit(1);
        }
    };

    let is_init = std::process::id() == 1;
    let daemon = !options.no_daemon && !is_init;

    if daemon {
        if let Err(err) = daemonize() {
            eprintln!("nyx: {}", err);
            exit(2);
        }
    }

    logger::init(LogSettings {
        quiet: options.quiet,
        no_color: options.no_color,
        daemon,
        syslog: options.syslog && daemon,
        log_file: match &options.log_file {
            Some(path) => Some(path.clone()),
            None if daemon => Some(PathBuf::from(DEFAULT_LOG_FILE)),
            None => None,
        },
    });

    let mut nyx = match Nyx::with_config(options, settings) {
        Ok(nyx) => nyx,
        Err(err) => {
            log!(LogLevel::Error, "failed to start: {}", err);
            logger::shutdown();
            exit(if err.is_config() { 1 } else { 2 });
        }
    };

    match nyx.run() {
        Ok(()) => {
            logger::shutdown();
            exit(0);
        }
        Err(err) => {
            log!(LogLevel::Error, "{}", err);
            logger::shutdown();
            exit(2);
        }
    }
}
