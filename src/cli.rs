// src/cli.rs

use std::path::PathBuf;

use crate::errors::{Errors, NyxError};

pub const USAGE: &str = "\
usage: nyx [options] <config>

options:
  -c, --config <path>    configuration file (alternative to the positional)
  -q, --quiet            suppress all output
      --no-color         disable colored output
  -D, --no-daemon        stay in the foreground
      --syslog           log via syslog instead of the log file
      --log-file <path>  daemon log file location
      --local            keep runtime state in ./.nyx
  -h, --help             print this help";

/// Everything the operator can set on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NyxOptions {
    pub config: PathBuf,
    pub quiet: bool,
    pub no_color: bool,
    pub no_daemon: bool,
    pub syslog: bool,
    pub log_file: Option<PathBuf>,
    pub local_mode: bool,
}

/// Parses the command line. `Ok(None)` means help was requested and the
/// caller should print [`USAGE`] and exit cleanly.
pub fn parse_args(args: &[String]) -> Result<Option<NyxOptions>, NyxError> {
    let mut config: Option<PathBuf> = None;
    let mut quiet = false;
    let mut no_color = false;
    let mut no_daemon = false;
    let mut syslog = false;
    let mut log_file: Option<PathBuf> = None;
    let mut local_mode = false;

    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-q" | "--quiet" => quiet = true,
            "--no-color" => no_color = true,
            "-D" | "--no-daemon" => no_daemon = true,
            "--syslog" => syslog = true,
            "--local" => local_mode = true,
            "--log-file" => {
                let value = iter.next().ok_or_else(|| {
                    NyxError::new(Errors::Config, "--log-file requires a path")
                })?;
                log_file = Some(PathBuf::from(value));
            }
            "-c" | "--config" => {
                let value = iter.next().ok_or_else(|| {
                    NyxError::new(Errors::Config, "--config requires a path")
                })?;
                config = Some(PathBuf::from(value));
            }
            "-h" | "--help" => return Ok(None),
            flag if flag.starts_with('-') => {
                return Err(NyxError::new(
                    Errors::Config,
                    format!("unknown option '{}'", flag),
                ));
            }
            positional => {
                if config.is_some() {
                    return Err(NyxError::new(
                        Errors::Config,
                        format!("unexpected argument '{}'", positional),
                    ));
                }
                config = Some(PathBuf::from(positional));
            }
        }
    }

    let config = config.ok_or_else(|| {
        NyxError::new(Errors::Config, "no configuration file given")
    })?;

    Ok(Some(NyxOptions {
        config,
        quiet,
        no_color,
        no_daemon,
        syslog,
        log_file,
        local_mode,
    }))
}
