// src/logger.rs

use std::{fmt, fs::OpenOptions, io::Write, path::PathBuf, sync::RwLock};

use colored::Colorize;
use serde::{Deserialize, Serialize};

lazy_static::lazy_static! {
    static ref CURRENT_LOG_LEVEL: RwLock<LogLevel> = RwLock::new(LogLevel::Info);
    static ref SETTINGS: RwLock<LogSettings> = RwLock::new(LogSettings::default());
}

/// Identifier handed to openlog(); must outlive the syslog connection.
static SYSLOG_IDENT: &[u8] = b"nyx\0";

/// Daemon-mode log location when none is configured.
pub const DEFAULT_LOG_FILE: &str = "/var/log/nyx.log";

pub fn set_log_level(level: LogLevel) {
    let mut log_level = CURRENT_LOG_LEVEL.write().unwrap();
    *log_level = level;
}

pub fn get_log_level() -> LogLevel {
    *CURRENT_LOG_LEVEL.read().unwrap()
}

/// Sink configuration for the whole process. Daemon mode prepends a local
/// timestamp to every record and writes to the log file; foreground output
/// stays plain. Syslog replaces both when requested.
#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    pub quiet: bool,
    pub no_color: bool,
    pub daemon: bool,
    pub syslog: bool,
    pub log_file: Option<PathBuf>,
}

pub fn init(settings: LogSettings) {
    if settings.no_color {
        colored::control::set_override(false);
    }

    if settings.syslog {
        unsafe {
            libc::openlog(
                SYSLOG_IDENT.as_ptr() as *const libc::c_char,
                libc::LOG_NDELAY | libc::LOG_PID,
                libc::LOG_USER,
            );
        }
    }

    let mut current = SETTINGS.write().unwrap();
    *current = settings;
}

pub fn shutdown() {
    let settings = SETTINGS.read().unwrap();
    if settings.syslog {
        unsafe { libc::closelog() };
    }
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        {
            let current_level = $crate::logger::get_log_level();
            if $level <= current_level {
                $crate::logger::write_record($level, &format!($($arg)*));
            }
        }
    };
}

#[derive(Debug, PartialEq, PartialOrd, Clone, Copy, Eq, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn plain(&self) -> &'static str {
        match self {
            LogLevel::Error => "Error",
            LogLevel::Warn => "Warn",
            LogLevel::Info => "Info",
            LogLevel::Debug => "Debug",
            LogLevel::Trace => "Trace",
        }
    }

    fn syslog_priority(&self) -> libc::c_int {
        match self {
            LogLevel::Error => libc::LOG_ERR,
            LogLevel::Warn => libc::LOG_WARNING,
            LogLevel::Info => libc::LOG_INFO,
            LogLevel::Debug | LogLevel::Trace => libc::LOG_DEBUG,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let log_str = match self {
            LogLevel::Error => "Error".bold().red(),
            LogLevel::Warn => "Warn".bold().yellow(),
            LogLevel::Info => "Info".bold().green(),
            LogLevel::Debug => "Debug".bold().blue(),
            LogLevel::Trace => "Trace".bold().magenta(),
        };
        write!(f, "{}", log_str)
    }
}

/// Writes one record to the configured sink. Called through the `log!`
/// macro once the level filter passed.
pub fn write_record(level: LogLevel, message: &str) {
    let settings = SETTINGS.read().unwrap();

    if settings.quiet {
        return;
    }

    if settings.syslog {
        if let Ok(body) = std::ffi::CString::new(message) {
            unsafe {
                libc::syslog(
                    level.syslog_priority(),
                    b"%s\0".as_ptr() as *const libc::c_char,
                    body.as_ptr(),
                );
            }
        }
        return;
    }

    if settings.daemon {
        let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S");
        let line = format!("[{}] {} {}\n", level.plain(), timestamp, message);

        if let Some(path) = &settings.log_file {
            if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
                let _ = file.write_all(line.as_bytes());
                return;
            }
        }

        // fallback to stdout
        print!("{}", line);
        return;
    }

    println!("[{}]: {}", level, message);
}
