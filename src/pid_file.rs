// src/pid_file.rs

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::errors::{Errors, NyxError};
use crate::log;
use crate::logger::LogLevel;
use crate::watch::Watch;

/// Location of a watch's PID file: the configured override, or
/// `<runtime_dir>/pids/<name>`.
pub fn path_for(watch: &Watch, runtime_dir: &Path) -> PathBuf {
    match &watch.pid_file {
        Some(custom) => PathBuf::from(custom),
        None => runtime_dir.join("pids").join(&watch.name),
    }
}

fn pid_file_error(path: &Path, err: io::Error) -> NyxError {
    NyxError::new(Errors::PidFile, format!("{}: {}", path.display(), err))
}

/// Writes the PID file atomically: the record lands in a temporary file in
/// the same directory and is renamed over the final name. The file holds a
/// single decimal line.
pub fn write_pid(pid: i32, watch: &Watch, runtime_dir: &Path) -> Result<(), NyxError> {
    let path = path_for(watch, runtime_dir);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| pid_file_error(&path, err))?;
    }

    let mut tmp = path.clone();
    match tmp.file_name().and_then(|n| n.to_str()) {
        Some(name) => tmp.set_file_name(format!("{}.tmp", name)),
        None => tmp.set_file_name("pid.tmp"),
    };

    fs::write(&tmp, format!("{}\n", pid)).map_err(|err| pid_file_error(&tmp, err))?;
    fs::rename(&tmp, &path).map_err(|err| pid_file_error(&path, err))?;

    Ok(())
}

/// Reads a recorded PID. A missing file yields `None`; an unreadable or
/// non-numeric file is deleted and also yields `None`.
pub fn read_pid(watch: &Watch, runtime_dir: &Path) -> Option<i32> {
    let path = path_for(watch, runtime_dir);

    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(_) => return None,
    };

    match content.trim().parse::<i32>() {
        Ok(pid) if pid >= 0 => Some(pid),
        _ => {
            log!(
                LogLevel::Warn,
                "watch '{}': corrupt pid file {:?} - removing",
                watch.name,
                path
            );
            let _ = fs::remove_file(&path);
            None
        }
    }
}

/// Removes a watch's PID file if present.
pub fn remove_pid(watch: &Watch, runtime_dir: &Path) {
    let path = path_for(watch, runtime_dir);
    if path.exists() {
        if let Err(err) = fs::remove_file(&path) {
            log!(
                LogLevel::Warn,
                "watch '{}': failed to remove pid file {:?}: {}",
                watch.name,
                path,
                err
            );
        }
    }
}
