// src/watch.rs

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Errors, NyxError};
use crate::log;
use crate::logger::LogLevel;

/// Fallback grace period before a stubborn process is killed, in seconds.
pub const DEFAULT_STOP_TIMEOUT: u64 = 5;

/// The kernel truncates /proc/<pid>/comm to this many characters.
const TASK_COMM_LEN: usize = 15;

/// Declarative description of one supervised service. Immutable for the
/// lifetime of a configuration generation; a reload produces fresh records.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
pub struct Watch {
    /// Numeric identifier, unique within one configuration generation.
    /// This is the key the forker resolves requests against; it may change
    /// across reloads while `name` stays stable.
    pub id: i32,

    /// Unique name of the watch; also names the PID file.
    pub name: String,

    /// Command line used to launch the service. `start[0]` is the
    /// executable looked up via PATH.
    pub start: Vec<String>,

    /// Optional custom stop command. When set, stopping runs this argv with
    /// `NYX_PID` pointing at the process to be stopped instead of sending
    /// SIGTERM directly.
    pub stop: Option<Vec<String>>,

    /// Working directory of the service. Empty means `/` in system mode or
    /// the runtime directory in local mode.
    pub dir: Option<String>,

    /// User the service is started as, resolved against the user database.
    pub uid: Option<String>,

    /// Group the service is started as. Defaults to the primary group of
    /// `uid` when only the user is given.
    pub gid: Option<String>,

    /// Override for the PID file location.
    pub pid_file: Option<String>,

    /// File receiving the service's stdout (append mode).
    pub log_file: Option<String>,

    /// File receiving the service's stderr (append mode).
    pub error_file: Option<String>,

    /// Additional environment passed to the service.
    pub env: HashMap<String, String>,

    /// HTTP health endpoint path, checked against `http_check_port`.
    pub http_check: Option<String>,

    /// Port the HTTP health check connects to.
    pub http_check_port: Option<u16>,

    /// TCP port expected to accept connections while the service runs.
    pub port_check: Option<u16>,

    /// Observed CPU ceiling in percent of one CPU. Exceeding it stops and
    /// restarts the service.
    pub max_cpu: Option<u32>,

    /// Observed resident memory ceiling in bytes.
    pub max_memory: Option<u64>,

    /// Seconds to wait for a stopped process to exit before SIGKILL.
    pub stop_timeout: u64,

    /// Seconds after a spawn before liveness and health checks count.
    pub startup_delay: u64,
}

impl Watch {
    /// Basename of the start executable, used for `/proc/<pid>/comm`
    /// matching during PID adoption.
    pub fn executable(&self) -> &str {
        let exe = self.start.first().map(String::as_str).unwrap_or("");
        exe.rsplit('/').next().unwrap_or(exe)
    }

    /// Whether `comm` (as read from /proc) belongs to this watch's
    /// executable, honoring the kernel's comm truncation.
    pub fn matches_comm(&self, comm: &str) -> bool {
        let base = self.executable();
        let truncated: String = base.chars().take(TASK_COMM_LEN).collect();
        comm == base || comm == truncated
    }

    /// Compares everything except the generation-scoped `id`. Used by the
    /// reload diff to decide whether a watch needs a restart.
    pub fn same_spec(&self, other: &Watch) -> bool {
        let mut left = self.clone();
        let mut right = other.clone();
        left.id = 0;
        right.id = 0;
        left == right
    }

    pub fn validate(&self) -> Result<(), NyxError> {
        if self.name.is_empty() {
            return Err(NyxError::new(Errors::Config, "watch name must not be empty"));
        }

        match self.start.first() {
            None => {
                return Err(NyxError::new(
                    Errors::Config,
                    format!("watch '{}' has no start command", self.name),
                ))
            }
            Some(exe) if exe.is_empty() => {
                return Err(NyxError::new(
                    Errors::Config,
                    format!("watch '{}' has an empty start executable", self.name),
                ))
            }
            Some(_) => {}
        }

        if let Some(stop) = &self.stop {
            if stop.first().map(String::is_empty).unwrap_or(true) {
                return Err(NyxError::new(
                    Errors::Config,
                    format!("watch '{}' has an empty stop command", self.name),
                ));
            }
        }

        if self.http_check.is_some() && self.http_check_port.is_none() {
            return Err(NyxError::new(
                Errors::Config,
                format!("watch '{}' sets http_check without http_check_port", self.name),
            ));
        }

        Ok(())
    }

    /// Logs a short summary of the watch at debug level.
    pub fn dump(&self) {
        log!(
            LogLevel::Debug,
            "watch '{}' (id {}): start {:?}, uid {:?}, dir {:?}",
            self.name,
            self.id,
            self.start,
            self.uid,
            self.dir
        );
    }
}
