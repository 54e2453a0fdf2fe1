// src/errors.rs

use std::fmt;
use std::io;

/// Classification of everything that can go wrong inside the supervisor.
/// The kind decides the process exit code: configuration problems exit
/// with 1, runtime failures with 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errors {
    Config,
    InputOutput,
    Process,
    Forker,
    PidFile,
    User,
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Errors::Config => "config",
            Errors::InputOutput => "io",
            Errors::Process => "process",
            Errors::Forker => "forker",
            Errors::PidFile => "pid-file",
            Errors::User => "user",
        };
        write!(f, "{}", name)
    }
}

/// A single error record: a kind plus a human readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NyxError {
    pub kind: Errors,
    pub message: String,
}

impl NyxError {
    pub fn new<S: Into<String>>(kind: Errors, message: S) -> Self {
        NyxError {
            kind,
            message: message.into(),
        }
    }

    /// Whether this error belongs to the configuration class (exit code 1)
    /// as opposed to a runtime failure (exit code 2).
    pub fn is_config(&self) -> bool {
        self.kind == Errors::Config
    }
}

impl fmt::Display for NyxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for NyxError {}

impl From<io::Error> for NyxError {
    fn from(err: io::Error) -> Self {
        NyxError::new(Errors::InputOutput, err.to_string())
    }
}

impl From<nix::Error> for NyxError {
    fn from(err: nix::Error) -> Self {
        NyxError::new(Errors::Process, err.to_string())
    }
}

impl From<toml::de::Error> for NyxError {
    fn from(err: toml::de::Error) -> Self {
        NyxError::new(Errors::Config, err.to_string())
    }
}

#[cfg(target_os = "linux")]
impl From<procfs::ProcError> for NyxError {
    fn from(err: procfs::ProcError) -> Self {
        NyxError::new(Errors::Process, err.to_string())
    }
}
