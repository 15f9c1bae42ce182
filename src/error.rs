//! Error taxonomy for the build engine.
//!
//! Library code propagates `anyhow::Result` with context (most failures are
//! only interesting as text), but the handful of failure kinds that drive
//! process exit codes are typed here so the binary can map them reliably.

use std::path::PathBuf;

use thiserror::Error;

/// Typed failure kinds with a defined exit code.
#[derive(Debug, Error)]
pub enum Error {
    /// Another process holds the build lock.
    #[error("another darch process is already running{}\nlock file: {}", holder_desc(.holder), .lock_path.display())]
    AlreadyRunning {
        lock_path: PathBuf,
        /// Holder description read from the lock metadata, if readable.
        holder: Option<String>,
    },

    /// A required tool or path is absent.
    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(String),

    /// A child process exited non-zero.
    #[error("command failed: {}\nexit code: {}{}", .argv.join(" "), code_desc(.code), stderr_desc(.stderr_tail))]
    CommandFailed {
        argv: Vec<String>,
        code: Option<i32>,
        stderr_tail: String,
    },

    /// A generation's config.json exists but cannot be parsed.
    #[error("invalid manifest at {}: {}", .path.display(), .reason)]
    ManifestInvalid { path: PathBuf, reason: String },

    /// Internal state that should be impossible (e.g. numbering clashes).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl Error {
    /// Process exit code for this failure kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::MissingPrerequisite(_) | Error::ManifestInvalid { .. } => 1,
            Error::AlreadyRunning { .. } => 2,
            Error::CommandFailed { .. } => 3,
            Error::InvariantViolation(_) => 4,
        }
    }
}

fn holder_desc(holder: &Option<String>) -> String {
    match holder {
        Some(h) => format!(" ({h})"),
        None => String::new(),
    }
}

fn code_desc(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "killed by signal".to_string(),
    }
}

fn stderr_desc(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!("\nstderr:\n{tail}")
    }
}

/// Exit code for an error chain: the innermost typed [`Error`] decides,
/// anything untyped is a user/configuration error.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<Error>().map(Error::exit_code).unwrap_or(1)
}
