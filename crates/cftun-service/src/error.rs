//! Error types
//!
//! Failures of the `cloudflared` binary or of the OS service manager are the
//! "external call" failures: [`RegistryError`] and [`ServiceError`] carry the
//! command line and its stderr so callers can render them as report lines.

use std::path::PathBuf;
use thiserror::Error;

use crate::reconciler::Problem;

/// Errors raised while locating, reading or rewriting the service record
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("No service configuration location is known for platform '{0}'")]
    LocationUnavailable(String),

    #[error("Service config {path:?} could not be parsed: {source}")]
    CorruptConfig {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Credentials file not found or unreadable: {0:?}")]
    CredentialsMissing(PathBuf),

    #[error("Service config disagrees with the expected tunnel: {}", join_problems(.0))]
    FieldMismatch(Vec<Problem>),

    #[error("I/O error accessing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize service config: {0}")]
    Serialize(#[source] serde_yaml::Error),
}

fn join_problems(problems: &[Problem]) -> String {
    problems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from invoking the `cloudflared` binary
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to execute `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Unexpected output from `{command}`: {source}")]
    Decode {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Tunnel '{0}' not found")]
    TunnelNotFound(String),
}

/// Errors from the host service manager
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service {0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("Service {0} requires administrator/root privileges")]
    NotPrivileged(&'static str),

    #[error("Failed to execute `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("I/O error accessing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from work offloaded to the blocking thread pool
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Background task did not complete: {0}")]
    Join(#[from] tokio::task::JoinError),
}
