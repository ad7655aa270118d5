//! Reconciliation of the service config record
//!
//! The reconciler owns reads and writes of the single `config.yml` consumed by
//! the background cloudflared service. A record is in one of three states:
//! absent, present and parseable, or present but corrupt. Only
//! [`ConfigReconciler::reconcile`] (directly, or through `repair`/`verify`)
//! moves it to present-valid; nothing here ever deletes it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::location::{ServiceLocation, CONFIG_FILE_NAME};
use crate::record::{normalize_tunnel_id, ServiceConfig, ServiceRecord};
use crate::registry::{TunnelInfo, TunnelRegistry};

/// What `verify` does when it finds drift
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyPolicy {
    /// Rewrite the record with the expected values and report `auto_fixed`
    #[default]
    AutoFix,
    /// Only report; `verify` never touches the disk
    ReportOnly,
}

/// Reconciler settings
#[derive(Debug, Clone, Default)]
pub struct ReconcilerConfig {
    pub location: ServiceLocation,
    pub verify_policy: VerifyPolicy,
}

impl ReconcilerConfig {
    /// Reconcile the record inside `dir` instead of the platform location
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            location: ServiceLocation::Explicit(dir.into()),
            ..Default::default()
        }
    }

    pub fn with_verify_policy(mut self, policy: VerifyPolicy) -> Self {
        self.verify_policy = policy;
        self
    }
}

/// Result of reading the record
#[derive(Debug, Clone, PartialEq)]
pub enum RecordState {
    /// The service has never been configured
    Absent,
    Present(ServiceRecord),
}

/// A single discrepancy found by verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    Missing {
        path: PathBuf,
    },
    Unparseable {
        path: PathBuf,
        reason: String,
    },
    TunnelMismatch {
        expected: String,
        actual: Option<String>,
    },
    CredentialsMismatch {
        expected: PathBuf,
        actual: Option<PathBuf>,
    },
    UrlMismatch {
        expected: String,
        actual: Option<String>,
    },
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Problem::Missing { path } => write!(f, "Config file not found: {}", path.display()),
            Problem::Unparseable { path, reason } => {
                write!(f, "Config file {} is not valid YAML: {}", path.display(), reason)
            }
            Problem::TunnelMismatch { expected, actual } => write!(
                f,
                "Tunnel mismatch: expected {}, found {}",
                expected,
                actual.as_deref().unwrap_or("<unset>")
            ),
            Problem::CredentialsMismatch { expected, actual } => write!(
                f,
                "Credentials file mismatch: expected {}, found {}",
                expected.display(),
                actual
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<unset>".to_string())
            ),
            Problem::UrlMismatch { expected, actual } => write!(
                f,
                "URL mismatch: expected {}, found {}",
                expected,
                actual.as_deref().unwrap_or("<unset>")
            ),
        }
    }
}

/// Outcome of comparing the record against an expected tunnel identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// True when the record matched before any repair
    pub ok: bool,
    /// Every discrepancy found, in check order
    pub problems: Vec<Problem>,
    /// Whether the record was rewritten with the expected values
    pub auto_fixed: bool,
}

impl Verification {
    fn from_problems(problems: Vec<Problem>) -> Self {
        Self {
            ok: problems.is_empty(),
            problems,
            auto_fixed: false,
        }
    }

    /// Turn outstanding drift into a [`ReconcileError::FieldMismatch`]
    ///
    /// Drift that was already repaired is not an error.
    pub fn ensure_consistent(&self) -> Result<(), ReconcileError> {
        if self.ok || self.auto_fixed {
            Ok(())
        } else {
            Err(ReconcileError::FieldMismatch(self.problems.clone()))
        }
    }
}

/// Why `diagnose` could not load the record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFailure {
    /// The file exists but is not a YAML mapping
    Unparseable(String),
    /// The file could not be read at all (permissions, not a regular file)
    Unreadable(String),
}

/// Human-readable state of the service config
#[derive(Debug, Clone)]
pub struct Diagnosis {
    pub config_path: PathBuf,
    pub record: Result<RecordState, ReadFailure>,
    /// `None` when the record names no credentials file
    pub credentials_found: Option<bool>,
    /// Registry description of the configured tunnel, or why it is missing
    pub tunnel: Option<Result<TunnelInfo, String>>,
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Service config: {}", self.config_path.display())?;

        let record = match &self.record {
            Err(ReadFailure::Unparseable(reason)) => {
                return write!(f, "Status: unparseable ({})", reason)
            }
            Err(ReadFailure::Unreadable(reason)) => {
                return write!(f, "Status: unreadable ({})", reason)
            }
            Ok(RecordState::Absent) => {
                return write!(f, "Status: not found (the service has not been configured)")
            }
            Ok(RecordState::Present(record)) => record,
        };

        writeln!(f, "Status: present")?;
        writeln!(f, "  tunnel: {}", record.tunnel_id().as_deref().unwrap_or("<unset>"))?;
        match record.credentials_file() {
            Some(path) => {
                let found = if self.credentials_found == Some(true) {
                    "found"
                } else {
                    "missing"
                };
                writeln!(f, "  credentials-file: {} ({})", path.display(), found)?
            }
            None => writeln!(f, "  credentials-file: <unset>")?,
        }
        writeln!(f, "  url: {}", record.url().as_deref().unwrap_or("<unset>"))?;
        match record.warp_routing_enabled() {
            Some(enabled) => write!(f, "  warp-routing.enabled: {}", enabled)?,
            None => write!(f, "  warp-routing.enabled: <unset>")?,
        }

        match &self.tunnel {
            Some(Ok(info)) => {
                write!(f, "\nTunnel details:")?;
                for line in info.to_string().lines() {
                    write!(f, "\n  {}", line)?;
                }
            }
            Some(Err(reason)) => write!(f, "\nTunnel details unavailable: {}", reason)?,
            None => {}
        }
        Ok(())
    }
}

/// Keeps the service config record consistent with a desired tunnel identity
pub struct ConfigReconciler<R> {
    config: ReconcilerConfig,
    registry: R,
}

impl<R: TunnelRegistry> ConfigReconciler<R> {
    pub fn new(config: ReconcilerConfig, registry: R) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Path of the config record
    pub fn locate(&self) -> Result<PathBuf, ReconcileError> {
        self.config.location.config_path()
    }

    /// Directory holding the record and copied credentials
    pub fn service_dir(&self) -> Result<PathBuf, ReconcileError> {
        self.config.location.service_dir()
    }

    /// Load the current record
    pub fn read(&self) -> Result<RecordState, ReconcileError> {
        let path = self.locate()?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No service config at {:?}", path);
                return Ok(RecordState::Absent);
            }
            Err(source) => return Err(ReconcileError::Io { path, source }),
        };

        ServiceRecord::parse(&content)
            .map(RecordState::Present)
            .map_err(|source| ReconcileError::CorruptConfig { path, source })
    }

    /// Merge `desired` into the record and write it back
    ///
    /// The credentials file is copied into the service directory first. A
    /// corrupt record is replaced rather than merged. There is no rollback:
    /// if the record write fails the copied credentials stay behind.
    pub fn reconcile(&self, desired: &ServiceConfig) -> Result<PathBuf, ReconcileError> {
        let path = self.locate()?;

        let mut record = match self.read() {
            Ok(RecordState::Present(record)) => record,
            Ok(RecordState::Absent) => ServiceRecord::new(),
            Err(ReconcileError::CorruptConfig { source, .. }) => {
                warn!("Replacing unparseable service config {:?}: {}", path, source);
                ServiceRecord::new()
            }
            Err(e) => return Err(e),
        };
        record.apply(desired);

        let dir = self.service_dir()?;
        fs::create_dir_all(&dir).map_err(|source| ReconcileError::Io {
            path: dir.clone(),
            source,
        })?;

        self.copy_credentials(&desired.credentials_path, &dir)?;

        let yaml = record.to_yaml().map_err(ReconcileError::Serialize)?;
        fs::write(&path, yaml).map_err(|source| ReconcileError::Io {
            path: path.clone(),
            source,
        })?;

        info!(
            "Service config {:?} now points at tunnel {}",
            path, desired.tunnel_id
        );
        Ok(path)
    }

    /// Copy the credentials artifact next to the record, overwriting any copy
    ///
    /// A missing source is logged and skipped; `diagnose` reports it.
    fn copy_credentials(
        &self,
        source: &Path,
        dir: &Path,
    ) -> Result<Option<PathBuf>, ReconcileError> {
        if source.as_os_str().is_empty() {
            return Ok(None);
        }
        if !source.is_file() {
            warn!("Credentials file {:?} not found, not copying", source);
            return Ok(None);
        }
        let Some(file_name) = source.file_name() else {
            return Ok(None);
        };

        // Never let the copy land on the record itself
        let destination = if file_name == CONFIG_FILE_NAME {
            let renamed = format!("credentials-{}", CONFIG_FILE_NAME);
            warn!(
                "Credentials file {:?} clashes with the service config name, copying as {}",
                source, renamed
            );
            dir.join(renamed)
        } else {
            dir.join(file_name)
        };
        if same_file(source, &destination) {
            return Ok(Some(destination));
        }

        fs::copy(source, &destination).map_err(|e| ReconcileError::Io {
            path: destination.clone(),
            source: e,
        })?;
        debug!("Copied credentials {:?} -> {:?}", source, destination);
        Ok(Some(destination))
    }

    /// Compare the record with `expected` without touching the disk
    ///
    /// All problems are collected. An absent or unparseable record yields
    /// exactly one problem since there are no fields to compare.
    pub fn check(&self, expected: &ServiceConfig) -> Result<Verification, ReconcileError> {
        let problems = match self.read() {
            Ok(RecordState::Absent) => vec![Problem::Missing {
                path: self.locate()?,
            }],
            Ok(RecordState::Present(record)) => compare(&record, expected),
            Err(ReconcileError::CorruptConfig { path, source }) => vec![Problem::Unparseable {
                path,
                reason: source.to_string(),
            }],
            Err(e) => return Err(e),
        };
        Ok(Verification::from_problems(problems))
    }

    /// Rewrite the record with `expected`
    pub fn repair(&self, expected: &ServiceConfig) -> Result<PathBuf, ReconcileError> {
        self.reconcile(expected)
    }

    /// Check the record and, under [`VerifyPolicy::AutoFix`], repair drift
    ///
    /// With auto-fix `ok` still reports the state found before the repair.
    /// Repair failures propagate.
    pub fn verify(&self, expected: &ServiceConfig) -> Result<Verification, ReconcileError> {
        let mut verification = self.check(expected)?;
        if !verification.ok && self.config.verify_policy == VerifyPolicy::AutoFix {
            warn!(
                "Service config drifted ({} problem(s)), rewriting",
                verification.problems.len()
            );
            self.repair(expected)?;
            verification.auto_fixed = true;
        }
        Ok(verification)
    }

    /// Build a report of the record, its credentials and the registry's view
    ///
    /// Only a missing platform mapping is an error; every other failure is
    /// rendered into the report.
    pub fn diagnose(&self) -> Result<Diagnosis, ReconcileError> {
        let config_path = self.locate()?;

        let record = match self.read() {
            Ok(state) => Ok(state),
            Err(ReconcileError::CorruptConfig { source, .. }) => {
                Err(ReadFailure::Unparseable(source.to_string()))
            }
            Err(ReconcileError::Io { source, .. }) => {
                Err(ReadFailure::Unreadable(source.to_string()))
            }
            Err(e) => return Err(e),
        };

        let (credentials_found, tunnel) = match &record {
            Ok(RecordState::Present(record)) => {
                let credentials_found = record
                    .credentials_file()
                    .map(|path| check_credentials(&path).is_ok());
                let tunnel = record.tunnel_id().map(|id| {
                    self.registry
                        .tunnel_info(&id)
                        .map_err(|e| e.to_string())
                });
                (credentials_found, tunnel)
            }
            _ => (None, None),
        };

        Ok(Diagnosis {
            config_path,
            record,
            credentials_found,
            tunnel,
        })
    }
}

/// Fail with [`ReconcileError::CredentialsMissing`] unless `path` is a readable file
pub fn check_credentials(path: &Path) -> Result<(), ReconcileError> {
    match fs::File::open(path) {
        Ok(file) if file.metadata().map(|m| m.is_file()).unwrap_or(false) => Ok(()),
        _ => Err(ReconcileError::CredentialsMissing(path.to_path_buf())),
    }
}

fn compare(record: &ServiceRecord, expected: &ServiceConfig) -> Vec<Problem> {
    let mut problems = Vec::new();

    let actual_tunnel = record.tunnel_id();
    let expected_tunnel = normalize_tunnel_id(&expected.tunnel_id);
    if actual_tunnel.as_deref().map(normalize_tunnel_id) != Some(expected_tunnel) {
        problems.push(Problem::TunnelMismatch {
            expected: expected.tunnel_id.clone(),
            actual: actual_tunnel,
        });
    }

    let actual_credentials = record.credentials_file();
    if actual_credentials.as_deref() != Some(expected.credentials_path.as_path()) {
        problems.push(Problem::CredentialsMismatch {
            expected: expected.credentials_path.clone(),
            actual: actual_credentials,
        });
    }

    if let Some(expected_url) = &expected.target_url {
        let actual_url = record.url();
        if actual_url.as_deref().map(str::trim) != Some(expected_url.trim()) {
            problems.push(Problem::UrlMismatch {
                expected: expected_url.clone(),
                actual: actual_url,
            });
        }
    }

    problems
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
