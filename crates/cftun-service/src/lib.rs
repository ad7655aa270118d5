//! Service configuration management for cloudflared
//!
//! Keeps the configuration record consumed by the background cloudflared
//! service in line with the tunnel an operator selected, and wraps the two
//! external collaborators involved: the `cloudflared` binary (tunnel registry)
//! and the host service manager (systemd, launchd, or the Windows SCM).

pub mod error;
pub mod location;
pub mod reconciler;
pub mod record;
pub mod registry;
pub mod service;
pub mod task;

mod exec;

pub use error::{ReconcileError, RegistryError, ServiceError, TaskError};
pub use location::ServiceLocation;
pub use reconciler::{
    ConfigReconciler, Diagnosis, Problem, ReadFailure, ReconcilerConfig, RecordState,
    Verification, VerifyPolicy,
};
pub use record::{normalize_tunnel_id, ServiceConfig, ServiceRecord};
pub use registry::{CloudflaredCli, TunnelInfo, TunnelRegistry, TunnelSummary};
pub use service::{clean_service_files, ServiceController, ServiceStatus, SystemService};
pub use task::run_blocking;
