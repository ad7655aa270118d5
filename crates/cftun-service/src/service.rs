//! cloudflared system service control for Linux (systemd), macOS (launchd)
//! and Windows (service control manager)

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::{info, warn};

use crate::error::ServiceError;
use crate::exec::{describe, stderr_or_stdout};

/// Lifecycle operations on the background cloudflared service
pub trait ServiceController {
    /// Whether this platform has a known service manager
    fn is_supported(&self) -> bool;

    /// Whether the current process may change the system service
    fn is_privileged(&self) -> bool;

    fn install(&self) -> Result<(), ServiceError>;

    fn uninstall(&self) -> Result<(), ServiceError>;

    fn start(&self) -> Result<(), ServiceError>;

    fn stop(&self) -> Result<(), ServiceError>;

    /// Stop (ignoring failures, the service may not be running) then start
    fn restart(&self) -> Result<(), ServiceError> {
        if let Err(e) = self.stop() {
            warn!("Stop before restart failed: {}", e);
        }
        self.start()
    }

    fn status(&self) -> Result<ServiceStatus, ServiceError>;

    /// Last `lines` lines of the service log
    fn logs(&self, lines: usize) -> Result<String, ServiceError>;
}

/// Platform type
#[derive(Debug, Clone, Copy, PartialEq)]
#[allow(dead_code)] // Platform variants are conditionally used based on target OS
enum Platform {
    MacOS,
    Linux,
    Windows,
    Unsupported,
}

const SYSTEMD_UNIT: &str = "cloudflared";
const SYSTEMD_UNIT_PATH: &str = "/etc/systemd/system/cloudflared.service";
const LAUNCHD_LABEL: &str = "com.cloudflare.cloudflared";
const LAUNCHD_ERR_LOG: &str = "/Library/Logs/com.cloudflare.cloudflared.err.log";
const WINDOWS_SERVICE: &str = "Cloudflared";

/// Windows `sc.exe` exit code for a service that does not exist
const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;

/// The cloudflared service as managed by the host OS
pub struct SystemService {
    platform: Platform,
    cloudflared: PathBuf,
}

impl SystemService {
    /// Service controller for the current platform, using `cloudflared` from `PATH`
    pub fn new() -> Self {
        Self::with_cloudflared("cloudflared")
    }

    /// Service controller using a specific cloudflared binary for install/uninstall
    pub fn with_cloudflared(cloudflared: impl Into<PathBuf>) -> Self {
        Self {
            platform: Self::detect_platform(),
            cloudflared: cloudflared.into(),
        }
    }

    fn detect_platform() -> Platform {
        #[cfg(target_os = "macos")]
        {
            Platform::MacOS
        }
        #[cfg(target_os = "linux")]
        {
            Platform::Linux
        }
        #[cfg(target_os = "windows")]
        {
            Platform::Windows
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            Platform::Unsupported
        }
    }

    /// Fail unless the caller can modify the system service
    ///
    /// cloudflared installs a per-user launch agent on macOS, so only
    /// systemd and the Windows SCM need elevation.
    fn require_privileges(&self, operation: &'static str) -> Result<(), ServiceError> {
        if !self.is_supported() {
            return Err(ServiceError::Unsupported(operation));
        }
        if self.platform != Platform::MacOS && !self.is_privileged() {
            return Err(ServiceError::NotPrivileged(operation));
        }
        Ok(())
    }

    fn launchd_plist_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(format!(
            "/Library/LaunchDaemons/{}.plist",
            LAUNCHD_LABEL
        ))];
        if let Some(home) = dirs::home_dir() {
            paths.push(
                home.join("Library")
                    .join("LaunchAgents")
                    .join(format!("{}.plist", LAUNCHD_LABEL)),
            );
        }
        paths
    }

    fn cloudflared_service(&self, action: &str) -> Result<(), ServiceError> {
        let mut command = Command::new(&self.cloudflared);
        command.arg("service").arg(action);
        checked(&mut command)?;
        Ok(())
    }
}

impl ServiceController for SystemService {
    fn is_supported(&self) -> bool {
        self.platform != Platform::Unsupported
    }

    fn is_privileged(&self) -> bool {
        match self.platform {
            #[cfg(unix)]
            Platform::Linux | Platform::MacOS => unsafe { libc::geteuid() == 0 },
            // `net session` only succeeds from an elevated prompt
            Platform::Windows => Command::new("net")
                .arg("session")
                .output()
                .map(|output| output.status.success())
                .unwrap_or(false),
            _ => false,
        }
    }

    fn install(&self) -> Result<(), ServiceError> {
        self.require_privileges("install")?;
        self.cloudflared_service("install")?;
        info!("cloudflared service installed");
        Ok(())
    }

    fn uninstall(&self) -> Result<(), ServiceError> {
        self.require_privileges("uninstall")?;
        if let Err(e) = self.stop() {
            warn!("Stop before uninstall failed: {}", e);
        }
        self.cloudflared_service("uninstall")?;
        info!("cloudflared service uninstalled");
        Ok(())
    }

    fn start(&self) -> Result<(), ServiceError> {
        self.require_privileges("start")?;
        let mut command = match self.platform {
            Platform::Linux => systemctl(["start", SYSTEMD_UNIT]),
            Platform::MacOS => launchctl(["start", LAUNCHD_LABEL]),
            Platform::Windows => sc(["start", WINDOWS_SERVICE]),
            Platform::Unsupported => unreachable!(),
        };
        checked(&mut command)?;
        info!("cloudflared service started");
        Ok(())
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.require_privileges("stop")?;
        let mut command = match self.platform {
            Platform::Linux => systemctl(["stop", SYSTEMD_UNIT]),
            Platform::MacOS => launchctl(["stop", LAUNCHD_LABEL]),
            Platform::Windows => sc(["stop", WINDOWS_SERVICE]),
            Platform::Unsupported => unreachable!(),
        };
        checked(&mut command)?;
        info!("cloudflared service stopped");
        Ok(())
    }

    fn status(&self) -> Result<ServiceStatus, ServiceError> {
        match self.platform {
            Platform::Linux => {
                if !Path::new(SYSTEMD_UNIT_PATH).exists() {
                    return Ok(ServiceStatus::NotInstalled);
                }
                let output = run(&mut systemctl(["is-active", SYSTEMD_UNIT]))?;
                let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
                Ok(match state.as_str() {
                    "active" => ServiceStatus::Running,
                    _ => ServiceStatus::Stopped,
                })
            }
            Platform::MacOS => {
                if !Self::launchd_plist_paths().iter().any(|p| p.exists()) {
                    return Ok(ServiceStatus::NotInstalled);
                }
                let output = run(&mut launchctl(["list", LAUNCHD_LABEL]))?;
                if output.status.success() {
                    Ok(ServiceStatus::Running)
                } else {
                    Ok(ServiceStatus::Stopped)
                }
            }
            Platform::Windows => {
                let output = run(&mut sc(["query", WINDOWS_SERVICE]))?;
                if output.status.code() == Some(ERROR_SERVICE_DOES_NOT_EXIST) {
                    return Ok(ServiceStatus::NotInstalled);
                }
                let stdout = String::from_utf8_lossy(&output.stdout);
                if stdout.contains("RUNNING") {
                    Ok(ServiceStatus::Running)
                } else {
                    Ok(ServiceStatus::Stopped)
                }
            }
            Platform::Unsupported => Ok(ServiceStatus::NotInstalled),
        }
    }

    fn logs(&self, lines: usize) -> Result<String, ServiceError> {
        let mut command = match self.platform {
            Platform::Linux => {
                let mut command = Command::new("journalctl");
                command
                    .args(["-u", SYSTEMD_UNIT, "-n"])
                    .arg(lines.to_string())
                    .arg("--no-pager");
                command
            }
            Platform::MacOS => {
                if !Path::new(LAUNCHD_ERR_LOG).exists() {
                    return Ok("No logs available".to_string());
                }
                let mut command = Command::new("tail");
                command.arg("-n").arg(lines.to_string()).arg(LAUNCHD_ERR_LOG);
                command
            }
            Platform::Windows | Platform::Unsupported => {
                return Err(ServiceError::Unsupported("logs"))
            }
        };
        let output = checked(&mut command)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for SystemService {
    fn default() -> Self {
        Self::new()
    }
}

fn systemctl<const N: usize>(args: [&str; N]) -> Command {
    let mut command = Command::new("systemctl");
    command.args(args);
    command
}

fn launchctl<const N: usize>(args: [&str; N]) -> Command {
    let mut command = Command::new("launchctl");
    command.args(args);
    command
}

fn sc<const N: usize>(args: [&str; N]) -> Command {
    let mut command = Command::new("sc.exe");
    command.args(args);
    command
}

fn run(command: &mut Command) -> Result<Output, ServiceError> {
    command.output().map_err(|source| ServiceError::Spawn {
        command: describe(command),
        source,
    })
}

fn checked(command: &mut Command) -> Result<Output, ServiceError> {
    let output = run(command)?;
    if !output.status.success() {
        return Err(ServiceError::CommandFailed {
            command: describe(command),
            stderr: stderr_or_stdout(&output),
        });
    }
    Ok(output)
}

/// Remove the whole service directory (config record and copied credentials)
///
/// Returns `false` when there was nothing to remove.
pub fn clean_service_files(service_dir: &Path) -> Result<bool, ServiceError> {
    match fs::remove_dir_all(service_dir) {
        Ok(()) => {
            info!("Removed service directory {:?}", service_dir);
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(ServiceError::Io {
            path: service_dir.to_path_buf(),
            source,
        }),
    }
}

/// Service status
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServiceStatus {
    Running,
    Stopped,
    NotInstalled,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Running => write!(f, "Running ✅"),
            ServiceStatus::Stopped => write!(f, "Stopped"),
            ServiceStatus::NotInstalled => write!(f, "Not installed"),
        }
    }
}
