//! Resolution of the directory holding the service's config record
//!
//! cloudflared installed as a system service reads its config from a fixed,
//! per-OS directory. Tests and unusual installs pass an explicit directory
//! instead.

use std::path::PathBuf;

use crate::error::ReconcileError;

/// File name of the service config record inside the service directory
pub const CONFIG_FILE_NAME: &str = "config.yml";

/// Where the service config record lives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ServiceLocation {
    /// The directory cloudflared's service installer uses on this OS
    #[default]
    Platform,
    /// A caller-chosen directory
    Explicit(PathBuf),
}

impl ServiceLocation {
    /// Directory that holds the config record and the copied credentials
    pub fn service_dir(&self) -> Result<PathBuf, ReconcileError> {
        match self {
            ServiceLocation::Explicit(dir) => Ok(dir.clone()),
            ServiceLocation::Platform => platform_service_dir(std::env::consts::OS)
                .ok_or_else(|| {
                    ReconcileError::LocationUnavailable(std::env::consts::OS.to_string())
                }),
        }
    }

    /// Full path of the config record
    pub fn config_path(&self) -> Result<PathBuf, ReconcileError> {
        Ok(self.service_dir()?.join(CONFIG_FILE_NAME))
    }
}

/// Service directory for a given `std::env::consts::OS` value
pub fn platform_service_dir(os: &str) -> Option<PathBuf> {
    match os {
        "linux" => Some(PathBuf::from("/etc/cloudflared")),
        "macos" => Some(PathBuf::from("/usr/local/etc/cloudflared")),
        "windows" => {
            let windir = std::env::var("WINDIR").unwrap_or_else(|_| "C:\\Windows".to_string());
            Some(
                PathBuf::from(windir)
                    .join("System32")
                    .join("config")
                    .join("systemprofile")
                    .join(".cloudflared"),
            )
        }
        _ => None,
    }
}

/// The per-user cloudflared directory (`~/.cloudflared`)
///
/// `cloudflared tunnel create` writes credentials here, and the interactive
/// `cloudflared tunnel run` reads `config.yml` from here.
pub fn user_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cloudflared"))
}

/// Where `cloudflared tunnel create` puts a tunnel's credentials:
/// `~/.cloudflared/<id>.json`
pub fn default_credentials_path(tunnel_id: &str) -> Option<PathBuf> {
    user_dir().map(|dir| dir.join(format!("{}.json", tunnel_id)))
}
