//! Persistent CLI settings
//!
//! Stored in ~/.cftun/config.json. Command-line flags override them.

use anyhow::{Context, Result};
use cftun_service::VerifyPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Saved defaults for every cftun invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Path of the cloudflared binary (defaults to `cloudflared` on PATH)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloudflared: Option<PathBuf>,
    /// Service directory override (defaults to the platform location)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_dir: Option<PathBuf>,
    /// Behaviour of `config verify` on drift
    #[serde(default)]
    pub verify_policy: VerifyPolicy,
}

/// Loads and saves [`Settings`]
pub struct SettingsManager {
    path: PathBuf,
}

impl SettingsManager {
    /// Settings at the default location
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(Self::at(home.join(".cftun").join("config.json")))
    }

    /// Settings stored at a specific file
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, falling back to defaults when the file doesn't exist
    pub fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }

        let json = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings file: {:?}", self.path))?;

        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse settings file: {:?}", self.path))
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create settings directory: {:?}", parent))?;
        }

        let json =
            serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;

        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write settings file: {:?}", self.path))
    }

    /// Load, modify and save in one step
    pub fn update(&self, change: impl FnOnce(&mut Settings)) -> Result<Settings> {
        let mut settings = self.load()?;
        change(&mut settings);
        self.save(&settings)?;
        Ok(settings)
    }

    /// Remove every saved setting
    pub fn clear(&self) -> Result<()> {
        self.save(&Settings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let manager = SettingsManager::at(temp.path().join("config.json"));
        let settings = manager.load().unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.verify_policy, VerifyPolicy::AutoFix);
    }

    #[test]
    fn test_update_persists() {
        let temp = TempDir::new().unwrap();
        let manager = SettingsManager::at(temp.path().join("nested").join("config.json"));

        manager
            .update(|s| s.cloudflared = Some(PathBuf::from("/opt/cloudflared")))
            .unwrap();
        manager
            .update(|s| s.verify_policy = VerifyPolicy::ReportOnly)
            .unwrap();

        let settings = manager.load().unwrap();
        assert_eq!(settings.cloudflared, Some(PathBuf::from("/opt/cloudflared")));
        assert_eq!(settings.verify_policy, VerifyPolicy::ReportOnly);

        let json = fs::read_to_string(manager.path()).unwrap();
        assert!(json.contains("\"report-only\""));
    }

    #[test]
    fn test_clear() {
        let temp = TempDir::new().unwrap();
        let manager = SettingsManager::at(temp.path().join("config.json"));
        manager
            .update(|s| s.service_dir = Some(PathBuf::from("/srv/cloudflared")))
            .unwrap();

        manager.clear().unwrap();
        assert_eq!(manager.load().unwrap(), Settings::default());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        let err = SettingsManager::at(&path).load().unwrap_err();
        assert!(err.to_string().contains("Failed to parse settings file"));
    }
}
