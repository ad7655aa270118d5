//! Tunnel registry access through the `cloudflared` binary
//!
//! Every operation is a one-shot subprocess call. Listings are requested as
//! JSON; `tunnel info` output is only parsed best-effort.

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::exec::{describe, stderr_or_stdout};
use crate::location;

/// Read access to the tunnels known to the Cloudflare account
#[cfg_attr(test, mockall::automock)]
pub trait TunnelRegistry {
    /// All tunnels of the logged-in account
    fn list_tunnels(&self) -> Result<Vec<TunnelSummary>, RegistryError>;

    /// Details of a single tunnel
    fn tunnel_info(&self, tunnel_id: &str) -> Result<TunnelInfo, RegistryError>;
}

/// One entry of `cloudflared tunnel list --output json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
}

impl TunnelSummary {
    /// Where cloudflared stored this tunnel's credentials
    ///
    /// Falls back to `~/.cloudflared/<id>.json`, the location
    /// `cloudflared tunnel create` uses.
    pub fn credentials_path(&self) -> Option<PathBuf> {
        self.credentials_file
            .clone()
            .or_else(|| location::default_credentials_path(&self.id))
    }
}

/// Best-effort view of `cloudflared tunnel info` output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TunnelInfo {
    /// `key: value` pairs with lower-cased keys
    pub fields: BTreeMap<String, String>,
    /// Rows of the connector table, if one was printed
    pub connectors: usize,
    /// Unparsed output
    pub raw: String,
}

impl TunnelInfo {
    /// Parse JSON or the human-readable table output
    pub fn parse(output: &str) -> Self {
        let raw = output.trim().to_string();
        let mut info = TunnelInfo {
            raw: raw.clone(),
            ..Default::default()
        };

        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(&raw) {
            for (key, value) in map {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Array(items) if key == "conns" || key == "connectors" => {
                        info.connectors = items.len();
                        continue;
                    }
                    other => other.to_string(),
                };
                info.fields.insert(key.to_lowercase(), value);
            }
            return info;
        }

        let mut in_connector_table = false;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if in_connector_table {
                info.connectors += 1;
            } else if line.contains("CONNECTOR ID") {
                in_connector_table = true;
            } else if let Some((key, value)) = line.split_once(':') {
                info.fields
                    .insert(key.trim().to_lowercase(), value.trim().to_string());
            }
        }

        info
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

impl fmt::Display for TunnelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fields.is_empty() {
            return write!(f, "{}", self.raw);
        }
        let mut first = true;
        for (key, value) in &self.fields {
            if !first {
                writeln!(f)?;
            }
            first = false;
            write!(f, "{}: {}", key, value)?;
        }
        if self.connectors > 0 {
            write!(f, "\nconnectors: {}", self.connectors)?;
        }
        Ok(())
    }
}

/// The `cloudflared` command-line tool
#[derive(Debug, Clone)]
pub struct CloudflaredCli {
    binary: PathBuf,
}

impl CloudflaredCli {
    /// Use `cloudflared` from `PATH`
    pub fn new() -> Self {
        Self::with_binary("cloudflared")
    }

    /// Use a specific binary
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command
    }

    /// Run to completion and return stdout, failing on a non-zero exit
    fn run(&self, mut command: Command) -> Result<String, RegistryError> {
        let rendered = describe(&command);
        debug!("Running {}", rendered);

        let output = command.output().map_err(|source| RegistryError::Spawn {
            command: rendered.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(RegistryError::CommandFailed {
                command: rendered,
                status: output.status.to_string(),
                stderr: stderr_or_stdout(&output),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// `cloudflared --version`
    pub fn version(&self) -> Result<String, RegistryError> {
        Ok(self.run(self.command(["--version"]))?.trim().to_string())
    }

    /// Whether a working cloudflared binary is reachable
    pub fn is_installed(&self) -> bool {
        self.version()
            .map(|v| v.to_lowercase().contains("cloudflared"))
            .unwrap_or(false)
    }

    /// `cloudflared tunnel login`; opens a browser and waits for the user
    pub fn login(&self) -> Result<(), RegistryError> {
        let mut command = self.command(["tunnel", "login"]);
        let rendered = describe(&command);
        let status = command
            .status()
            .map_err(|source| RegistryError::Spawn {
                command: rendered.clone(),
                source,
            })?;
        if !status.success() {
            return Err(RegistryError::CommandFailed {
                command: rendered,
                status: status.to_string(),
                stderr: String::new(),
            });
        }
        Ok(())
    }

    /// Create a tunnel and return its registry entry
    pub fn create_tunnel(&self, name: &str) -> Result<TunnelSummary, RegistryError> {
        self.run(self.command(["tunnel", "create", name]))?;
        info!("Created tunnel '{}'", name);
        self.find_by_name(name)?
            .ok_or_else(|| RegistryError::TunnelNotFound(name.to_string()))
    }

    /// Delete a tunnel by id or name
    pub fn delete_tunnel(&self, tunnel: &str) -> Result<(), RegistryError> {
        self.run(self.command(["tunnel", "delete", tunnel]))?;
        info!("Deleted tunnel '{}'", tunnel);
        Ok(())
    }

    /// Look up a tunnel by its name
    pub fn find_by_name(&self, name: &str) -> Result<Option<TunnelSummary>, RegistryError> {
        Ok(self
            .list_tunnels()?
            .into_iter()
            .find(|tunnel| tunnel.name == name))
    }

    /// Point a DNS hostname at the tunnel
    pub fn route_dns(&self, tunnel: &str, hostname: &str) -> Result<(), RegistryError> {
        self.run(self.command(["tunnel", "route", "dns", tunnel, hostname]))?;
        info!("Routed {} to tunnel {}", hostname, tunnel);
        Ok(())
    }

    /// Route a private network range through the tunnel
    pub fn route_ip(&self, network: &IpNetwork, tunnel: &str) -> Result<(), RegistryError> {
        let cidr = network.to_string();
        self.run(self.command(["tunnel", "route", "ip", "add", cidr.as_str(), tunnel]))?;
        info!("Routed {} to tunnel {}", cidr, tunnel);
        Ok(())
    }

    /// Start `cloudflared tunnel run <id>` in the foreground of a child process
    pub fn run_tunnel(&self, tunnel: &str) -> Result<Child, RegistryError> {
        let mut command = self.command(["tunnel", "run", tunnel]);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let rendered = describe(&command);
        let child = command.spawn().map_err(|source| RegistryError::Spawn {
            command: rendered,
            source,
        })?;
        info!("Tunnel {} running with PID {}", tunnel, child.id());
        Ok(child)
    }
}

impl Default for CloudflaredCli {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelRegistry for CloudflaredCli {
    fn list_tunnels(&self) -> Result<Vec<TunnelSummary>, RegistryError> {
        let command = self.command(["tunnel", "list", "--output", "json"]);
        let rendered = describe(&command);
        let stdout = self.run(command)?;
        parse_tunnel_list(&stdout).map_err(|source| RegistryError::Decode {
            command: rendered,
            source,
        })
    }

    fn tunnel_info(&self, tunnel_id: &str) -> Result<TunnelInfo, RegistryError> {
        let stdout = self.run(self.command(["tunnel", "info", tunnel_id]))?;
        Ok(TunnelInfo::parse(&stdout))
    }
}

/// Decode `tunnel list` JSON; blank output means no tunnels
pub fn parse_tunnel_list(stdout: &str) -> Result<Vec<TunnelSummary>, serde_json::Error> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed)
}
