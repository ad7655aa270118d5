//! The service config record
//!
//! cloudflared's `config.yml` is kept as a generic YAML mapping so that keys
//! this crate does not manage (ingress rules, log levels, protocol settings)
//! survive every rewrite.

use serde::de::Error as _;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const TUNNEL_KEY: &str = "tunnel";
pub const CREDENTIALS_KEY: &str = "credentials-file";
pub const URL_KEY: &str = "url";
pub const WARP_ROUTING_KEY: &str = "warp-routing";
pub const ENABLED_KEY: &str = "enabled";

/// Tunnel identity the service should run
///
/// Used both as the desired state handed to a reconciliation and as the
/// expected state a verification compares against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Tunnel UUID (or name) assigned by Cloudflare
    pub tunnel_id: String,
    /// Path of the tunnel credentials JSON
    pub credentials_path: PathBuf,
    /// Origin the tunnel proxies to; unset means private-network routing
    pub target_url: Option<String>,
    /// `warp-routing.enabled`, only written when set
    pub warp_routing_enabled: Option<bool>,
}

impl ServiceConfig {
    pub fn new(tunnel_id: impl Into<String>, credentials_path: impl Into<PathBuf>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            credentials_path: credentials_path.into(),
            target_url: None,
            warp_routing_enabled: None,
        }
    }

    /// Set the origin URL
    pub fn with_target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    /// Set `warp-routing.enabled`
    pub fn with_warp_routing(mut self, enabled: bool) -> Self {
        self.warp_routing_enabled = Some(enabled);
        self
    }
}

/// Parsed `config.yml`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceRecord {
    doc: Mapping,
}

impl ServiceRecord {
    /// An empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML document
    ///
    /// Empty and comment-only documents produce an empty record. Anything
    /// other than a mapping at the top level is rejected.
    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        let has_content = content.lines().any(|line| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#') && line != "---"
        });
        if !has_content {
            return Ok(Self::new());
        }

        match serde_yaml::from_str::<Value>(content)? {
            Value::Mapping(doc) => Ok(Self { doc }),
            Value::Null => Ok(Self::new()),
            other => Err(serde_yaml::Error::custom(format!(
                "expected a mapping at the top level, found {}",
                value_kind(&other)
            ))),
        }
    }

    /// Serialize back to YAML
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.doc)
    }

    /// Raw access to any key, managed or not
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.doc.get(key)
    }

    /// Set an arbitrary key
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.doc.insert(Value::from(key), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.doc.is_empty()
    }

    pub fn tunnel_id(&self) -> Option<String> {
        self.doc.get(TUNNEL_KEY).and_then(scalar_to_string)
    }

    pub fn credentials_file(&self) -> Option<PathBuf> {
        self.doc
            .get(CREDENTIALS_KEY)
            .and_then(scalar_to_string)
            .map(PathBuf::from)
    }

    pub fn url(&self) -> Option<String> {
        self.doc.get(URL_KEY).and_then(scalar_to_string)
    }

    pub fn warp_routing_enabled(&self) -> Option<bool> {
        self.doc
            .get(WARP_ROUTING_KEY)
            .and_then(|warp| warp.get(ENABLED_KEY))
            .and_then(Value::as_bool)
    }

    /// The tunnel identity held by this record, if both required keys are set
    pub fn service_config(&self) -> Option<ServiceConfig> {
        Some(ServiceConfig {
            tunnel_id: self.tunnel_id()?,
            credentials_path: self.credentials_file()?,
            target_url: self.url(),
            warp_routing_enabled: self.warp_routing_enabled(),
        })
    }

    /// Merge a desired tunnel identity into the record
    ///
    /// `tunnel` and `credentials-file` are always overwritten. `url` and
    /// `warp-routing.enabled` are only touched when the desired state sets
    /// them. All other keys are left alone.
    pub fn apply(&mut self, config: &ServiceConfig) {
        self.insert(TUNNEL_KEY, config.tunnel_id.clone());
        self.insert(CREDENTIALS_KEY, path_to_string(&config.credentials_path));

        if let Some(url) = &config.target_url {
            self.insert(URL_KEY, url.clone());
        }

        if let Some(enabled) = config.warp_routing_enabled {
            match self.doc.get_mut(WARP_ROUTING_KEY) {
                Some(Value::Mapping(warp)) => {
                    warp.insert(Value::from(ENABLED_KEY), Value::Bool(enabled));
                }
                _ => {
                    let mut warp = Mapping::new();
                    warp.insert(Value::from(ENABLED_KEY), Value::Bool(enabled));
                    self.doc
                        .insert(Value::from(WARP_ROUTING_KEY), Value::Mapping(warp));
                }
            }
        }
    }
}

/// Canonical textual form of a tunnel identifier
///
/// Surrounding whitespace is dropped and UUIDs are rendered lowercase and
/// hyphenated, so `{ABC...}` style or upper-case ids compare equal.
pub fn normalize_tunnel_id(raw: &str) -> String {
    let trimmed = raw.trim();
    match Uuid::parse_str(trimmed) {
        Ok(id) => id.hyphenated().to_string(),
        Err(_) => trimmed.to_string(),
    }
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_and_comment_only() {
        assert!(ServiceRecord::parse("").unwrap().is_empty());
        assert!(ServiceRecord::parse("   \n\n").unwrap().is_empty());
        assert!(ServiceRecord::parse("# managed by cftun\n---\n")
            .unwrap()
            .is_empty());
        assert!(ServiceRecord::parse("~").unwrap().is_empty());
    }

    #[test]
    fn test_parse_cloudflared_config() {
        let yaml = r#"
tunnel: 6ff42ae2-765d-4adf-8112-31c55c1551ef
credentials-file: /etc/cloudflared/6ff42ae2-765d-4adf-8112-31c55c1551ef.json
url: http://localhost:8000
loglevel: info
"#;
        let record = ServiceRecord::parse(yaml).unwrap();
        assert_eq!(
            record.tunnel_id().as_deref(),
            Some("6ff42ae2-765d-4adf-8112-31c55c1551ef")
        );
        assert_eq!(
            record.credentials_file(),
            Some(PathBuf::from(
                "/etc/cloudflared/6ff42ae2-765d-4adf-8112-31c55c1551ef.json"
            ))
        );
        assert_eq!(record.url().as_deref(), Some("http://localhost:8000"));
        assert_eq!(record.warp_routing_enabled(), None);
        assert!(record.get("loglevel").is_some());
    }

    #[test]
    fn test_parse_rejects_non_mapping() {
        let err = ServiceRecord::parse("- tunnel\n- url\n").unwrap_err();
        assert!(err.to_string().contains("expected a mapping"));

        assert!(ServiceRecord::parse("tunnel: [unclosed").is_err());
    }

    #[test]
    fn test_numeric_tunnel_id_is_rendered_as_text() {
        let record = ServiceRecord::parse("tunnel: 12345\n").unwrap();
        assert_eq!(record.tunnel_id().as_deref(), Some("12345"));
    }

    #[test]
    fn test_apply_preserves_unknown_keys() {
        let yaml = r#"
tunnel: old
credentials-file: /old.json
ingress:
  - hostname: app.example.com
    service: http://localhost:3000
  - service: http_status:404
"#;
        let mut record = ServiceRecord::parse(yaml).unwrap();
        let ingress_before = record.get("ingress").cloned();

        record.apply(&ServiceConfig::new("new", "/new.json"));

        assert_eq!(record.tunnel_id().as_deref(), Some("new"));
        assert_eq!(record.credentials_file(), Some(PathBuf::from("/new.json")));
        assert_eq!(record.get("ingress").cloned(), ingress_before);
    }

    #[test]
    fn test_apply_leaves_url_when_not_provided() {
        let mut record = ServiceRecord::parse("url: http://localhost:9000\n").unwrap();
        record.apply(&ServiceConfig::new("t1", "/c.json"));
        assert_eq!(record.url().as_deref(), Some("http://localhost:9000"));

        record.apply(&ServiceConfig::new("t1", "/c.json").with_target_url("http://localhost:8080"));
        assert_eq!(record.url().as_deref(), Some("http://localhost:8080"));
    }

    #[test]
    fn test_apply_merges_warp_routing() {
        let yaml = r#"
warp-routing:
  enabled: false
  connectTimeout: 30s
"#;
        let mut record = ServiceRecord::parse(yaml).unwrap();
        record.apply(&ServiceConfig::new("t1", "/c.json").with_warp_routing(true));

        assert_eq!(record.warp_routing_enabled(), Some(true));
        let warp = record.get(WARP_ROUTING_KEY).unwrap();
        assert!(warp.get("connectTimeout").is_some());
    }

    #[test]
    fn test_apply_replaces_malformed_warp_routing() {
        let mut record = ServiceRecord::parse("warp-routing: yes-please\n").unwrap();
        record.apply(&ServiceConfig::new("t1", "/c.json").with_warp_routing(true));
        assert_eq!(record.warp_routing_enabled(), Some(true));
    }

    #[test]
    fn test_service_config_requires_tunnel_and_credentials() {
        let record = ServiceRecord::parse("tunnel: t1\n").unwrap();
        assert!(record.service_config().is_none());

        let record = ServiceRecord::parse("tunnel: t1\ncredentials-file: /c.json\n").unwrap();
        let config = record.service_config().unwrap();
        assert_eq!(config, ServiceConfig::new("t1", "/c.json"));
    }

    #[test]
    fn test_yaml_round_trip_is_stable() {
        let mut record = ServiceRecord::new();
        record.apply(
            &ServiceConfig::new("t1", "/tmp/creds.json").with_target_url("http://localhost:8080"),
        );
        let yaml = record.to_yaml().unwrap();
        let reparsed = ServiceRecord::parse(&yaml).unwrap();
        assert_eq!(reparsed, record);
    }

    #[test]
    fn test_normalize_tunnel_id() {
        assert_eq!(
            normalize_tunnel_id("  6FF42AE2-765D-4ADF-8112-31C55C1551EF \n"),
            "6ff42ae2-765d-4adf-8112-31c55c1551ef"
        );
        assert_eq!(
            normalize_tunnel_id("6ff42ae2765d4adf811231c55c1551ef"),
            "6ff42ae2-765d-4adf-8112-31c55c1551ef"
        );
        assert_eq!(normalize_tunnel_id(" my-tunnel "), "my-tunnel");
    }
}
