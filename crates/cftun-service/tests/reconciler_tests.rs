//! Integration tests for service config reconciliation

use cftun_service::{
    ConfigReconciler, Problem, ReconcilerConfig, RecordState, RegistryError, ServiceConfig,
    ServiceRecord, TunnelInfo, TunnelRegistry, TunnelSummary,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Registry that knows a fixed set of tunnels
struct StaticRegistry {
    tunnels: Vec<TunnelSummary>,
}

impl TunnelRegistry for StaticRegistry {
    fn list_tunnels(&self) -> Result<Vec<TunnelSummary>, RegistryError> {
        Ok(self.tunnels.clone())
    }

    fn tunnel_info(&self, tunnel_id: &str) -> Result<TunnelInfo, RegistryError> {
        self.tunnels
            .iter()
            .find(|t| t.id == tunnel_id)
            .map(|t| TunnelInfo::parse(&format!("NAME: {}\nID: {}\n", t.name, t.id)))
            .ok_or_else(|| RegistryError::TunnelNotFound(tunnel_id.to_string()))
    }
}

fn setup() -> (TempDir, ConfigReconciler<StaticRegistry>) {
    let temp = TempDir::new().unwrap();
    let registry = StaticRegistry {
        tunnels: vec![TunnelSummary {
            id: "t1".to_string(),
            name: "web".to_string(),
            created_at: None,
            credentials_file: None,
        }],
    };
    let reconciler =
        ConfigReconciler::new(ReconcilerConfig::in_dir(temp.path().join("svc")), registry);
    (temp, reconciler)
}

fn write_credentials(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, br#"{"AccountTag":"acct","TunnelSecret":"c2VjcmV0","TunnelID":"t1"}"#)
        .unwrap();
    path
}

fn desired(creds: &Path) -> ServiceConfig {
    ServiceConfig::new("t1", creds).with_target_url("http://localhost:8080")
}

fn load(reconciler: &ConfigReconciler<StaticRegistry>) -> ServiceRecord {
    match reconciler.read().unwrap() {
        RecordState::Present(record) => record,
        RecordState::Absent => panic!("Expected a service config record"),
    }
}

#[test]
fn test_reconcile_then_verify_is_clean() {
    let (temp, reconciler) = setup();
    let creds = write_credentials(temp.path(), "creds.json");

    reconciler.reconcile(&desired(&creds)).unwrap();
    let verification = reconciler.verify(&desired(&creds)).unwrap();

    assert!(verification.ok);
    assert!(verification.problems.is_empty());
    assert!(!verification.auto_fixed);
}

#[test]
fn test_reconcile_is_idempotent() {
    let (temp, reconciler) = setup();
    let creds = write_credentials(temp.path(), "creds.json");

    let path = reconciler.reconcile(&desired(&creds)).unwrap();
    let once = fs::read(&path).unwrap();

    reconciler.reconcile(&desired(&creds)).unwrap();
    let twice = fs::read(&path).unwrap();

    assert_eq!(once, twice);
}

#[test]
fn test_unknown_keys_survive_reconcile() {
    let (temp, reconciler) = setup();
    let creds = write_credentials(temp.path(), "creds.json");
    let config_path = reconciler.locate().unwrap();
    fs::create_dir_all(config_path.parent().unwrap()).unwrap();
    fs::write(
        &config_path,
        r#"tunnel: old-tunnel
credentials-file: /old/creds.json
loglevel: debug
ingress:
  - hostname: app.example.com
    service: http://localhost:3000
  - service: http_status:404
"#,
    )
    .unwrap();

    reconciler.reconcile(&desired(&creds)).unwrap();

    let record = load(&reconciler);
    assert_eq!(record.tunnel_id().as_deref(), Some("t1"));
    assert_eq!(record.get("loglevel").and_then(|v| v.as_str()), Some("debug"));
    let ingress = record.get("ingress").and_then(|v| v.as_sequence()).unwrap();
    assert_eq!(ingress.len(), 2);
}

#[test]
fn test_verify_absent_record_reports_only_missing_file_then_fixes() {
    let (temp, reconciler) = setup();
    let creds = write_credentials(temp.path(), "creds.json");

    let verification = reconciler.verify(&desired(&creds)).unwrap();

    assert!(!verification.ok);
    assert_eq!(verification.problems.len(), 1);
    assert!(matches!(
        verification.problems[0],
        Problem::Missing { .. }
    ));
    assert!(verification.auto_fixed);

    // The auto-fix left a valid record behind
    let record = load(&reconciler);
    assert_eq!(record.service_config().unwrap(), desired(&creds));
}

#[test]
fn test_verify_tunnel_mismatch_then_clean() {
    let (temp, reconciler) = setup();
    let creds = write_credentials(temp.path(), "creds.json");
    let expected = ServiceConfig::new("abc-123", &creds);

    reconciler
        .reconcile(&ServiceConfig::new("xyz-999", &creds))
        .unwrap();

    let verification = reconciler.verify(&expected).unwrap();
    assert!(!verification.ok);
    assert_eq!(
        verification.problems,
        vec![Problem::TunnelMismatch {
            expected: "abc-123".to_string(),
            actual: Some("xyz-999".to_string()),
        }]
    );

    let again = reconciler.verify(&expected).unwrap();
    assert!(again.ok);
    assert!(again.problems.is_empty());
}

#[test]
fn test_verify_collects_every_mismatch() {
    let (temp, reconciler) = setup();
    let creds = write_credentials(temp.path(), "creds.json");
    let other_creds = write_credentials(temp.path(), "other.json");

    reconciler
        .reconcile(&ServiceConfig::new("xyz-999", &other_creds).with_target_url("http://localhost:1"))
        .unwrap();

    let verification = reconciler
        .check(&ServiceConfig::new("abc-123", &creds).with_target_url("http://localhost:2"))
        .unwrap();

    assert_eq!(verification.problems.len(), 3);
    assert!(matches!(
        verification.problems[0],
        Problem::TunnelMismatch { .. }
    ));
    assert!(matches!(
        verification.problems[1],
        Problem::CredentialsMismatch { .. }
    ));
    assert!(matches!(
        verification.problems[2],
        Problem::UrlMismatch { .. }
    ));
    assert!(!verification.auto_fixed);
}

#[test]
fn test_url_is_only_compared_when_expected() {
    let (temp, reconciler) = setup();
    let creds = write_credentials(temp.path(), "creds.json");
    reconciler.reconcile(&desired(&creds)).unwrap();

    let verification = reconciler
        .check(&ServiceConfig::new("t1", &creds))
        .unwrap();
    assert!(verification.ok);
}

#[test]
fn test_fresh_setup_scenario() {
    let (temp, reconciler) = setup();
    let creds = write_credentials(temp.path(), "creds.json");

    assert_eq!(reconciler.read().unwrap(), RecordState::Absent);

    let path = reconciler.reconcile(&desired(&creds)).unwrap();
    assert_eq!(path, temp.path().join("svc").join("config.yml"));

    let record = load(&reconciler);
    assert_eq!(record.tunnel_id().as_deref(), Some("t1"));
    assert_eq!(record.credentials_file(), Some(creds.clone()));
    assert_eq!(record.url().as_deref(), Some("http://localhost:8080"));

    let copied = temp.path().join("svc").join("creds.json");
    assert_eq!(fs::read(&copied).unwrap(), fs::read(&creds).unwrap());

    let diagnosis = reconciler.diagnose().unwrap();
    assert_eq!(diagnosis.credentials_found, Some(true));
    let report = diagnosis.to_string();
    assert!(report.contains("(found)"));
    assert!(report.contains("name: web"));
}

#[test]
fn test_reconcile_overwrites_copied_credentials() {
    let (temp, reconciler) = setup();
    let creds = write_credentials(temp.path(), "creds.json");
    reconciler.reconcile(&desired(&creds)).unwrap();

    fs::write(&creds, b"rotated").unwrap();
    reconciler.reconcile(&desired(&creds)).unwrap();

    let copied = temp.path().join("svc").join("creds.json");
    assert_eq!(fs::read(&copied).unwrap(), b"rotated");
}

#[test]
fn test_warp_routing_record() {
    let (temp, reconciler) = setup();
    let creds = write_credentials(temp.path(), "creds.json");

    reconciler
        .reconcile(&ServiceConfig::new("t1", &creds).with_warp_routing(true))
        .unwrap();

    let record = load(&reconciler);
    assert_eq!(record.url(), None);
    assert_eq!(record.warp_routing_enabled(), Some(true));
}

#[test]
fn test_diagnose_unknown_tunnel_is_reported_not_raised() {
    let (temp, reconciler) = setup();
    let creds = write_credentials(temp.path(), "creds.json");
    reconciler
        .reconcile(&ServiceConfig::new("ghost", &creds))
        .unwrap();

    let report = reconciler.diagnose().unwrap().to_string();
    assert!(report.contains("Tunnel details unavailable: Tunnel 'ghost' not found"));
}

#[test]
fn test_diagnose_corrupt_record() {
    let (_temp, reconciler) = setup();
    let config_path = reconciler.locate().unwrap();
    fs::create_dir_all(config_path.parent().unwrap()).unwrap();
    fs::write(&config_path, "tunnel: [broken").unwrap();

    let report = reconciler.diagnose().unwrap().to_string();
    assert!(report.contains("Status: unparseable"));
}
