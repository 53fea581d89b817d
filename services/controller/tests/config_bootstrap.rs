//! Tests for settings resolution from files and the pod environment.

use std::io::Write;

use podpool_controller::config::{EnvSnapshot, Settings, SERVER_ADDR_VAR};
use podpool_controller::error::ConfigError;
use podpool_id::PoolName;

fn pod_environment() -> EnvSnapshot {
    EnvSnapshot::new()
        .with_var(SERVER_ADDR_VAR, "10.0.0.5")
        .with_var("KUBERNETES_SERVICE_HOST", "10.96.0.1")
        .with_var("KUBERNETES_SERVICE_PORT", "443")
        .with_service_account_file("namespace", "ci\n")
        .with_service_account_file("token", "sa-token\n")
        .with_service_account_file("ca.crt", "-----BEGIN CERTIFICATE-----\n")
}

#[test]
fn test_missing_server_address_is_fatal() {
    let env = EnvSnapshot::new()
        .with_var("KUBERNETES_SERVICE_HOST", "10.96.0.1")
        .with_var("KUBERNETES_SERVICE_PORT", "443");

    let err = Settings::load(None, &env).unwrap_err();
    assert!(matches!(err, ConfigError::Missing(_)));
}

#[test]
fn test_blank_variable_counts_as_missing() {
    let env = pod_environment().with_var("KUBERNETES_SERVICE_HOST", "  ");
    assert!(matches!(
        Settings::load(None, &env).unwrap_err(),
        ConfigError::Missing(_)
    ));
}

#[test]
fn test_missing_service_account_file_is_fatal() {
    let env = EnvSnapshot::new()
        .with_var(SERVER_ADDR_VAR, "10.0.0.5")
        .with_var("KUBERNETES_SERVICE_HOST", "10.96.0.1")
        .with_var("KUBERNETES_SERVICE_PORT", "443")
        .with_service_account_file("namespace", "ci");

    assert!(matches!(
        Settings::load(None, &env).unwrap_err(),
        ConfigError::Missing(_)
    ));
}

#[test]
fn test_environment_overrides() {
    let env = pod_environment()
        .with_var("PODPOOL_MAX_PENDING_INSTANCES", "4")
        .with_var("PODPOOL_AUTO_REGISTER_TIMEOUT_MINUTES", "2")
        .with_var("PODPOOL_AGENT_PLUGIN_ID", "k8s-elastic");

    let settings = Settings::load(None, &env).unwrap();

    assert_eq!(settings.max_pending_instances, 4);
    assert_eq!(settings.auto_register_timeout().as_secs(), 120);
    assert_eq!(settings.agent_plugin_id, "k8s-elastic");
}

#[test]
fn test_register_timeout_beyond_clock_range_rejected() {
    // The first overflows the clock range, the second overflows seconds.
    for minutes in ["200000000000000", "18446744073709551615"] {
        let env = pod_environment().with_var("PODPOOL_AUTO_REGISTER_TIMEOUT_MINUTES", minutes);
        assert!(matches!(
            Settings::load(None, &env).unwrap_err(),
            ConfigError::Invalid { field: "auto_register_timeout_minutes", .. }
        ));
    }
}

#[test]
fn test_load_from_file_with_pool_ceilings() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
server_url = "https://gocd.example.com/go"
cluster_url = "https://k8s.example.com"
security_token = "token"
namespace = "ci"
max_pending_instances = 5
use_profile_pending_count = true

[pools.windows]
max_pending_instances = 1

[pools.linux]
"#
    )
    .unwrap();

    let settings = Settings::load(Some(file.path()), &EnvSnapshot::new()).unwrap();
    let ceilings = settings.ceilings();

    let windows: PoolName = "windows".parse().unwrap();
    let linux: PoolName = "linux".parse().unwrap();
    assert_eq!(ceilings.ceiling_for(&windows), 1);
    assert_eq!(ceilings.ceiling_for(&linux), 5);
}

#[test]
fn test_pool_ceilings_ignored_without_profile_flag() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
server_url = "https://gocd.example.com/go"
cluster_url = "https://k8s.example.com"
security_token = "token"
max_pending_instances = 5

[pools.windows]
max_pending_instances = 1
"#
    )
    .unwrap();

    let settings = Settings::load(Some(file.path()), &EnvSnapshot::new()).unwrap();
    let windows: PoolName = "windows".parse().unwrap();
    assert_eq!(settings.ceilings().ceiling_for(&windows), 5);
}

#[test]
fn test_unknown_field_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
server_url = "https://gocd.example.com/go"
cluster_url = "https://k8s.example.com"
security_token = "token"
pending_pods = 3
"#
    )
    .unwrap();

    let err = Settings::load(Some(file.path()), &EnvSnapshot::new()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = Settings::load(Some(&dir.path().join("absent.toml")), &EnvSnapshot::new())
        .unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}
