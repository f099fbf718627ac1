//! Command-line behaviour of `convergectl`

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

const SERVICES: &str = r#"
services:
  - name: keycloak
    namespace: data
    chart_ref: bitnami/keycloak
    chart_version: 21.0.0
    workload_kind: deployment
    workload_selector: app.kubernetes.io/instance=keycloak
    secret_name: keycloak
    credential_keys: [admin-password]
    depends_on: [postgresql]
  - name: postgresql
    namespace: data
    chart_ref: bitnami/postgresql
    chart_version: 15.5.0
    workload_selector: app.kubernetes.io/instance=postgresql
    secret_name: postgresql
    credential_keys: [postgres-password]
    credential_value_paths:
      postgres-password: auth.postgresPassword
"#;

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn convergectl(config: &NamedTempFile) -> Command {
    let mut cmd = Command::cargo_bin("convergectl").unwrap();
    cmd.env_remove("CONVERGE_CREDENTIALS__MASTER")
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(config.path());
    cmd
}

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("convergectl")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("converge"))
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("validate"));
}

#[test]
fn validate_prints_dependency_order() {
    let config = config_file(&format!("credentials:\n  master: s3cret\n{SERVICES}"));

    let output = convergectl(&config)
        .args(["--output", "json", "validate"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let rows: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(rows[0]["service"], "postgresql");
    assert_eq!(rows[1]["service"], "keycloak");
    assert_eq!(rows[1]["depends_on"], "postgresql");
}

#[test]
fn validate_fails_without_credentials() {
    let config = config_file(SERVICES);

    convergectl(&config)
        .arg("validate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("No value for credential"));
}

#[test]
fn master_credential_from_environment() {
    let config = config_file(SERVICES);

    convergectl(&config)
        .env("CONVERGE_CREDENTIALS__MASTER", "from-env")
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn dependency_cycle_is_a_configuration_error() {
    let config = config_file(
        r#"
services:
  - name: a
    namespace: data
    chart_ref: repo/a
    chart_version: 1.0.0
    workload_selector: app=a
    secret_name: a
    depends_on: [b]
  - name: b
    namespace: data
    chart_ref: repo/b
    chart_version: 1.0.0
    workload_selector: app=b
    secret_name: b
    depends_on: [a]
"#,
    );

    convergectl(&config)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Dependency cycle"));
}

#[test]
fn unknown_service_selection_is_rejected_before_any_call() {
    let config = config_file(&format!(
        "credentials:\n  master: s3cret\nplatform:\n  helm_bin: /nonexistent/helm\n{SERVICES}"
    ));

    convergectl(&config)
        .args(["converge", "--service", "mongodb"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unknown service selected: mongodb"));
}

#[test]
fn unreachable_platform_aborts_with_report() {
    let config = config_file(&format!(
        r#"
engine:
  retry:
    max_attempts: 2
    initial_backoff_ms: 0
credentials:
  master: s3cret
platform:
  helm_bin: /nonexistent/helm
{SERVICES}"#
    ));

    let output = convergectl(&config)
        .args(["--output", "json", "plan"])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();

    let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(report["dry_run"], true);
    assert!(report["aborted"].as_str().unwrap().contains("release status"));
    assert_eq!(report["services"][0]["service"], "postgresql");
    assert_eq!(report["services"][0]["status"], "failed");
    assert_eq!(report["services"][1]["status"], "not-attempted");
}

#[test]
fn empty_configuration_has_nothing_to_do() {
    let config = config_file("credentials:\n  master: s3cret\n");

    convergectl(&config)
        .arg("converge")
        .assert()
        .success()
        .stdout(predicate::str::contains("No services configured"));
}
