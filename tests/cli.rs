//! CLI smoke tests. Nothing here touches Docker or the network.

use assert_cmd::Command;

#[test]
fn test_catalog_lists_builtin_tools() {
    let output = Command::cargo_bin("straylight")
        .expect("binary")
        .arg("catalog")
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&output.get_output().stdout).into_owned();
    for tool in ["subdomain-scanner", "port-scanner", "sql-injection", "api-fuzzer"] {
        assert!(stdout.contains(tool), "catalog output missing {tool}");
    }
}

#[test]
fn test_rules_prints_default_set() {
    let output = Command::cargo_bin("straylight")
        .expect("binary")
        .arg("rules")
        .env_remove("STRAYLIGHT_RULES_FILE")
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&output.get_output().stdout).into_owned();
    assert!(
        stdout.contains("production-exploit-approval"),
        "default rules missing, got: {stdout}"
    );
}

#[test]
fn test_run_requires_target() {
    Command::cargo_bin("straylight")
        .expect("binary")
        .args(["run", "--intent", "scan"])
        .assert()
        .failure();
}
