//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;

#[test]
fn cli_without_a_subcommand_prints_usage() {
    let mut cmd = cargo_bin_cmd!("corral");
    cmd.assert().code(2).stderr(contains("Usage"));
}

#[test]
fn sweep_requires_a_scope() {
    let mut cmd = cargo_bin_cmd!("corral");
    cmd.env_remove("CORRAL_SCOPE")
        .env_remove("CORRAL_NAMESPACE")
        .arg("sweep")
        .assert()
        .code(2)
        .stderr(contains("--scope"));
}

#[test]
fn sweep_reports_a_missing_kubectl() {
    let mut cmd = cargo_bin_cmd!("corral");
    cmd.args([
        "sweep",
        "--namespace",
        "corral-ci",
        "--scope",
        "run-42",
        "--kubectl-bin",
        "/nonexistent/kubectl",
    ])
    .assert()
    .code(1)
    .stdout("")
    .stderr(contains("corral: sweep failed: failed to spawn /nonexistent/kubectl"));
}
