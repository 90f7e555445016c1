use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

const CONFIG: &str = r#"
[podfork]
fork_count = 2

[cluster]
image = "registry/tests:1"

[distribution]
seed = 3
revision = "abc123"
durations_file = "DURATIONS"
"#;

fn podfork() -> Command {
    let mut cmd = Command::cargo_bin("podfork").unwrap();
    cmd.env("RUST_LOG", "off");
    cmd
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let durations = dir.join("durations.csv");
    let path = dir.join("podfork.toml");
    std::fs::write(
        &path,
        CONFIG.replace("DURATIONS", &durations.to_string_lossy()),
    )
    .unwrap();
    path
}

#[test]
fn validate_accepts_minimal_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    podfork()
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("Forks: 2"));
}

#[test]
fn validate_rejects_zero_forks() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("podfork.toml");
    std::fs::write(
        &config,
        "[podfork]\nfork_count = 0\n[cluster]\nimage = \"x\"\n",
    )
    .unwrap();

    podfork()
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("fork_count"));
}

#[test]
fn plan_prints_every_fork() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let tests = dir.path().join("tests.txt");
    std::fs::write(
        &tests,
        "# candidates\n:core:test\tnet.corda.core.FooTest\nnet.corda.core.BarTest\n",
    )
    .unwrap();

    podfork()
        .arg("--config")
        .arg(&config)
        .args(["plan", "--task", ":core:test", "--tests"])
        .arg(&tests)
        .assert()
        .success()
        .stdout(predicate::str::contains("fork 0"))
        .stdout(predicate::str::contains("fork 1"))
        .stdout(predicate::str::contains("net.corda.core.FooTest*"))
        .stdout(predicate::str::contains("net.corda.core.BarTest*"));
}

#[test]
fn plan_json_honours_fork_override() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let tests = dir.path().join("tests.txt");
    std::fs::write(&tests, ":a:test\ta.One\n:a:test\ta.Two\n:a:test\ta.Three\n").unwrap();

    let output = podfork()
        .arg("--config")
        .arg(&config)
        .args(["plan", "--json", "--forks", "3", "--tests"])
        .arg(&tests)
        .output()
        .unwrap();
    assert!(output.status.success());

    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let forks = plan["forks"].as_array().unwrap();
    assert_eq!(forks.len(), 3);
    let total: usize = forks
        .iter()
        .map(|f| f["filters"][":a:test"].as_array().map_or(0, Vec::len))
        .sum();
    assert_eq!(total, 3);
}

#[test]
fn plan_requires_a_task_for_bare_prefixes() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let tests = dir.path().join("tests.txt");
    std::fs::write(&tests, "a.One\n").unwrap();

    podfork()
        .arg("--config")
        .arg(&config)
        .args(["plan", "--tests"])
        .arg(&tests)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no task"));
}

#[test]
fn durations_update_writes_store() {
    let dir = tempfile::tempdir().unwrap();
    let results = dir.path().join("results/test");
    std::fs::create_dir_all(&results).unwrap();
    std::fs::write(
        results.join("TEST-a.B.xml"),
        r#"<testsuite><testcase classname="a.B" name="c" time="1.5"/></testsuite>"#,
    )
    .unwrap();
    let store = dir.path().join("store/durations.csv");

    podfork()
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .args(["durations", "update", "--results"])
        .arg(dir.path().join("results"))
        .arg("--store")
        .arg(&store)
        .assert()
        .success();

    let csv = std::fs::read_to_string(&store).unwrap();
    assert!(csv.starts_with("Test Name,Mean Duration (nanos),Runs"));
    assert!(csv.contains("a.B.c,1500000000,1"));
}

#[test]
fn durations_update_skips_malformed_files() {
    let dir = tempfile::tempdir().unwrap();
    let results = dir.path().join("results/test");
    std::fs::create_dir_all(&results).unwrap();
    std::fs::write(results.join("TEST-broken.xml"), "<testsuite><testcase></testsuite>").unwrap();
    std::fs::write(
        results.join("TEST-a.B.xml"),
        r#"<testsuite><testcase classname="a.B" name="c" time="1.5"/></testsuite>"#,
    )
    .unwrap();
    let store = dir.path().join("durations.csv");

    podfork()
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .args(["durations", "update", "--results"])
        .arg(dir.path().join("results"))
        .arg("--store")
        .arg(&store)
        .assert()
        .success();

    assert!(std::fs::read_to_string(&store).unwrap().contains("a.B.c,1500000000,1"));
}

#[test]
fn cleanup_requires_task() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    podfork()
        .arg("--config")
        .arg(&config)
        .arg("cleanup")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--task"));
}
